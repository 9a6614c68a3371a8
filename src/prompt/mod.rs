//! Prompt templates.
//!
//! Pure functions mapping (chunk text, concern, surrounding context) to a
//! single prompt string. The only variation points are the substituted code
//! and the concern-specific guidance; identical inputs always produce
//! byte-identical prompts, so these are safe to call from any worker.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Bug-category focus steering prompt content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concern {
    Privacy,
    Security,
    Correctness,
    Performance,
}

impl Concern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Privacy => "privacy",
            Self::Security => "security",
            Self::Correctness => "correctness",
            Self::Performance => "performance",
        }
    }

    /// Guidance text substituted into mutation/oracle prompts.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::Privacy => {
                "Privacy violations in user data handling:\n\
                 - Logging personally identifiable information (emails, names, IDs) without sanitization\n\
                 - Exposing password hashes, salts, or authentication tokens in responses\n\
                 - Missing authorization checks allowing unauthorized data access\n\
                 - Storing sensitive data unencrypted or in application logs"
            }
            Self::Security => {
                "Security vulnerabilities:\n\
                 - SQL injection or command injection through unsanitized input\n\
                 - Authentication or authorization bypass\n\
                 - Missing input validation on untrusted data\n\
                 - Insecure handling of secrets or session tokens"
            }
            Self::Correctness => {
                "Correctness bugs:\n\
                 - Off-by-one errors in loops, slices, and boundary comparisons\n\
                 - None/null handling mistakes and missing edge cases\n\
                 - Inverted or weakened conditional logic\n\
                 - Wrong operator or operand order in computations"
            }
            Self::Performance => {
                "Performance issues:\n\
                 - Accidentally quadratic algorithms on hot paths\n\
                 - Redundant recomputation inside loops\n\
                 - Unbounded growth of caches or accumulators\n\
                 - Blocking or repeated I/O where one call suffices"
            }
        }
    }

    /// A concrete example bug, in the style of a fix the team has seen,
    /// substituted into the mutant-generation prompt.
    pub fn example_diff(&self) -> &'static str {
        match self {
            Self::Privacy => {
                "Real bug example: a user profile endpoint returned password_hash \
                 and salt_hex fields in its JSON response, exposing sensitive \
                 authentication data. The fix removed these fields from the \
                 public() method."
            }
            Self::Security => {
                "Real bug example: a lookup endpoint interpolated a caller-supplied \
                 identifier directly into a query string, allowing injection. The \
                 fix switched to a parameterized query."
            }
            Self::Correctness => {
                "Real bug example: a pagination helper sliced items[start:end] with \
                 end computed as start + page_size - 1, silently dropping the last \
                 item of every page. The fix removed the off-by-one."
            }
            Self::Performance => {
                "Real bug example: a deduplication helper checked membership with a \
                 list inside a loop, turning a linear pass quadratic. The fix used \
                 a set."
            }
        }
    }
}

impl std::fmt::Display for Concern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Prompt asking the model to propose chunk boundaries for a Python file.
/// The response is expected to be a JSON object; see the chunker for the
/// validation applied to each proposed chunk.
pub fn propose_chunks(code: &str) -> String {
    format!(
        r#"Analyze this Python file and break it into chunks for mutation testing.

FILE:
```python
{code}
```

TASK: Split this file into logical chunks where each chunk is either:
- a complete function or method (mutable)
- a complete class (mutable)
- module-level code like imports, constants, or main blocks (NOT mutable)

RULES:
1. The "code" of every chunk must be copied EXACTLY from the file above,
   preserving all whitespace, blank lines, and comments.
2. Chunks must not overlap, and must appear in file order.
3. Mark imports, constants, and configuration as NOT mutable.
4. Mark functions, methods, and classes as mutable (except dunder methods
   like __init__ or __str__).

Return ONLY valid JSON:
{{
  "chunks": [
    {{"chunk_id": "imports", "is_mutable": false, "code": "import os\n\n"}},
    {{"chunk_id": "function_name", "is_mutable": true, "code": "def function_name():\n    pass\n"}}
  ]
}}"#
    )
}

/// Prompt asking for a mutated version of one chunk containing a subtle,
/// concern-specific bug that the existing tests do not catch.
pub fn make_fault(
    chunk_code: &str,
    chunk_kind: &str,
    existing_tests: &str,
    concern: Concern,
) -> String {
    format!(
        r#"CONTEXT: {guidance}

This is a standalone {chunk_kind}.

CODE TO MUTATE:
'''{chunk_code}'''

EXISTING TESTS:
'''{existing_tests}'''

INSTRUCTION: Write a mutated version of the code above that introduces a SUBTLE bug representing a {concern} violation similar to: {diff}

Requirements:
1. The bug should be SUBTLE enough that all existing tests still pass
2. Do not completely remove functionality - introduce edge cases or partial failures
3. The mutation should be realistic (something that could happen in real code)
4. Preserve the function/method signature and overall structure
5. Delimit ONLY the mutated lines using the comment-pair '# MUTANT START' and '# MUTANT END'

Return the COMPLETE mutated code in a ```python fenced block (not just the changed lines)."#,
        guidance = concern.guidance(),
        diff = concern.example_diff(),
        concern = concern.as_str(),
    )
}

/// Prompt asking whether two versions of the code are behaviorally
/// equivalent. The model answers "yes" or "no" with an explanation.
pub fn equivalence_check(version1: &str, version2: &str) -> String {
    format!(
        "I'm going to show you two slightly different versions of some Python code. \
         Here is the first version:'''{version1}'''. \
         Here is the second version:'''{version2}'''. \
         INSTRUCTION: If the first version will always do exactly the same thing as \
         the second version, just respond with 'yes'. However, if the two versions \
         are not equivalent, respond with 'no', and give an explanation of how \
         execution of the first version can produce a different behaviour to \
         execution of the second version."
    )
}

/// Prompt asking for an extended test class that kills the mutant: extra
/// tests that fail on the mutated file but pass on the original.
pub fn make_killer_test(original_file: &str, mutated_file: &str, existing_tests: &str) -> String {
    format!(
        "What follows is two versions of a Python module under test. An original \
         correct module and a mutated version that contains a bug delimited by the \
         comment-pair '# MUTANT START' and '# MUTANT END'. They are followed by a \
         test file containing unit tests for the original correct module. \
         This is the original version of the module under test:'''{original_file}'''. \
         This is the mutated version of the module under test:'''{mutated_file}'''. \
         Here is the existing test file:'''{existing_tests}'''. \
         Write an extended version of the test file that contains extra test cases \
         that will fail on the mutated version of the module, but would pass on the \
         correct version. Return the COMPLETE test file in a ```python fenced block."
    )
}

/// Prompt asking for several distinct throwaway mutants of one chunk, used
/// as raw material for oracle inference.
pub fn make_mutant_batch(chunk_code: &str, concern: Concern, count: usize) -> String {
    format!(
        r#"CONTEXT: {guidance}

CODE:
'''{chunk_code}'''

INSTRUCTION: Generate {count} DIFFERENT mutated versions of the code above. Each
mutant should introduce one small, realistic bug related to {concern}. The
mutants must be distinct from each other and from the original.

For each mutant, return the complete mutated code delimited by a line
'# MUTANT START' before it and a line '# MUTANT END' after it."#,
        guidance = concern.guidance(),
        concern = concern.as_str(),
    )
}

/// Prompt asking the model to infer an oracle specification from the
/// original chunk and a set of plausible mutants of it.
pub fn infer_oracle(chunk_code: &str, mutants: &[String], concern: Concern) -> String {
    let mut numbered = String::new();
    for (i, mutant) in mutants.iter().enumerate() {
        numbered.push_str(&format!("MUTANT {}:\n'''{}'''\n\n", i + 1, mutant));
    }
    format!(
        r#"Here is a Python code chunk:
'''{chunk_code}'''

Here are {count} plausible buggy variants of it:

{numbered}INSTRUCTION: Infer an ORACLE SPECIFICATION for the original chunk: a precise,
testable description of the behaviour a correct implementation must have,
focused on {concern}, such that each of the buggy variants above would violate
it. State the specification as a numbered list of properties. If the ORIGINAL
chunk itself violates one of these properties, say so explicitly."#,
        count = mutants.len(),
        concern = concern.as_str(),
    )
}

/// Prompt asking for a test file that checks the chunk against an oracle
/// specification, extending the existing test file.
pub fn test_from_oracle(
    chunk_code: &str,
    oracle: &str,
    chunk_id: &str,
    existing_tests: &str,
) -> String {
    format!(
        r#"Here is a Python code chunk named '{chunk_id}':
'''{chunk_code}'''

Here is an oracle specification of its required behaviour:
'''{oracle}'''

Here is the existing test file for the module it belongs to:
'''{existing_tests}'''

INSTRUCTION: Write an extended version of the test file that adds test cases
checking '{chunk_id}' against every property of the oracle specification. The
new tests must run against the module AS IT IS — if the current implementation
violates a property, the corresponding test should fail. Keep the existing
tests and their style. Return the COMPLETE test file in a ```python fenced
block."#
    )
}

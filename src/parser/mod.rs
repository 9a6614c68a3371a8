//! Response parsing.
//!
//! The model's output is freeform text; nothing in it is trusted. Extraction
//! returns a tagged result — a payload that survived validation, or a
//! `ParseError` the pipeline treats as a chunk-level failure.

use crate::error::ParseError;
use tree_sitter::Parser;

/// Which code payload to extract when a response contains several blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// The module (mutant) source: models tend to lead with it.
    Module,
    /// The test source: models tend to put the final artifact last.
    Test,
}

struct FencedBlock {
    lang: String,
    body: String,
}

/// Scan out all fenced code blocks. An unterminated final fence yields its
/// partial body; a closing fence outside a block is ignored.
fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<FencedBlock> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match current.take() {
                Some(block) => blocks.push(block),
                None => {
                    current = Some(FencedBlock {
                        lang: rest.trim().to_ascii_lowercase(),
                        body: String::new(),
                    });
                }
            }
        } else if let Some(block) = current.as_mut() {
            block.body.push_str(line);
            block.body.push('\n');
        }
    }

    if let Some(block) = current {
        if !block.body.trim().is_empty() {
            blocks.push(block);
        }
    }

    blocks
}

/// Extract a code block of the expected kind from a raw model response.
///
/// Python-tagged blocks are preferred over untagged ones; `kind` selects the
/// first (`Module`) or last (`Test`) candidate. The extracted text must parse
/// as valid Python or the whole extraction fails.
pub fn extract_code(raw: &str, kind: CodeKind) -> Result<String, ParseError> {
    let blocks = fenced_blocks(raw);

    let tagged: Vec<&FencedBlock> = blocks.iter().filter(|b| b.lang == "python" || b.lang == "py").collect();
    let untagged: Vec<&FencedBlock> = blocks.iter().filter(|b| b.lang.is_empty()).collect();

    let candidates = if !tagged.is_empty() { tagged } else { untagged };
    if candidates.is_empty() {
        return Err(ParseError::NoCodeBlock);
    }

    let selected = match kind {
        CodeKind::Module => candidates.first(),
        CodeKind::Test => candidates.last(),
    }
    .map(|b| b.body.clone())
    .ok_or(ParseError::NoCodeBlock)?;

    // Models sometimes emit C-style markers even for Python.
    let selected = selected.replace("// MUTANT", "# MUTANT");

    if !is_valid_python(&selected) {
        return Err(ParseError::InvalidSyntax);
    }

    Ok(selected)
}

/// Extract a JSON object from a response: a ```json fenced block if present,
/// otherwise the outermost brace-delimited span.
pub fn extract_json(raw: &str) -> Result<serde_json::Value, ParseError> {
    let blocks = fenced_blocks(raw);
    let candidate = blocks
        .iter()
        .find(|b| b.lang == "json" || (b.lang.is_empty() && b.body.trim_start().starts_with('{')))
        .map(|b| b.body.clone())
        .or_else(|| {
            let start = raw.find('{')?;
            let end = raw.rfind('}')?;
            (end > start).then(|| raw[start..=end].to_string())
        })
        .ok_or(ParseError::NoJson)?;

    serde_json::from_str(&candidate).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

/// Extract a batch of mutants delimited by '# MUTANT START' / '# MUTANT END'
/// marker lines, falling back to fenced Python blocks. Syntactically invalid
/// entries are dropped, not fatal.
pub fn extract_mutant_batch(raw: &str, expected: usize) -> Vec<String> {
    let mut mutants = marker_delimited_mutants(raw);

    if mutants.is_empty() {
        mutants = fenced_blocks(raw)
            .into_iter()
            .filter(|b| b.lang == "python" || b.lang == "py" || b.lang.is_empty())
            .map(|b| b.body)
            .take(expected)
            .collect();
    }

    mutants
        .into_iter()
        .map(|m| m.trim_matches('\n').to_string())
        .filter(|m| !m.is_empty())
        .filter(|m| {
            let ok = is_valid_python(m);
            if !ok {
                tracing::debug!("Dropping syntactically invalid mutant from batch");
            }
            ok
        })
        .take(expected)
        .collect()
}

fn marker_delimited_mutants(raw: &str) -> Vec<String> {
    let normalized = raw.replace("// MUTANT", "# MUTANT");
    let mut mutants = Vec::new();
    let mut current: Option<String> = None;

    for line in normalized.lines() {
        let marker = line.trim();
        if marker.starts_with("# MUTANT START") {
            current = Some(String::new());
        } else if marker.starts_with("# MUTANT END") {
            if let Some(body) = current.take() {
                mutants.push(body);
            }
        } else if let Some(body) = current.as_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }

    mutants
}

/// Check that the text parses as Python with no error nodes.
pub fn is_valid_python(code: &str) -> bool {
    let mut parser = Parser::new();
    let language = tree_sitter_python::LANGUAGE;
    if parser.set_language(&language.into()).is_err() {
        return false;
    }
    match parser.parse(code, None) {
        Some(tree) => !tree.root_node().has_error(),
        None => false,
    }
}

/// Compare two code fragments after stripping comments and collapsing
/// whitespace. Used to discard mutants that are no-ops.
pub fn syntactically_identical(original: &str, mutated: &str) -> bool {
    normalize(original) == normalize(mutated)
}

fn normalize(code: &str) -> String {
    let mut out = String::new();
    for line in code.lines() {
        // Naive comment strip: good enough for equality checks, the worst
        // case is treating a '#' inside a string as a comment on both sides.
        let line = match line.find('#') {
            Some(idx) => &line[..idx],
            None => line,
        };
        for token in line.split_whitespace() {
            out.push_str(token);
            out.push(' ');
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // extract_code tests
    // =========================================================================

    #[test]
    fn test_extract_code_python_block() {
        let raw = "Here is the mutant:\n```python\ndef f():\n    return 1\n```\nDone.";
        let code = extract_code(raw, CodeKind::Module).unwrap();
        assert_eq!(code, "def f():\n    return 1\n");
    }

    #[test]
    fn test_extract_code_untagged_block() {
        let raw = "```\ndef f():\n    return 1\n```";
        let code = extract_code(raw, CodeKind::Module).unwrap();
        assert!(code.contains("return 1"));
    }

    #[test]
    fn test_extract_code_prefers_tagged_over_untagged() {
        let raw = "```\nnot the payload\n```\n```python\ndef f():\n    pass\n```";
        let code = extract_code(raw, CodeKind::Module).unwrap();
        assert!(code.contains("def f()"));
    }

    #[test]
    fn test_extract_code_module_takes_first() {
        let raw = "```python\ndef first():\n    pass\n```\n```python\ndef second():\n    pass\n```";
        let code = extract_code(raw, CodeKind::Module).unwrap();
        assert!(code.contains("first"));
    }

    #[test]
    fn test_extract_code_test_takes_last() {
        let raw = "```python\ndef first():\n    pass\n```\n```python\ndef test_it():\n    pass\n```";
        let code = extract_code(raw, CodeKind::Test).unwrap();
        assert!(code.contains("test_it"));
    }

    #[test]
    fn test_extract_code_no_block() {
        let raw = "I could not produce a mutation for this chunk.";
        assert!(matches!(
            extract_code(raw, CodeKind::Module),
            Err(ParseError::NoCodeBlock)
        ));
    }

    #[test]
    fn test_extract_code_invalid_python() {
        let raw = "```python\ndef f(:\n```";
        assert!(matches!(
            extract_code(raw, CodeKind::Module),
            Err(ParseError::InvalidSyntax)
        ));
    }

    #[test]
    fn test_extract_code_converts_c_style_markers() {
        let raw = "```python\n// MUTANT START\nx = 1\n// MUTANT END\n```";
        let code = extract_code(raw, CodeKind::Module).unwrap();
        assert!(code.contains("# MUTANT START"));
        assert!(!code.contains("//"));
    }

    // =========================================================================
    // extract_json tests
    // =========================================================================

    #[test]
    fn test_extract_json_fenced() {
        let raw = "```json\n{\"chunks\": []}\n```";
        let value = extract_json(raw).unwrap();
        assert!(value["chunks"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_extract_json_raw_braces() {
        let raw = "Sure! {\"a\": 1} hope that helps";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_extract_json_none() {
        assert!(matches!(extract_json("no json here"), Err(ParseError::NoJson)));
    }

    #[test]
    fn test_extract_json_invalid() {
        assert!(matches!(
            extract_json("{not json}"),
            Err(ParseError::InvalidJson(_))
        ));
    }

    // =========================================================================
    // extract_mutant_batch tests
    // =========================================================================

    #[test]
    fn test_extract_mutant_batch_markers() {
        let raw = "\
# MUTANT START
def f():
    return 1
# MUTANT END
some prose
# MUTANT START
def f():
    return 2
# MUTANT END
";
        let mutants = extract_mutant_batch(raw, 10);
        assert_eq!(mutants.len(), 2);
        assert!(mutants[0].contains("return 1"));
        assert!(mutants[1].contains("return 2"));
    }

    #[test]
    fn test_extract_mutant_batch_fenced_fallback() {
        let raw = "```python\ndef f():\n    return 1\n```\n```python\ndef f():\n    return 2\n```";
        let mutants = extract_mutant_batch(raw, 10);
        assert_eq!(mutants.len(), 2);
    }

    #[test]
    fn test_extract_mutant_batch_drops_invalid() {
        let raw = "\
# MUTANT START
def f(:
# MUTANT END
# MUTANT START
def f():
    return 2
# MUTANT END
";
        let mutants = extract_mutant_batch(raw, 10);
        assert_eq!(mutants.len(), 1);
        assert!(mutants[0].contains("return 2"));
    }

    #[test]
    fn test_extract_mutant_batch_respects_limit() {
        let raw = "\
# MUTANT START
x = 1
# MUTANT END
# MUTANT START
x = 2
# MUTANT END
# MUTANT START
x = 3
# MUTANT END
";
        let mutants = extract_mutant_batch(raw, 2);
        assert_eq!(mutants.len(), 2);
    }

    // =========================================================================
    // validation helpers
    // =========================================================================

    #[test]
    fn test_is_valid_python() {
        assert!(is_valid_python("def f(x):\n    return x + 1\n"));
        assert!(!is_valid_python("def f(x:\n    return\n"));
    }

    #[test]
    fn test_syntactically_identical_whitespace_and_comments() {
        let a = "def f(x):\n    return x + 1  # add one\n";
        let b = "def f(x):\n    return x + 1\n";
        assert!(syntactically_identical(a, b));
    }

    #[test]
    fn test_syntactically_different() {
        let a = "def f(x):\n    return x + 1\n";
        let b = "def f(x):\n    return x - 1\n";
        assert!(!syntactically_identical(a, b));
    }
}

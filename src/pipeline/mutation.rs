//! Mutation-mode per-chunk flow.
//!
//! One chunk goes through: generate mutant, discard no-ops, check the mutant
//! survives the existing suite, reject LLM-judged equivalents, generate a
//! killer test, and verify the test passes on the original but fails on the
//! mutant. Any rejection re-enters the loop up to the attempt limit.

use crate::chunker::{self, Chunk};
use crate::llm::Complete;
use crate::parser::{self, CodeKind};
use crate::pipeline::{ChunkOutcome, WorkerContext};
use crate::prompt;
use crate::sandbox::Sandbox;

pub(crate) async fn run_chunk<C: Complete>(
    ctx: &WorkerContext<C>,
    sandbox: &Sandbox,
    chunk: &Chunk,
) -> (ChunkOutcome, u32) {
    let chunk_text = chunk.text(&ctx.source);
    let mut last_reason = String::from("no attempt completed");

    for attempt in 1..=ctx.run.max_attempts_per_chunk {
        tracing::debug!(
            "Chunk '{}' mutation attempt {}/{}",
            chunk.id,
            attempt,
            ctx.run.max_attempts_per_chunk
        );

        match try_once(ctx, sandbox, chunk, chunk_text).await {
            Ok(outcome) => return (outcome, attempt),
            Err(Rejection::Retry(reason)) => {
                tracing::debug!("Chunk '{}' attempt {} rejected: {}", chunk.id, attempt, reason);
                last_reason = reason;
            }
            Err(Rejection::Fatal(reason)) => {
                return (ChunkOutcome::Exhausted { reason }, attempt);
            }
        }
    }

    (
        ChunkOutcome::Exhausted {
            reason: last_reason,
        },
        ctx.run.max_attempts_per_chunk,
    )
}

/// Why an attempt did not produce an accepted result.
enum Rejection {
    /// Candidate rejected; worth another attempt.
    Retry(String),
    /// The chunk cannot proceed at all (LLM terminally failed).
    Fatal(String),
}

async fn try_once<C: Complete>(
    ctx: &WorkerContext<C>,
    sandbox: &Sandbox,
    chunk: &Chunk,
    chunk_text: &str,
) -> Result<ChunkOutcome, Rejection> {
    // 1. Generate the mutant chunk
    let fault_prompt = prompt::make_fault(chunk_text, chunk.kind.as_str(), &ctx.tests, ctx.concern);
    let response = ctx
        .client
        .complete(&fault_prompt)
        .await
        .map_err(|e| Rejection::Fatal(e.to_string()))?;
    let mutant_chunk = parser::extract_code(&response, CodeKind::Module)
        .map_err(|e| Rejection::Retry(format!("mutant extraction failed: {}", e)))?;

    // 2. A mutant that only changes comments or whitespace is a no-op
    if parser::syntactically_identical(chunk_text, &mutant_chunk) {
        return Err(Rejection::Retry(
            "mutant is syntactically identical to the original".to_string(),
        ));
    }

    // 3. The mutant must survive the existing suite (subtlety requirement)
    let mutant_file = chunker::stitch(&ctx.source, chunk, &mutant_chunk);
    let survival = sandbox
        .run(&mutant_file, &ctx.tests)
        .await
        .map_err(|e| Rejection::Retry(format!("sandbox failure: {}", e)))?;
    if !survival.built {
        return Err(Rejection::Retry("mutant failed to load".to_string()));
    }
    if !survival.passed {
        return Err(Rejection::Retry(
            "mutant was caught by the existing test suite".to_string(),
        ));
    }

    // 4. Reject mutants the model itself judges behaviourally equivalent
    let verdict = ctx
        .client
        .complete(&prompt::equivalence_check(chunk_text, &mutant_chunk))
        .await
        .map_err(|e| Rejection::Fatal(e.to_string()))?;
    if is_equivalent_verdict(&verdict) {
        return Err(Rejection::Retry(
            "mutant judged behaviourally equivalent".to_string(),
        ));
    }

    // 5. Generate the killer test
    let test_prompt = prompt::make_killer_test(&ctx.source, &mutant_file, &ctx.tests);
    let response = ctx
        .client
        .complete(&test_prompt)
        .await
        .map_err(|e| Rejection::Fatal(e.to_string()))?;
    let test_file = parser::extract_code(&response, CodeKind::Test)
        .map_err(|e| Rejection::Retry(format!("test extraction failed: {}", e)))?;

    // 6. The test must pass on the original and fail on the mutant
    let on_original = sandbox
        .run(&ctx.source, &test_file)
        .await
        .map_err(|e| Rejection::Retry(format!("sandbox failure: {}", e)))?;
    if !on_original.built || !on_original.passed {
        return Err(Rejection::Retry(
            "generated test does not pass on the original".to_string(),
        ));
    }

    let on_mutant = sandbox
        .run(&mutant_file, &test_file)
        .await
        .map_err(|e| Rejection::Retry(format!("sandbox failure: {}", e)))?;
    if !on_mutant.built {
        return Err(Rejection::Retry(
            "mutant failed to load under the generated test".to_string(),
        ));
    }
    if on_mutant.passed {
        return Err(Rejection::Retry(
            "generated test does not kill the mutant".to_string(),
        ));
    }

    Ok(ChunkOutcome::Killed {
        mutant_file,
        test_file,
    })
}

/// Parse the yes/no answer of the equivalence prompt. Anything that does not
/// clearly open with "yes" is treated as non-equivalent.
pub(crate) fn is_equivalent_verdict(raw: &str) -> bool {
    raw.trim_start()
        .trim_start_matches(['*', '#', '`', '"', '\''])
        .to_ascii_lowercase()
        .starts_with("yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::error::LlmError;
    use crate::prompt::Concern;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    // =========================================================================
    // Scripted completion client
    // =========================================================================

    enum Script {
        /// Prose with no code block: every extraction fails, so each attempt
        /// is rejected and retried.
        Prose,
        /// Terminal LLM failure on the first call.
        Terminal,
    }

    struct ScriptedClient {
        script: Script,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(script: Script) -> Self {
            Self {
                script,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl crate::llm::Complete for ScriptedClient {
        fn complete(
            &self,
            _prompt: &str,
        ) -> impl std::future::Future<Output = Result<String, LlmError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = match self.script {
                Script::Prose => Ok("I would describe the change in words instead.".to_string()),
                Script::Terminal => Err(LlmError::Terminal("model unavailable".to_string())),
            };
            std::future::ready(result)
        }
    }

    const SOURCE: &str = "def f(x):\n    return x + 1\n";
    const TESTS: &str = "from calc import f\n\n\ndef test_f():\n    assert f(1) == 2\n";

    async fn scripted_context(
        script: Script,
    ) -> (
        tempfile::TempDir,
        WorkerContext<ScriptedClient>,
        Sandbox,
        Chunk,
    ) {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("calc.py"), SOURCE).unwrap();
        std::fs::write(repo.path().join("test_calc.py"), TESTS).unwrap();

        let run = RunConfig::default();
        let sandbox = Sandbox::create(
            repo.path(),
            std::path::Path::new("calc.py"),
            std::path::Path::new("test_calc.py"),
            &run,
        )
        .await
        .unwrap();

        let ctx = WorkerContext {
            client: ScriptedClient::new(script),
            run,
            concern: Concern::Correctness,
            source: SOURCE.to_string(),
            tests: TESTS.to_string(),
            code_rel: PathBuf::from("calc.py"),
            test_rel: PathBuf::from("test_calc.py"),
            master_path: repo.path().to_path_buf(),
        };

        let mut set = chunker::extract_chunks_ast(SOURCE).unwrap();
        let chunk = set.chunks.remove(0);
        (repo, ctx, sandbox, chunk)
    }

    // =========================================================================
    // Attempt bounds
    // =========================================================================

    #[tokio::test]
    async fn test_rejected_attempts_stop_at_configured_limit() {
        let (_repo, ctx, sandbox, chunk) = scripted_context(Script::Prose).await;

        let (outcome, attempts) = run_chunk(&ctx, &sandbox, &chunk).await;

        assert!(matches!(outcome, ChunkOutcome::Exhausted { .. }));
        assert_eq!(attempts, ctx.run.max_attempts_per_chunk);
        // One completion call per attempt: the prose response is rejected at
        // mutant extraction, before any later prompt in the flow.
        assert_eq!(
            ctx.client.calls.load(Ordering::SeqCst),
            ctx.run.max_attempts_per_chunk
        );
    }

    #[tokio::test]
    async fn test_terminal_llm_failure_ends_chunk_on_first_attempt() {
        let (_repo, ctx, sandbox, chunk) = scripted_context(Script::Terminal).await;

        let (outcome, attempts) = run_chunk(&ctx, &sandbox, &chunk).await;

        let ChunkOutcome::Exhausted { reason } = outcome else {
            panic!("terminal failure must exhaust the chunk");
        };
        assert!(reason.contains("model unavailable"));
        assert_eq!(attempts, 1);
        assert_eq!(ctx.client.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_verdict_plain_yes() {
        assert!(is_equivalent_verdict("yes"));
        assert!(is_equivalent_verdict("Yes, both versions behave the same."));
        assert!(is_equivalent_verdict("  YES"));
    }

    #[test]
    fn test_verdict_markdown_wrapped_yes() {
        assert!(is_equivalent_verdict("**Yes**, they are equivalent."));
    }

    #[test]
    fn test_verdict_no() {
        assert!(!is_equivalent_verdict(
            "no, the second version drops the last element"
        ));
        assert!(!is_equivalent_verdict("No."));
    }

    #[test]
    fn test_verdict_hedged_answer_is_not_equivalent() {
        assert!(!is_equivalent_verdict(
            "These look similar, but yes-adjacent reasoning aside, the behaviour differs."
        ));
        assert!(!is_equivalent_verdict(""));
    }
}

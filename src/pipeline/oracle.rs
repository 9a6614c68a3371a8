//! Oracle-mode per-chunk flow.
//!
//! One chunk goes through: generate a batch of throwaway mutants, filter them
//! down to plausible distinct bugs, infer an oracle specification the mutants
//! would all violate, turn the oracle into tests, and run those tests against
//! the unmodified original. A failing test is the detection signal.

use crate::chunker::Chunk;
use crate::llm::Complete;
use crate::parser::{self, CodeKind};
use crate::pipeline::mutation::is_equivalent_verdict;
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
            "Chunk '{}' oracle attempt {}/{}",
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

enum Rejection {
    Retry(String),
    Fatal(String),
}

async fn try_once<C: Complete>(
    ctx: &WorkerContext<C>,
    sandbox: &Sandbox,
    chunk: &Chunk,
    chunk_text: &str,
) -> Result<ChunkOutcome, Rejection> {
    // 1. One batch call for up to N throwaway mutants
    let batch_prompt =
        prompt::make_mutant_batch(chunk_text, ctx.concern, ctx.run.mutants_per_oracle);
    let response = ctx
        .client
        .complete(&batch_prompt)
        .await
        .map_err(|e| Rejection::Fatal(e.to_string()))?;
    let candidates = parser::extract_mutant_batch(&response, ctx.run.mutants_per_oracle);

    // 2. Filter: drop no-ops and duplicates, then LLM-judged equivalents
    let distinct = drop_identical(chunk_text, candidates);
    let mut valid = Vec::new();
    for candidate in distinct {
        if valid.len() >= ctx.run.max_valid_mutants {
            break;
        }
        let verdict = ctx
            .client
            .complete(&prompt::equivalence_check(chunk_text, &candidate))
            .await
            .map_err(|e| Rejection::Fatal(e.to_string()))?;
        if is_equivalent_verdict(&verdict) {
            tracing::debug!("Dropping equivalent throwaway mutant for '{}'", chunk.id);
            continue;
        }
        valid.push(candidate);
    }

    if valid.is_empty() {
        return Err(Rejection::Retry(
            "no valid throwaway mutants survived filtering".to_string(),
        ));
    }
    tracing::debug!(
        "Chunk '{}': {} throwaway mutants feed oracle inference",
        chunk.id,
        valid.len()
    );

    // 3. Infer the oracle specification from the survivors
    let oracle = ctx
        .client
        .complete(&prompt::infer_oracle(chunk_text, &valid, ctx.concern))
        .await
        .map_err(|e| Rejection::Fatal(e.to_string()))?;
    if oracle.trim().is_empty() {
        return Err(Rejection::Retry("empty oracle specification".to_string()));
    }

    // 4. Turn the oracle into tests extending the existing test file
    let test_prompt = prompt::test_from_oracle(chunk_text, &oracle, &chunk.id, &ctx.tests);
    let response = ctx
        .client
        .complete(&test_prompt)
        .await
        .map_err(|e| Rejection::Fatal(e.to_string()))?;
    let test_file = parser::extract_code(&response, CodeKind::Test)
        .map_err(|e| Rejection::Retry(format!("test extraction failed: {}", e)))?;

    // 5. Run against the unmodified original: failure is the signal
    let run = sandbox
        .run(&ctx.source, &test_file)
        .await
        .map_err(|e| Rejection::Retry(format!("sandbox failure: {}", e)))?;
    if !run.built {
        return Err(Rejection::Retry(
            "oracle test failed to load against the original".to_string(),
        ));
    }
    if run.passed {
        return Err(Rejection::Retry(
            "oracle tests pass on the original, no violation found".to_string(),
        ));
    }

    // Reference run of the existing suite, recorded alongside the failure
    // but never part of the accept decision.
    let mut failure_output = run.output;
    if let Ok(reference) = sandbox.run(&ctx.source, &ctx.tests).await {
        failure_output.push_str(&format!(
            "\n[reference] existing suite on original: passed={}\n",
            reference.passed
        ));
    }

    Ok(ChunkOutcome::Detected {
        oracle: oracle.trim().to_string(),
        test_file,
        failure_output,
    })
}

/// Drop candidates that are syntactic no-ops of the original or duplicates
/// of an earlier candidate.
fn drop_identical(original: &str, candidates: Vec<String>) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for candidate in candidates {
        if parser::syntactically_identical(original, &candidate) {
            continue;
        }
        if kept
            .iter()
            .any(|k| parser::syntactically_identical(k, &candidate))
        {
            continue;
        }
        kept.push(candidate);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_identical_removes_no_ops() {
        let original = "def f(x):\n    return x + 1\n";
        let candidates = vec![
            "def f(x):\n    return x + 1  # changed nothing\n".to_string(),
            "def f(x):\n    return x - 1\n".to_string(),
        ];
        let kept = drop_identical(original, candidates);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].contains("x - 1"));
    }

    #[test]
    fn test_drop_identical_removes_duplicates() {
        let original = "def f(x):\n    return x + 1\n";
        let candidates = vec![
            "def f(x):\n    return x - 1\n".to_string(),
            "def f(x):\n    return x - 1\n".to_string(),
            "def f(x):\n    return x * 1\n".to_string(),
        ];
        let kept = drop_identical(original, candidates);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_drop_identical_empty_input() {
        assert!(drop_identical("def f(): pass", vec![]).is_empty());
    }

    // =========================================================================
    // Attempt bounds
    // =========================================================================

    use crate::config::RunConfig;
    use crate::error::LlmError;
    use crate::prompt::Concern;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Always answers with prose, so the mutant batch comes back empty and
    /// every attempt is rejected at the filtering step.
    struct ProseClient {
        calls: AtomicU32,
    }

    impl crate::llm::Complete for ProseClient {
        fn complete(
            &self,
            _prompt: &str,
        ) -> impl std::future::Future<Output = Result<String, LlmError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok("No mutants come to mind for this chunk.".to_string()))
        }
    }

    #[tokio::test]
    async fn test_empty_mutant_batches_stop_at_configured_limit() {
        let source = "def f(x):\n    return x + 1\n";
        let tests = "from calc import f\n\n\ndef test_f():\n    assert f(1) == 2\n";
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("calc.py"), source).unwrap();
        std::fs::write(repo.path().join("test_calc.py"), tests).unwrap();

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
            client: ProseClient {
                calls: AtomicU32::new(0),
            },
            run,
            concern: Concern::Correctness,
            source: source.to_string(),
            tests: tests.to_string(),
            code_rel: PathBuf::from("calc.py"),
            test_rel: PathBuf::from("test_calc.py"),
            master_path: repo.path().to_path_buf(),
        };
        let mut set = crate::chunker::extract_chunks_ast(source).unwrap();
        let chunk = set.chunks.remove(0);

        let (outcome, attempts) = run_chunk(&ctx, &sandbox, &chunk).await;

        let ChunkOutcome::Exhausted { reason } = outcome else {
            panic!("empty batches must exhaust the chunk");
        };
        assert!(reason.contains("no valid throwaway mutants"));
        assert_eq!(attempts, ctx.run.max_attempts_per_chunk);
        // One batch prompt per attempt; nothing to filter or infer from.
        assert_eq!(
            ctx.client.calls.load(Ordering::SeqCst),
            ctx.run.max_attempts_per_chunk
        );
    }
}

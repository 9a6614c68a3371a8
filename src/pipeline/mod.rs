//! Pipeline controller.
//!
//! Owns the run: chunks the target file, fans chunks out to a bounded worker
//! pool over an mpsc queue, collects per-chunk outcomes, and is the sole
//! writer of the output directory (mutant/test files, bug report, run
//! metadata).

pub mod mutation;
pub mod oracle;

use crate::chunker::{self, Chunk, ChunkerMode};
use crate::config::{Config, RunConfig};
use crate::llm::{Complete, LlmClient};
use crate::prompt::Concern;
use crate::sandbox::{self, Sandbox};
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;

/// Pipeline mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Generate a surviving mutant and a test that kills it.
    Mutation,
    /// Infer an oracle specification and a test exposing latent bugs.
    Oracle,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mutation => write!(f, "mutation"),
            Self::Oracle => write!(f, "oracle"),
        }
    }
}

/// Terminal outcome of one chunk.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Mutation mode success: a surviving mutant plus a test that kills it.
    Killed {
        /// Full mutated module text.
        mutant_file: String,
        /// Full killer test file text.
        test_file: String,
    },
    /// Oracle mode success: a test derived from the inferred oracle fails
    /// against the unmodified original.
    Detected {
        oracle: String,
        test_file: String,
        failure_output: String,
    },
    /// All attempts spent without an accepted result.
    Exhausted { reason: String },
    /// Chunk was already recorded in a previous run with the same content.
    Skipped { reason: String },
}

impl ChunkOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Killed { .. } => "killed",
            Self::Detected { .. } => "detected",
            Self::Exhausted { .. } => "exhausted",
            Self::Skipped { .. } => "skipped",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Killed { .. } | Self::Detected { .. })
    }
}

/// Per-chunk record persisted in metadata.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub chunk_hash: String,
    pub outcome: String,
    pub attempts: u32,
    /// 1-based line range of the chunk in the original file.
    #[serde(default)]
    pub start_line: usize,
    #[serde(default)]
    pub end_line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutant_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregate run record, written once at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub timestamp: String,
    pub mode: Mode,
    pub concern: Concern,
    pub chunker_mode: ChunkerMode,
    pub code_file: String,
    pub test_file: String,
    /// Accepted chunks over processed chunks, in [0, 1].
    pub score: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub chunks: Vec<ChunkRecord>,
}

/// Summary returned to main for the exit log line.
#[derive(Debug)]
pub struct RunSummary {
    pub processed: usize,
    pub accepted: usize,
    pub skipped: usize,
    pub score: f64,
}

/// Shared, read-only context for workers.
pub(crate) struct WorkerContext<C: Complete = LlmClient> {
    pub client: C,
    pub run: RunConfig,
    pub concern: Concern,
    /// Original module source, full file.
    pub source: String,
    /// Original test file text.
    pub tests: String,
    pub code_rel: PathBuf,
    pub test_rel: PathBuf,
    /// Root of the master repository copy.
    pub master_path: PathBuf,
}

struct ChunkResult {
    chunk: Chunk,
    outcome: ChunkOutcome,
    attempts: u32,
}

pub struct Pipeline {
    config: Config,
    repo_path: PathBuf,
    code_rel: PathBuf,
    test_rel: PathBuf,
    mode: Mode,
    concern: Concern,
    chunker_mode: ChunkerMode,
}

impl Pipeline {
    pub fn new(
        config: Config,
        repo_path: PathBuf,
        code_rel: PathBuf,
        test_rel: PathBuf,
        mode: Mode,
        concern: Concern,
        chunker_mode: ChunkerMode,
    ) -> Self {
        Self {
            config,
            repo_path,
            code_rel,
            test_rel,
            mode,
            concern,
            chunker_mode,
        }
    }

    /// Run the full pipeline for one target file.
    pub async fn run(&self) -> Result<RunSummary> {
        let source = tokio::fs::read_to_string(self.repo_path.join(&self.code_rel))
            .await
            .with_context(|| format!("Failed to read code file {:?}", self.code_rel))?;
        let tests = tokio::fs::read_to_string(self.repo_path.join(&self.test_rel))
            .await
            .with_context(|| format!("Failed to read test file {:?}", self.test_rel))?;

        let client = LlmClient::new(&self.config.llm)?;

        // Chunk the target file
        let chunk_set = match self.chunker_mode {
            ChunkerMode::Ast => chunker::extract_chunks_ast(&source)?,
            ChunkerMode::Llm => chunker::extract_chunks_llm(&client, &source).await?,
        };
        let targets: Vec<Chunk> = chunk_set
            .chunks
            .iter()
            .filter(|c| c.mutable)
            .cloned()
            .collect();

        tracing::info!(
            "{} mode: {} chunks extracted, {} mutation targets",
            self.mode,
            chunk_set.chunks.len(),
            targets.len()
        );

        let out_dir = self.output_dir()?;
        let previous = load_metadata(&out_dir.join("metadata.json"));

        // Master copy: workers clone from this, never from the original
        let master = sandbox::copy_repo_to_temp(&self.repo_path).await?;

        let ctx = Arc::new(WorkerContext {
            client,
            run: self.config.run.clone(),
            concern: self.concern,
            source: source.clone(),
            tests: tests.clone(),
            code_rel: self.code_rel.clone(),
            test_rel: self.test_rel.clone(),
            master_path: master.path().to_path_buf(),
        });

        let (task_tx, task_rx) = mpsc::channel::<Chunk>(100);
        // Unbounded so workers never stall on result delivery while the
        // controller is still enqueueing tasks
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<ChunkResult>();
        let task_rx = Arc::new(TokioMutex::new(task_rx));

        let worker_count = self.config.run.max_workers.max(1).min(targets.len().max(1));
        let mut worker_handles = Vec::new();
        for worker_id in 0..worker_count {
            let worker_rx = Arc::clone(&task_rx);
            let worker_tx = result_tx.clone();
            let worker_ctx = Arc::clone(&ctx);
            let mode = self.mode;

            let handle = tokio::spawn(async move {
                chunk_worker(worker_id, mode, worker_ctx, worker_rx, worker_tx).await
            });
            worker_handles.push(handle);
        }
        drop(result_tx);

        // Enqueue chunks, skipping ones already recorded with the same content
        let mut results: Vec<ChunkResult> = Vec::new();
        for chunk in targets {
            let hash = content_hash(chunk.text(&source));
            if already_recorded(previous.as_ref(), &chunk.id, &hash) {
                tracing::info!("Skipping chunk '{}': unchanged since last run", chunk.id);
                results.push(ChunkResult {
                    chunk,
                    outcome: ChunkOutcome::Skipped {
                        reason: "unchanged since previous run".to_string(),
                    },
                    attempts: 0,
                });
                continue;
            }
            if task_tx.send(chunk).await.is_err() {
                break;
            }
        }
        drop(task_tx);

        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        for handle in worker_handles {
            if let Err(e) = handle.await {
                tracing::warn!("Chunk worker failed: {}", e);
            }
        }

        self.persist(&out_dir, &source, results, chunk_set.warnings, previous)
            .await
    }

    fn output_dir(&self) -> Result<PathBuf> {
        let stem = self
            .code_rel
            .file_stem()
            .context("Code file has no file name")?
            .to_string_lossy()
            .to_string();
        let base = match self.mode {
            Mode::Mutation => &self.config.run.output_dir,
            Mode::Oracle => &self.config.run.oracle_output_dir,
        };
        Ok(base.join(stem))
    }

    /// Write accepted artifacts, the oracle bug report, and metadata.json.
    async fn persist(
        &self,
        out_dir: &Path,
        source: &str,
        results: Vec<ChunkResult>,
        warnings: Vec<String>,
        previous: Option<RunMetadata>,
    ) -> Result<RunSummary> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .with_context(|| format!("Failed to create output directory {:?}", out_dir))?;

        let mut records = Vec::new();
        let mut bug_report = String::new();
        let mut processed = 0usize;
        let mut accepted = 0usize;
        let mut skipped = 0usize;

        for result in results {
            let chunk_hash = content_hash(result.chunk.text(source));
            let mut record = ChunkRecord {
                chunk_id: result.chunk.id.clone(),
                chunk_hash,
                outcome: result.outcome.as_str().to_string(),
                attempts: result.attempts,
                start_line: result.chunk.start_line,
                end_line: result.chunk.end_line,
                mutant_file: None,
                test_file: None,
                detail: None,
            };

            match &result.outcome {
                ChunkOutcome::Killed {
                    mutant_file,
                    test_file,
                } => {
                    processed += 1;
                    accepted += 1;
                    let hash = short_hash(&result.chunk.id, mutant_file, test_file);
                    let mutant_name = format!("mutant_{}_{}.py", result.chunk.id, hash);
                    let test_name = format!("test_{}_{}.py", result.chunk.id, hash);
                    write_artifact(out_dir, &mutant_name, mutant_file).await?;
                    write_artifact(out_dir, &test_name, test_file).await?;
                    record.mutant_file = Some(mutant_name);
                    record.test_file = Some(test_name);
                    tracing::info!("Chunk '{}' killed", result.chunk.id);
                }
                ChunkOutcome::Detected {
                    oracle,
                    test_file,
                    failure_output,
                } => {
                    processed += 1;
                    accepted += 1;
                    let hash = short_hash(&result.chunk.id, oracle, test_file);
                    let test_name = format!("test_{}_{}.py", result.chunk.id, hash);
                    write_artifact(out_dir, &test_name, test_file).await?;
                    record.test_file = Some(test_name.clone());
                    bug_report.push_str(&format_bug_report_entry(
                        &result.chunk.id,
                        self.concern,
                        oracle,
                        &test_name,
                        failure_output,
                    ));
                    tracing::info!("Chunk '{}' detected a bug", result.chunk.id);
                }
                ChunkOutcome::Exhausted { reason } => {
                    processed += 1;
                    record.detail = Some(reason.clone());
                    tracing::info!("Chunk '{}' exhausted: {}", result.chunk.id, reason);
                }
                ChunkOutcome::Skipped { reason } => {
                    skipped += 1;
                    record.detail = Some(reason.clone());
                    // Carry forward artifact names from the previous run
                    if let Some(prev) = previous
                        .as_ref()
                        .and_then(|m| m.chunks.iter().find(|r| r.chunk_id == record.chunk_id))
                    {
                        record.outcome = prev.outcome.clone();
                        record.mutant_file = prev.mutant_file.clone();
                        record.test_file = prev.test_file.clone();
                        record.detail = Some("unchanged since previous run".to_string());
                    }
                }
            }

            records.push(record);
        }

        if !bug_report.is_empty() {
            write_artifact(out_dir, "bug_report.txt", &bug_report).await?;
        }

        let score = if processed > 0 {
            accepted as f64 / processed as f64
        } else {
            0.0
        };

        let metadata = RunMetadata {
            timestamp: chrono::Utc::now().to_rfc3339(),
            mode: self.mode,
            concern: self.concern,
            chunker_mode: self.chunker_mode,
            code_file: self.code_rel.to_string_lossy().to_string(),
            test_file: self.test_rel.to_string_lossy().to_string(),
            score,
            warnings,
            chunks: records,
        };
        let json =
            serde_json::to_string_pretty(&metadata).context("Failed to serialize metadata")?;
        write_artifact(out_dir, "metadata.json", &json).await?;

        tracing::info!(
            "Run complete: {}/{} chunks accepted ({} skipped), score {:.2}",
            accepted,
            processed,
            skipped,
            score
        );

        Ok(RunSummary {
            processed,
            accepted,
            skipped,
            score,
        })
    }
}

/// One worker: owns a sandbox copied from the master and pulls chunks off
/// the shared queue until it closes.
async fn chunk_worker<C: Complete>(
    worker_id: usize,
    mode: Mode,
    ctx: Arc<WorkerContext<C>>,
    rx: Arc<TokioMutex<mpsc::Receiver<Chunk>>>,
    tx: mpsc::UnboundedSender<ChunkResult>,
) {
    let sandbox = match Sandbox::create(&ctx.master_path, &ctx.code_rel, &ctx.test_rel, &ctx.run)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Worker {} failed to create sandbox: {}", worker_id, e);
            return;
        }
    };

    loop {
        let chunk = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(chunk) = chunk else { break };

        tracing::debug!("Worker {} processing chunk '{}'", worker_id, chunk.id);
        let (outcome, attempts) = match mode {
            Mode::Mutation => mutation::run_chunk(&ctx, &sandbox, &chunk).await,
            Mode::Oracle => oracle::run_chunk(&ctx, &sandbox, &chunk).await,
        };

        if tx
            .send(ChunkResult {
                chunk,
                outcome,
                attempts,
            })
            .is_err()
        {
            break;
        }
    }
}

async fn write_artifact(out_dir: &Path, name: &str, content: &str) -> Result<()> {
    let path = out_dir.join(name);
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}

fn load_metadata(path: &Path) -> Option<RunMetadata> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            tracing::warn!("Ignoring unreadable metadata at {:?}: {}", path, e);
            None
        }
    }
}

/// A chunk is skipped when a previous run already accepted it with the same
/// content hash.
fn already_recorded(previous: Option<&RunMetadata>, chunk_id: &str, chunk_hash: &str) -> bool {
    previous
        .map(|m| {
            m.chunks.iter().any(|r| {
                r.chunk_id == chunk_id
                    && r.chunk_hash == chunk_hash
                    && (r.outcome == "killed" || r.outcome == "detected")
            })
        })
        .unwrap_or(false)
}

/// Full SHA-256 of chunk content, used for change detection between runs.
fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Short 12-hex-char hash over the artifacts, used in output file names.
fn short_hash(chunk_id: &str, a: &str, b: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chunk_id.as_bytes());
    hasher.update(a.as_bytes());
    hasher.update(b.as_bytes());
    let full = format!("{:x}", hasher.finalize());
    full[..12].to_string()
}

fn format_bug_report_entry(
    chunk_id: &str,
    concern: Concern,
    oracle: &str,
    test_name: &str,
    output: &str,
) -> String {
    format!(
        "================================================================\n\
         CHUNK: {}\n\
         CONCERN: {}\n\
         TEST FILE: {}\n\
         ----------------------------------------------------------------\n\
         ORACLE SPECIFICATION:\n{}\n\
         ----------------------------------------------------------------\n\
         FAILING TEST OUTPUT:\n{}\n\n",
        chunk_id,
        concern,
        test_name,
        oracle.trim(),
        output.trim()
    )
}

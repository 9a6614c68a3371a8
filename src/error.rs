//! Error taxonomy.
//!
//! Two tiers: `ConfigError` is fatal and aborts the run before any chunk is
//! processed. Everything else is recoverable at chunk granularity — workers
//! catch these and convert them into a terminal chunk outcome instead of
//! failing the run.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal setup errors surfaced to the user as a process failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("input file not found: {0}")]
    MissingInput(PathBuf),

    #[error("repository path is not a directory: {0}")]
    NotARepository(PathBuf),

    #[error("input file {file} is not inside the repository {repo}")]
    OutsideRepository { file: PathBuf, repo: PathBuf },

    #[error("--concern is required for oracle mode")]
    MissingConcern,

    #[error("API key environment variable {0} is not set")]
    MissingApiKey(String),
}

/// Failures of the LLM completion call.
///
/// Transient failures are retried inside the client and never escape it;
/// callers only ever see `Terminal` or `RetriesExhausted`.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transient LLM failure: {0}")]
    Transient(String),

    #[error("LLM request failed: {0}")]
    Terminal(String),

    #[error("LLM retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// The model's response did not contain an extractable, syntactically valid
/// payload of the expected kind.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no fenced code block found in response")]
    NoCodeBlock,

    #[error("no JSON object found in response")]
    NoJson,

    #[error("invalid JSON in response: {0}")]
    InvalidJson(String),

    #[error("extracted code is not valid Python")]
    InvalidSyntax,
}

/// Unexpected failures while preparing or executing a sandboxed test run.
///
/// Test failures and timeouts are ordinary `TestRun` outcomes, not errors;
/// this covers the machinery breaking (I/O, spawn).
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn test process: {0}")]
    Spawn(std::io::Error),
}

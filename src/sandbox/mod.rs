//! Execution sandbox.
//!
//! Each worker gets its own copy of the target repository in a temp
//! directory, so concurrent mutant runs never see each other's writes and
//! the original checkout is never modified. A test run writes the candidate
//! module and test file into the copy, shells out to the configured Python
//! interpreter, and classifies the outcome.

use crate::config::RunConfig;
use crate::error::SandboxError;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Directories never copied into a sandbox.
const EXCLUDE_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    ".venv",
    "venv",
    "node_modules",
    "outputs",
    "oracle_outputs",
];

/// Result of one sandboxed test run.
///
/// A timeout or failing test is an ordinary result, not an error: `built`
/// is false only when the code never got to run (syntax or import failure
/// at collection time).
#[derive(Debug, Clone)]
pub struct TestRun {
    /// Whether the code loaded at all.
    pub built: bool,
    /// Whether every test passed (exit code 0).
    pub passed: bool,
    /// Combined stdout and stderr.
    pub output: String,
    /// How long the run took in milliseconds.
    pub duration_ms: u64,
}

/// Which test harness the test file is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestRunner {
    Pytest,
    Unittest,
}

/// An isolated copy of the target repository.
pub struct Sandbox {
    temp: tempfile::TempDir,
    code_rel: PathBuf,
    test_rel: PathBuf,
    python: String,
    runner: TestRunner,
    timeout: Duration,
    max_output_bytes: usize,
}

impl Sandbox {
    /// Copy the repository into a fresh temp directory.
    ///
    /// `code_rel` and `test_rel` are the module and test file paths relative
    /// to the repository root; the test file's content decides which harness
    /// the sandbox invokes.
    pub async fn create(
        repo_path: &Path,
        code_rel: &Path,
        test_rel: &Path,
        config: &RunConfig,
    ) -> Result<Self> {
        let temp = copy_repo_to_temp(repo_path).await?;

        let test_source = tokio::fs::read_to_string(temp.path().join(test_rel))
            .await
            .with_context(|| format!("Failed to read test file {:?} in sandbox", test_rel))?;
        let runner = detect_test_runner(&test_source);

        tracing::debug!(
            "Sandbox created at {} (runner: {:?})",
            temp.path().display(),
            runner
        );

        Ok(Self {
            temp,
            code_rel: code_rel.to_path_buf(),
            test_rel: test_rel.to_path_buf(),
            python: config.python.clone(),
            runner,
            timeout: Duration::from_secs(config.test_timeout_seconds),
            max_output_bytes: 10_000,
        })
    }

    /// Write the candidate module and test file into the copy, run the test
    /// suite, and classify the result.
    pub async fn run(&self, code_text: &str, test_text: &str) -> Result<TestRun, SandboxError> {
        self.write(&self.code_rel, code_text).await?;
        self.write(&self.test_rel, test_text).await?;

        let start = Instant::now();

        let mut command = Command::new(&self.python);
        match self.runner {
            TestRunner::Pytest => {
                command.args(["-m", "pytest", "-q", "-x"]).arg(&self.test_rel);
            }
            TestRunner::Unittest => {
                command
                    .args(["-m", "unittest", "-v"])
                    .arg(module_name(&self.test_rel));
            }
        }
        command.current_dir(self.temp.path());

        let child = command.output();
        let result = tokio::time::timeout(self.timeout, child).await;

        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let combined = format!("{}{}", stdout, stderr);

                Ok(TestRun {
                    built: !is_build_failure(&combined),
                    passed: output.status.success(),
                    output: truncate_output(&combined, self.max_output_bytes),
                    duration_ms,
                })
            }
            Ok(Err(e)) => Err(SandboxError::Spawn(e)),
            Err(_) => Ok(TestRun {
                built: true,
                passed: false,
                output: format!("Test run timed out after {:?}", self.timeout),
                duration_ms,
            }),
        }
    }

    async fn write(&self, rel: &Path, content: &str) -> Result<(), SandboxError> {
        let path = self.temp.path().join(rel);
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| SandboxError::Write { path, source })
    }
}

/// Copy a repository into a fresh temp directory, skipping VCS metadata,
/// caches, virtual environments, and previous run outputs.
///
/// The controller makes one master copy up front; each worker's sandbox is
/// then copied from the master rather than the original checkout.
pub(crate) async fn copy_repo_to_temp(repo_path: &Path) -> Result<tempfile::TempDir> {
    let repo_path = repo_path.to_path_buf();

    // walkdir is synchronous, keep it off the runtime threads
    let temp_dir = tokio::task::spawn_blocking(move || -> Result<tempfile::TempDir> {
        let temp_dir = tempfile::TempDir::with_prefix("faultline-")?;

        let walker = walkdir::WalkDir::new(&repo_path)
            .into_iter()
            .filter_entry(|e| !is_excluded(e.file_name().to_string_lossy().as_ref()));

        for entry in walker {
            let entry = entry.context("Failed to walk repository")?;
            let relative = entry
                .path()
                .strip_prefix(&repo_path)
                .context("Walked path outside repository root")?;
            if relative.as_os_str().is_empty() {
                continue;
            }

            let dest = temp_dir.path().join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&dest)
                    .with_context(|| format!("Failed to create {:?}", dest))?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {:?}", parent))?;
                }
                std::fs::copy(entry.path(), &dest)
                    .with_context(|| format!("Failed to copy {:?}", entry.path()))?;
            }
        }

        Ok(temp_dir)
    })
    .await??;

    Ok(temp_dir)
}

fn is_excluded(name: &str) -> bool {
    EXCLUDE_DIRS.contains(&name)
}

/// Pick the harness from the test file's own imports, defaulting to pytest
/// when the file uses bare test functions.
fn detect_test_runner(test_source: &str) -> TestRunner {
    let uses_unittest = test_source
        .lines()
        .any(|l| l.trim_start().starts_with("import unittest") || l.contains("unittest.TestCase"));
    let uses_pytest = test_source.contains("import pytest")
        || test_source
            .lines()
            .any(|l| l.trim_start().starts_with("def test_"));

    if uses_unittest && !uses_pytest {
        TestRunner::Unittest
    } else {
        TestRunner::Pytest
    }
}

/// Convert a relative file path to the dotted module name unittest expects.
fn module_name(rel: &Path) -> String {
    rel.with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(".")
}

/// Check the combined output for failures that mean the code never ran:
/// syntax errors or import errors at collection time.
fn is_build_failure(output: &str) -> bool {
    output.contains("SyntaxError")
        || output.contains("IndentationError")
        || output.contains("ImportError")
        || output.contains("ModuleNotFoundError")
        || output.contains("error collecting")
}

fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        output.to_string()
    } else {
        let mut end = max_bytes;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...(truncated)", &output[..end])
    }
}

mod chunker;
mod config;
mod error;
mod llm;
mod parser;
mod pipeline;
mod prompt;
mod sandbox;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::chunker::ChunkerMode;
use crate::config::Config;
use crate::error::ConfigError;
use crate::pipeline::{Mode, Pipeline};
use crate::prompt::Concern;

#[derive(Parser)]
#[command(name = "faultline")]
#[command(version)]
#[command(about = "LLM-driven mutation testing and oracle inference for Python code")]
struct Cli {
    /// Path to the target repository
    repo_path: PathBuf,

    /// Python module under test (inside the repository)
    code_file: PathBuf,

    /// Its existing test file (inside the repository)
    test_file: PathBuf,

    /// Pipeline mode
    #[arg(long, value_enum, default_value_t = Mode::Mutation)]
    mode: Mode,

    /// How to split the module into chunks
    #[arg(long, value_enum, default_value_t = ChunkerMode::Llm)]
    chunker_mode: ChunkerMode,

    /// Bug category to steer prompts toward (required for oracle mode)
    #[arg(long, value_enum)]
    concern: Option<Concern>,

    /// Number of concurrent workers (overrides the config file)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(max_workers) = cli.max_workers {
        config.run.max_workers = max_workers;
    }

    if !cli.repo_path.is_dir() {
        return Err(ConfigError::NotARepository(cli.repo_path).into());
    }
    let code_rel = relative_to_repo(&cli.repo_path, &cli.code_file)?;
    let test_rel = relative_to_repo(&cli.repo_path, &cli.test_file)?;

    let concern = match (cli.mode, cli.concern) {
        (_, Some(concern)) => concern,
        (Mode::Oracle, None) => return Err(ConfigError::MissingConcern.into()),
        (Mode::Mutation, None) => Concern::Privacy,
    };

    tracing::info!(
        "Starting {} run on {} (chunker: {}, concern: {}, workers: {})",
        cli.mode,
        code_rel.display(),
        cli.chunker_mode,
        concern,
        config.run.max_workers
    );

    let pipeline = Pipeline::new(
        config,
        cli.repo_path,
        code_rel,
        test_rel,
        cli.mode,
        concern,
        cli.chunker_mode,
    );
    let summary = pipeline.run().await?;

    tracing::info!(
        "Done: {} accepted, {} exhausted, {} skipped (score {:.2})",
        summary.accepted,
        summary.processed - summary.accepted,
        summary.skipped,
        summary.score
    );

    Ok(())
}

/// Resolve a CLI file argument to a path relative to the repository root,
/// verifying the file exists inside the repository.
fn relative_to_repo(repo: &Path, file: &Path) -> Result<PathBuf, ConfigError> {
    let rel = if file.is_absolute() {
        file.strip_prefix(repo)
            .map_err(|_| ConfigError::OutsideRepository {
                file: file.to_path_buf(),
                repo: repo.to_path_buf(),
            })?
            .to_path_buf()
    } else {
        file.to_path_buf()
    };

    if !repo.join(&rel).is_file() {
        return Err(ConfigError::MissingInput(repo.join(rel)));
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_resolution() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("calc.py"), "x = 1\n").unwrap();

        let rel = relative_to_repo(repo.path(), Path::new("calc.py")).unwrap();
        assert_eq!(rel, PathBuf::from("calc.py"));
    }

    #[test]
    fn test_absolute_path_inside_repo() {
        let repo = tempfile::tempdir().unwrap();
        std::fs::write(repo.path().join("calc.py"), "x = 1\n").unwrap();

        let rel = relative_to_repo(repo.path(), &repo.path().join("calc.py")).unwrap();
        assert_eq!(rel, PathBuf::from("calc.py"));
    }

    #[test]
    fn test_absolute_path_outside_repo() {
        let repo = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let outside = other.path().join("calc.py");
        std::fs::write(&outside, "x = 1\n").unwrap();

        let result = relative_to_repo(repo.path(), &outside);
        assert!(matches!(result, Err(ConfigError::OutsideRepository { .. })));
    }

    #[test]
    fn test_missing_input_file() {
        let repo = tempfile::tempdir().unwrap();
        let result = relative_to_repo(repo.path(), Path::new("nope.py"));
        assert!(matches!(result, Err(ConfigError::MissingInput(_))));
    }
}

//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod assets;
mod discover;
mod run;
mod status;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::HarvestConfig;

/// Exit code when some candidates are still incomplete after a run.
pub const EXIT_INCOMPLETE: i32 = 2;
/// Exit code when a run was interrupted.
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Resumable harvester for paginated and infinite-scroll listings")]
#[command(version)]
pub struct Cli {
    /// Config file path (default: harvest.toml in the working directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Hide progress bars
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Converge listings and write the discovered item addresses
    Discover {
        /// Listing addresses (default: discovery.listings from the config)
        listings: Vec<String>,
        /// Candidate file to write (default: discovery.output)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Number of workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Harvest details for every candidate in a file
    Run {
        /// Candidate file (one address per line, or CSV with addresses first)
        #[arg(short, long)]
        input: PathBuf,
        #[command(flatten)]
        harvest: HarvestArgs,
    },

    /// Discover and then harvest in one go
    Crawl {
        /// Listing addresses (default: discovery.listings from the config)
        listings: Vec<String>,
        /// Candidate file to write (default: discovery.output)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        harvest: HarvestArgs,
    },

    /// Download assets for complete records
    Assets {
        /// Checkpoint file (default: checkpoint.path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Directory to download into (default: assets.dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Number of download workers
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show checkpoint totals without running anything
    Status {
        /// Checkpoint file (default: checkpoint.path)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// List every incomplete item
        #[arg(long)]
        all: bool,
    },
}

#[derive(clap::Args)]
struct HarvestArgs {
    /// Checkpoint file (default: checkpoint.path)
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Number of workers
    #[arg(short, long)]
    workers: Option<usize>,
    /// Restart each worker's session after this many items (0 = never)
    #[arg(long)]
    restart_after: Option<usize>,
    /// Process every candidate, not only the ones still incomplete
    #[arg(long)]
    no_resume: bool,
    /// Let newly extracted values replace stored ones
    #[arg(long)]
    force: bool,
}

impl HarvestArgs {
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(workers) = self.workers {
            config.pool.workers = workers;
        }
        if let Some(restart_after) = self.restart_after {
            config.pool.restart_after = restart_after;
        }
    }

    fn options(&self) -> crate::pipeline::HarvestOptions {
        crate::pipeline::HarvestOptions {
            resume: !self.no_resume,
            force: self.force,
        }
    }
}

/// Parse arguments, run the selected command and return the process exit code.
pub async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let mut config = HarvestConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    let show_progress = !cli.quiet;

    match cli.command {
        Commands::Discover {
            listings,
            output,
            workers,
        } => {
            if let Some(workers) = workers {
                config.pool.workers = workers;
            }
            config.validate()?;
            discover::cmd_discover(&config, listings, output.as_deref(), show_progress).await
        }
        Commands::Run { input, harvest } => {
            harvest.apply(&mut config);
            config.validate()?;
            run::cmd_run(
                &config,
                &input,
                harvest.checkpoint.as_deref(),
                harvest.options(),
                show_progress,
            )
            .await
        }
        Commands::Crawl {
            listings,
            output,
            harvest,
        } => {
            harvest.apply(&mut config);
            config.validate()?;
            run::cmd_crawl(
                &config,
                listings,
                output.as_deref(),
                harvest.checkpoint.as_deref(),
                harvest.options(),
                show_progress,
            )
            .await
        }
        Commands::Assets {
            checkpoint,
            dir,
            workers,
        } => {
            if let Some(workers) = workers {
                config.assets.workers = workers;
            }
            if let Some(dir) = dir {
                config.assets.dir = super::helpers::cli_path(&dir).to_string_lossy().into_owned();
            }
            config.validate()?;
            assets::cmd_assets(&config, checkpoint.as_deref(), show_progress).await
        }
        Commands::Status { checkpoint, all } => {
            status::cmd_status(&config, checkpoint.as_deref(), all).await
        }
    }
}

/// Checkpoint path from the CLI if given, else from the config.
fn checkpoint_path(config: &HarvestConfig, cli: Option<&std::path::Path>) -> PathBuf {
    match cli {
        Some(path) => super::helpers::cli_path(path),
        None => config.checkpoint_path(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "harvest",
            "-v",
            "run",
            "--input",
            "candidates.csv",
            "--workers",
            "2",
            "--restart-after",
            "20",
            "--no-resume",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { input, harvest } => {
                assert_eq!(input, PathBuf::from("candidates.csv"));
                assert_eq!(harvest.workers, Some(2));
                assert_eq!(harvest.restart_after, Some(20));
                let options = harvest.options();
                assert!(!options.resume);
                assert!(!options.force);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_overrides_config() {
        let cli = Cli::try_parse_from(["harvest", "crawl", "--workers", "3", "--restart-after", "0"])
            .unwrap();
        let mut config = HarvestConfig::default();
        match cli.command {
            Commands::Crawl { harvest, .. } => harvest.apply(&mut config),
            _ => panic!("expected crawl"),
        }
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.pool.restart_after, 0);
    }

    #[test]
    fn default_checkpoint_comes_from_config() {
        let config = HarvestConfig::default();
        assert_eq!(checkpoint_path(&config, None), config.checkpoint_path());
    }
}

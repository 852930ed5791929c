mod config;
mod discovery;
mod ingest;
mod loki;
mod openmetrics;
mod pipeline;
mod pricing;
mod record;
mod retry;
mod session;
mod summary;

use clap::{Parser, Subcommand};
use config::BackfillConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Backfill Claude Code session transcripts into Loki (tool events) and an
/// OpenMetrics file for Prometheus block import (usage counters).
#[derive(Parser, Debug)]
#[command(name = "claude-backfill", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "backfill.toml", global = true)]
    config: PathBuf,

    /// Root directory of per-project transcripts (overrides config)
    #[arg(long, global = true)]
    projects_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push correlated tool events to Loki
    Loki {
        /// Loki base URL (overrides config)
        #[arg(long)]
        loki_url: Option<String>,

        /// Events per push request (overrides config)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only events before this date, YYYY-MM-DD (overrides config)
        #[arg(long)]
        before: Option<String>,

        /// Parse and summarize, don't push
        #[arg(long)]
        dry_run: bool,
    },
    /// Write session counters as OpenMetrics text
    Metrics {
        /// Output file; stdout when omitted (overrides config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only sessions starting before this date, YYYY-MM-DD (overrides config)
        #[arg(long)]
        before: Option<String>,

        /// Parse and summarize, don't write
        #[arg(long)]
        dry_run: bool,
    },
}

impl Cli {
    fn log_filter(&self) -> EnvFilter {
        let level = if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    }

    /// Fold command-line overrides into the file configuration.
    fn apply_overrides(&self, cfg: &mut BackfillConfig) {
        if let Some(dir) = &self.projects_dir {
            cfg.source.projects_dir = dir.clone();
        }
        match &self.command {
            Command::Loki {
                loki_url,
                batch_size,
                before,
                ..
            } => {
                if let Some(url) = loki_url {
                    cfg.loki.url = url.clone();
                }
                if let Some(n) = batch_size {
                    cfg.loki.batch_size = *n;
                }
                if let Some(b) = before {
                    cfg.source.before = Some(b.clone());
                }
            }
            Command::Metrics { output, before, .. } => {
                if let Some(path) = output {
                    cfg.metrics.output = Some(path.clone());
                }
                if let Some(b) = before {
                    cfg.source.before = Some(b.clone());
                }
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut cfg);

    let source = match cfg.source.resolve() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Loki { dry_run, .. } => {
            let settings = match cfg.loki.resolve() {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "invalid configuration");
                    return ExitCode::FAILURE;
                }
            };
            match pipeline::run_loki(&source, &settings, dry_run).await {
                Ok(_) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "loki backfill aborted");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Metrics { dry_run, .. } => {
            let settings = match cfg.metrics.resolve() {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "invalid configuration");
                    return ExitCode::FAILURE;
                }
            };
            match pipeline::run_metrics(&source, &settings, dry_run) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "metrics backfill failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

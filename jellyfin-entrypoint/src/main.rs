//! Jellyfin entrypoint - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jellyfin_entrypoint::backup::retention::prune_retention;
use jellyfin_entrypoint::{config::Config, utils, StartupOrchestrator};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prepare the volume, then launch the server
    Run {
        /// Server command line
        #[arg(last = true, required = true, value_name = "COMMAND")]
        argv: Vec<OsString>,
    },

    /// Delete old archives of one class, keeping the newest
    PruneBackups {
        #[arg(long)]
        dir: PathBuf,

        #[arg(long)]
        prefix: String,

        #[arg(long)]
        keep: usize,

        /// Archive that must survive regardless of age
        #[arg(long)]
        protect: Option<PathBuf>,
    },

    /// Print whether a backup is due, without taking one
    CheckBackup,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("jellyfin-entrypoint: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<i32> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    match args.command {
        Command::Run { argv } => {
            let code = StartupOrchestrator::new(config)
                .run(argv)
                .await
                .context("Startup failed")?;
            Ok(code)
        }
        Command::PruneBackups {
            dir,
            prefix,
            keep,
            protect,
        } => {
            let report = prune_retention(&dir, &prefix, keep, protect.as_deref())
                .with_context(|| format!("Failed to prune {} archives", prefix))?;
            tracing::info!(
                prefix = %prefix,
                kept = report.kept.len(),
                deleted = report.deleted.len(),
                "Old backups pruned"
            );
            Ok(0)
        }
        Command::CheckBackup => {
            let (signature, decision) = StartupOrchestrator::new(config).check_backup()?;
            println!(
                "signature={} due={} reason={}",
                signature.as_str(),
                decision.due,
                decision.reason
            );
            Ok(0)
        }
    }
}

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod error;
mod home;
mod utils;

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Package application bundles and their images into portable archives")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Package a bundle in a gzipped tarball
    Export(commands::export::ExportArgs),
    /// Unpack a bundle archive, optionally relocating its images
    Import(commands::import::ImportArgs),
}

impl Commands {
    fn verbose(&self) -> bool {
        match self {
            Commands::Export(args) => args.verbose,
            Commands::Import(args) => args.verbose,
        }
    }
}

/// Logs go to stderr. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "warn,stowage=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.command.verbose());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cleaning up");
            interrupt.cancel();
        }
    });

    let result = match cli.command {
        Commands::Export(args) => commands::export::execute(args, &cancel).await,
        Commands::Import(args) => commands::import::execute(args, &cancel).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            utils::print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

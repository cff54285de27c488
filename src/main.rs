//! swarmget - main entry point

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

/// A BitTorrent CLI downloader
#[derive(Debug, Parser)]
#[command(name = "swarmget")]
#[command(about = "Download the content of a .torrent file or magnet link", long_about = None)]
struct CliArgs {
    /// Torrent source: path to a .torrent file, or a magnet URI
    #[arg(value_name = "SOURCE")]
    source: String,

    /// Directory to download into
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,
}

impl CliArgs {
    fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .compact()
        .init();

    match swarmget::run(&args.source, &args.output_dir).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("download failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

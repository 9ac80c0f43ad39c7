//! hotspot-imager - build a hotspot disk image from a YAML recipe
//!
//! CLI entry point: parse arguments, set up logging, run the build
//! driver and map its outcome to the documented exit codes.

use clap::Parser;
use console::style;
use hotspot_imager::build::{self, BuildOptions};
use hotspot_imager::cli::Cli;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("hotspot_imager=debug")
    } else {
        EnvFilter::new("hotspot_imager=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let options = match BuildOptions::from_cli(cli) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            return ExitCode::from(e.exit_code());
        }
    };

    match build::run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

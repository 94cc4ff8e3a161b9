//! # psynet CLI
//!
//! Command-line front end for the psynet spreading-activation engine:
//! create demo nets, inspect saved net directories, and run ticks against
//! a saved net.

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod error;

use commands::PsynetCli;
use error::CliResult;

fn main() -> CliResult<()> {
    let cli = PsynetCli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    if let Err(err) = cli.execute() {
        error!("Command failed: {}", err);
        std::process::exit(1);
    }

    Ok(())
}

//! CLI command implementations for psynet

use crate::error::CliResult;
use clap::{Parser, Subcommand};

pub mod inspect;
pub mod new;
pub mod run;

/// psynet - partitioned spreading-activation engine
#[derive(Parser, Debug)]
#[command(
    name = "psynet",
    version,
    about = "Partitioned spreading-activation engine for node nets",
    long_about = "psynet steps MicroPsi-style node nets: populations of concept, pipe \
                  and LSTM nodes exchanging weighted activation every tick. Create a \
                  demo net, inspect a saved net directory, or run ticks against one."
)]
pub struct PsynetCli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a demo net directory
    #[command(alias = "init")]
    New(new::NewCommand),

    /// Inspect a saved net directory
    Inspect(inspect::InspectCommand),

    /// Run ticks against a saved net
    Run(run::RunCommand),
}

impl PsynetCli {
    /// Execute the CLI command
    pub fn execute(self) -> CliResult<()> {
        match self.command {
            Commands::New(cmd) => cmd.execute(),
            Commands::Inspect(cmd) => cmd.execute(),
            Commands::Run(cmd) => cmd.execute(),
        }
    }
}

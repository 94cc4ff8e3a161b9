//! Running ticks against a saved net

use clap::Args;
use std::path::PathBuf;
use tracing::info;

use crate::error::{CliError, CliResult};
use psynet_engine::{NodeNet, NodeTypeRegistry};

/// Run ticks against a saved net
#[derive(Args, Debug)]
pub struct RunCommand {
    /// Net directory to run
    pub directory: PathBuf,

    /// Number of ticks to run
    #[arg(short = 'n', long, default_value_t = 1)]
    pub ticks: u32,

    /// Discard the result instead of writing it back
    #[arg(long)]
    pub dry_run: bool,
}

impl RunCommand {
    pub fn execute(self) -> CliResult<()> {
        if !self.directory.join("net.npar").exists() {
            return Err(CliError::missing_resource(format!(
                "{} holds no net archive",
                self.directory.display()
            )));
        }

        let mut net = NodeNet::load(&self.directory, NodeTypeRegistry::new())?;
        let start = net.get_current_step();
        for _ in 0..self.ticks {
            net.step()?;
        }
        info!(
            "Ran {} ticks ({} -> {})",
            self.ticks,
            start,
            net.get_current_step()
        );

        if self.dry_run {
            info!("Dry run, discarding result");
        } else {
            net.save(&self.directory)?;
        }
        Ok(())
    }
}

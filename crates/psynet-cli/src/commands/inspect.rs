//! Saved net inspection

use clap::Args;
use std::path::PathBuf;
use tracing::info;

use crate::error::{CliError, CliResult};
use psynet_engine::{NodeNet, NodeTypeRegistry};

/// Inspect a saved net directory
#[derive(Args, Debug)]
pub struct InspectCommand {
    /// Net directory to inspect
    pub directory: PathBuf,

    /// Verify allocation integrity
    #[arg(long)]
    pub verify: bool,
}

impl InspectCommand {
    pub fn execute(self) -> CliResult<()> {
        if !self.directory.join("net.npar").exists() {
            return Err(CliError::missing_resource(format!(
                "{} holds no net archive",
                self.directory.display()
            )));
        }

        let net = NodeNet::load(&self.directory, NodeTypeRegistry::new())?;
        info!("Net: {}", self.directory.display());
        info!("Step: {}", net.get_current_step());

        for pid in net.partition_ids() {
            let partition = net.partition(pid)?;
            info!(
                "Partition {}: {} nodes, {} elements ({} used), {} links, {} nodespaces, {}",
                pid,
                partition.live_node_count(),
                partition.number_of_elements(),
                partition.used_element_count(),
                partition.link_count(),
                partition.nodespace_ids().len(),
                if partition.is_sparse() { "csr" } else { "dense" },
            );

            if self.verify {
                let problems = partition.integrity_check();
                if problems.is_empty() {
                    info!("Partition {}: integrity ok", pid);
                } else {
                    for problem in &problems {
                        info!("Partition {}: {}", pid, problem);
                    }
                    return Err(CliError::invalid_args(format!(
                        "partition {} failed integrity check with {} problems",
                        pid,
                        problems.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

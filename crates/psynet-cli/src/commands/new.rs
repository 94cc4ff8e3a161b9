//! Demo net creation

use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::info;

use crate::error::{CliError, CliResult};
use psynet_engine::types::{gate, nodetype};
use psynet_engine::{NodeNet, PartitionConfig, ROOT_NODESPACE};

/// Create a demo net directory
#[derive(Args, Debug)]
pub struct NewCommand {
    /// Directory to create the net in
    pub directory: PathBuf,

    /// Number of pipe nodes
    #[arg(long, default_value_t = 16)]
    pub pipes: usize,

    /// Number of register nodes
    #[arg(long, default_value_t = 32)]
    pub registers: usize,

    /// Random links to create
    #[arg(long, default_value_t = 128)]
    pub links: usize,

    /// Seed for the random topology
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Use a dense weight matrix instead of CSR
    #[arg(long)]
    pub dense: bool,
}

impl NewCommand {
    pub fn execute(self) -> CliResult<()> {
        if self.directory.join("net.npar").exists() {
            return Err(CliError::invalid_args(format!(
                "{} already holds a net",
                self.directory.display()
            )));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut net = NodeNet::new();
        let pid = net.create_partition(&PartitionConfig {
            sparse: !self.dense,
            initial_number_of_nodes: (self.pipes + self.registers).max(8),
            average_elements_per_node: 7,
            initial_number_of_nodespaces: 4,
        });

        let mut nodes = Vec::new();
        for _ in 0..self.pipes {
            nodes.push((
                net.create_node(pid, nodetype::PIPE, ROOT_NODESPACE)?,
                nodetype::PIPE,
            ));
        }
        for _ in 0..self.registers {
            nodes.push((
                net.create_node(pid, nodetype::REGISTER, ROOT_NODESPACE)?,
                nodetype::REGISTER,
            ));
        }

        let channels = |node_type: i32| if node_type == nodetype::PIPE { 7 } else { 1 };
        for _ in 0..self.links {
            let (source, source_type) = nodes[rng.gen_range(0..nodes.len())];
            let (target, target_type) = nodes[rng.gen_range(0..nodes.len())];
            net.set_link_weight(
                pid,
                source,
                rng.gen_range(0..channels(source_type)),
                pid,
                target,
                rng.gen_range(0..channels(target_type)),
                rng.gen_range(-1.0..1.0),
            )?;
        }
        {
            let mut partition = net.partition_mut(pid)?;
            for &(node, node_type) in &nodes {
                if node_type == nodetype::REGISTER {
                    partition.set_activation(node, gate::GEN, rng.gen_range(0.0..1.0), 0)?;
                }
            }
        }

        net.save(&self.directory)?;
        info!(
            "Created net with {} nodes and {} links in {}",
            nodes.len(),
            self.links,
            self.directory.display()
        );
        Ok(())
    }
}

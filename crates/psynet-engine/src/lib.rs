//! Partitioned spreading-activation engine for MicroPsi-style node nets
//!
//! Nodes occupy contiguous runs of scalar elements inside a partition; every
//! tick first propagates activation linearly through the partition's weight
//! matrix, then applies the non-linear per-element node functions (Pipe and
//! LSTM gate logic) and the gate transfer pipeline. Partitions exchange
//! activation through dedicated inter-partition link blocks, and persist as
//! keyed archives of labelled arrays.

#![deny(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod error;
pub mod gates;
pub mod inlinks;
pub mod matrix;
pub mod native;
pub mod nodenet;
pub mod partition;
pub mod types;

mod nodefn;

// Re-export essential types
pub use error::{EngineError, Result};
pub use gates::{apply_gate, GateParams};
pub use inlinks::InlinkBlock;
pub use matrix::WeightMatrix;
pub use native::{NativeModule, NativeModuleContext, NativeModuleFactory, NodeTypeRegistry};
pub use nodenet::NodeNet;
pub use partition::{
    LinkData, NodeData, NodeDataResult, Partition, PartitionConfig, ROOT_NODESPACE,
};
pub use types::{GateFunction, GateParameter, NodeParameter};

/// Engine crate version for compatibility checking
pub const ENGINE_VERSION: u32 = 1;

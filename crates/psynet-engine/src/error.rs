//! Error types for the engine

use psynet_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// An id does not refer to a live entity
    #[error("Invalid {entity} id {id}")]
    InvalidId {
        /// Entity kind (node, nodespace, partition)
        entity: &'static str,
        /// The offending id
        id: u32,
    },

    /// Unknown node type or selector value
    #[error("Invalid type {type_id}")]
    InvalidType {
        /// The offending numeric type
        type_id: i32,
    },

    /// Unknown gate function name
    #[error("Unknown gate function {name}")]
    InvalidGateFunction {
        /// The offending name
        name: String,
    },

    /// Gate or slot index out of range for the node's type
    #[error("Node {node} has no {channel} {index}")]
    InvalidGateOrSlot {
        /// The node id
        node: u32,
        /// "gate" or "slot"
        channel: &'static str,
        /// The offending index
        index: usize,
    },

    /// Named group does not exist in the given nodespace
    #[error("Group {group} does not exist in nodespace {nodespace}")]
    InvalidGroup {
        /// Group name
        group: String,
        /// Nodespace id
        nodespace: u32,
    },

    /// Bulk operation received data of the wrong shape
    #[error("Shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        /// Expected shape
        expected: String,
        /// Shape found
        found: String,
    },

    /// A capacity vector ran out before growth could absorb the allocation
    ///
    /// Allocation paths grow their vectors instead of returning this; it
    /// exists for internal consistency checks.
    #[error("Capacity exceeded: {resource} (limit: {limit})")]
    CapacityExceeded {
        /// Resource that ran out
        resource: &'static str,
        /// Capacity at the time of failure
        limit: usize,
    },

    /// Persistence data could not be decoded
    #[error("Persistence data malformed: {source}")]
    PersistenceMalformed {
        #[from]
        /// Source storage error
        source: StorageError,
    },

    /// Cross-partition bookkeeping refers to a partition that does not exist
    #[error("Cross-partition ordering violated: {reason}")]
    CrossPartitionOrder {
        /// What went wrong
        reason: String,
    },
}

impl EngineError {
    /// Create an invalid node id error
    pub fn invalid_node(id: u32) -> Self {
        Self::InvalidId { entity: "node", id }
    }

    /// Create an invalid nodespace id error
    pub fn invalid_nodespace(id: u32) -> Self {
        Self::InvalidId {
            entity: "nodespace",
            id,
        }
    }

    /// Create an invalid partition id error
    pub fn invalid_partition(id: u32) -> Self {
        Self::InvalidId {
            entity: "partition",
            id,
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a capacity exceeded error
    pub fn capacity_exceeded(resource: &'static str, limit: usize) -> Self {
        Self::CapacityExceeded { resource, limit }
    }

    /// Create a cross-partition ordering error
    pub fn cross_partition(reason: impl Into<String>) -> Self {
        Self::CrossPartitionOrder {
            reason: reason.into(),
        }
    }
}

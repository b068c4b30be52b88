//! Hierarchical Byzantine Fault-Tolerant Consensus Core
//!
//! Partitions a network of nodes into fixed-size consensus groups, runs a
//! local prepare phase inside each group, and combines per-group signature
//! aggregates into a network-wide decision with a weighted vote count.
//!
//! # Architecture
//!
//! - **Hash Ring**: 32-bit consistent hashing for deterministic group
//!   assignment and representative selection
//! - **Node Actors**: one lightweight task per node; representatives
//!   additionally aggregate their group's prepare messages
//! - **Coordinator**: collects aggregates, excludes alerted groups, tallies
//!   weighted votes, and commits the winning value
//! - **Bus Contract**: append-only streams and key/value maps; the only
//!   channel between actors

#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod messages;
pub mod node;
pub mod partition;
pub mod ring;

pub use bus::{Bus, Fields, MemoryBus};
pub use config::NbftConfig;
pub use coordinator::Coordinator;
pub use driver::RoundDriver;
pub use messages::{Alert, AlertReason, Commit, InPrepare, OutPrepare, PrePrepare1, PrePrepare2, RepAggregate, RoundDecision, BOTTOM};
pub use node::Node;
pub use partition::{assign_groups, pick_representative};
pub use ring::HashRing;

use thiserror::Error;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum Byzantine nodes tolerated inside one group of the given size
pub fn group_tolerance(group_size: usize) -> usize {
    group_size.saturating_sub(1) / 3
}

/// Maximum faulty groups tolerated across the network
pub fn network_tolerance(group_count: usize) -> usize {
    group_count.saturating_sub(1) / 3
}

/// Consensus errors
///
/// Protocol anomalies (timeouts, value mismatches, weak signature counts)
/// are not errors; they surface as [`messages::Alert`] records. Only
/// infrastructure failures reach this enum.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Configuration rejected before the round started
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Bus operation failed
    #[error("bus operation failed on key {key}: {reason}")]
    Bus {
        /// Stream or map key the operation targeted
        key: String,
        /// Failure description from the bus
        reason: String,
    },

    /// Round exceeded its global timeout
    #[error("round {0} timed out")]
    RoundTimeout(u64),

    /// Node actor task died before completing its phase
    #[error("actor task failed: {0}")]
    ActorFailed(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

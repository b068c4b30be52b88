//! Round Configuration
//!
//! Network parameters fixed for the lifetime of one consensus round, plus
//! the quantities derived from them: per-group tolerance, group count,
//! network-wide tolerance, and the quorum thresholds.

use crate::{ConsensusError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// NBFT network parameters, immutable within a round
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NbftConfig {
    /// Total number of nodes in the network
    pub n: usize,
    /// Number of nodes per consensus group
    pub m: usize,
    /// Current view number, rotates representative selection
    pub view: u64,
    /// Hash of the last confirmed block
    pub prev_hash: String,
    /// Address of the previous round's primary, seeds representative selection
    pub master_ip: String,
    /// Global timeout for one consensus round
    pub round_timeout: Duration,
    /// Deadline for the representative aggregation phase
    pub inprep2_deadline: Duration,
    /// Number of dishonest nodes the driver injects
    pub mal_nodes: usize,
}

impl Default for NbftConfig {
    fn default() -> Self {
        Self {
            n: 16,
            m: 4,
            view: 0,
            prev_hash: "genesis".to_string(),
            master_ip: "10.0.0.1".to_string(),
            round_timeout: Duration::from_secs(2),
            inprep2_deadline: Duration::from_secs(1),
            mal_nodes: 0,
        }
    }
}

impl NbftConfig {
    /// Create a configuration for `n` nodes in groups of `m`
    pub fn new(n: usize, m: usize) -> Self {
        Self {
            n,
            m,
            ..Self::default()
        }
    }

    /// Maximum Byzantine nodes tolerated per group
    pub fn group_tolerance(&self) -> usize {
        crate::group_tolerance(self.m)
    }

    /// Number of groups in the network
    pub fn group_count(&self) -> usize {
        (self.n + self.m - 1) / self.m
    }

    /// Maximum abnormal groups tolerated across the network
    pub fn network_tolerance(&self) -> usize {
        crate::network_tolerance(self.group_count())
    }

    /// Intra-group quorum: a value needs this many matching prepares
    pub fn quorum(&self) -> usize {
        2 * self.group_tolerance() + 1
    }

    /// Signature count at which a group is credited with its full weight
    ///
    /// A group showing at least `m - tolerance` valid signatures could only
    /// report a wrong value if more than `tolerance` members colluded, so
    /// the coordinator counts it as `m` votes.
    pub fn full_weight_threshold(&self) -> usize {
        self.m - self.group_tolerance()
    }

    /// Votes required for network-wide consensus
    pub fn consensus_threshold(&self) -> usize {
        (self.group_count() - self.network_tolerance()) * self.m
    }

    /// Validate configuration constraints
    pub fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(ConsensusError::InvalidConfig(
                "network must have at least 1 node".to_string(),
            ));
        }
        if self.m == 0 {
            return Err(ConsensusError::InvalidConfig(
                "group size must be at least 1".to_string(),
            ));
        }
        if self.mal_nodes > self.n {
            return Err(ConsensusError::InvalidConfig(format!(
                "cannot mark {} of {} nodes dishonest",
                self.mal_nodes, self.n
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = NbftConfig::default();
        assert_eq!(cfg.n, 16);
        assert_eq!(cfg.m, 4);
        assert_eq!(cfg.view, 0);
        assert_eq!(cfg.mal_nodes, 0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_derived_quantities() {
        let cfg = NbftConfig::new(16, 4);
        assert_eq!(cfg.group_tolerance(), 1);
        assert_eq!(cfg.group_count(), 4);
        assert_eq!(cfg.network_tolerance(), 1);
        assert_eq!(cfg.quorum(), 3);
        assert_eq!(cfg.full_weight_threshold(), 3);
        assert_eq!(cfg.consensus_threshold(), 12);
    }

    #[test]
    fn test_uneven_group_count() {
        let cfg = NbftConfig::new(17, 4);
        assert_eq!(cfg.group_count(), 5);
        assert_eq!(cfg.network_tolerance(), 1);
        assert_eq!(cfg.consensus_threshold(), 16);
    }

    #[test]
    fn test_single_node_network() {
        let cfg = NbftConfig::new(1, 1);
        assert_eq!(cfg.group_tolerance(), 0);
        assert_eq!(cfg.group_count(), 1);
        assert_eq!(cfg.network_tolerance(), 0);
        assert_eq!(cfg.quorum(), 1);
        assert_eq!(cfg.consensus_threshold(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(NbftConfig::new(0, 4).validate().is_err());
        assert!(NbftConfig::new(4, 0).validate().is_err());

        let mut cfg = NbftConfig::new(4, 4);
        cfg.mal_nodes = 5;
        assert!(cfg.validate().is_err());
    }
}

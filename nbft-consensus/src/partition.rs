//! Group Partitioning and Representative Selection
//!
//! Assigns the network's nodes into consensus groups by walking the hash
//! ring from a view-seeded position, and picks each group's representative
//! with a second ring lookup. Both operations are pure functions of their
//! inputs; two hosts with the same configuration derive the same topology
//! without exchanging a single message.

use crate::config::NbftConfig;
use crate::ring::HashRing;
use crate::{ConsensusError, Result};
use std::collections::HashSet;
use tracing::debug;

/// Partition `node_ids` into groups of up to `cfg.m` nodes
///
/// The walk is seeded with `"{view}_{node_count}"`, so a view change
/// reshuffles the whole topology. Groups are returned in construction
/// order; every group but the last holds exactly `cfg.m` ids, the last
/// holds the remainder. Empty groups are dropped.
pub fn assign_groups(node_ids: &[String], cfg: &NbftConfig) -> Vec<Vec<String>> {
    let ring = HashRing::new(node_ids.iter().cloned());
    let seed = format!("{}_{}", cfg.view, node_ids.len());
    let mut walk = ring.walk(&seed);

    let mut groups: Vec<Vec<String>> = vec![Vec::new(); cfg.group_count()];
    let mut assigned: HashSet<&str> = HashSet::with_capacity(node_ids.len());

    for group in &mut groups {
        for _ in 0..cfg.m {
            if assigned.len() == node_ids.len() {
                break;
            }
            // The walk is infinite; skip ids already placed in a group
            let id = loop {
                match walk.next() {
                    Some(candidate) if assigned.contains(candidate) => continue,
                    Some(candidate) => break candidate,
                    None => return Vec::new(),
                }
            };
            assigned.insert(id);
            group.push(id.to_string());
        }
    }

    groups.retain(|g| !g.is_empty());
    debug!(groups = groups.len(), nodes = node_ids.len(), "Assigned consensus groups");
    groups
}

/// Pick the representative of one group
///
/// A ring over the group's own members is probed with
/// `"{master_ip}|{view}|{group_id}"`; the clockwise owner becomes the
/// representative. The result is always a member of the group.
pub fn pick_representative(group: &[String], cfg: &NbftConfig, group_id: usize) -> Result<String> {
    let ring = HashRing::new(group.iter().cloned());
    let key = format!("{}|{}|{}", cfg.master_ip, cfg.view, group_id);
    ring.next(&key)
        .map(str::to_string)
        .ok_or_else(|| {
            ConsensusError::InvalidConfig(format!(
                "cannot pick a representative for empty group {}",
                group_id
            ))
        })
}

//! Round Coordinator
//!
//! Orchestrates inter-group consensus: publishes the proposal, collects the
//! latest aggregate of every group, excludes groups that alerted about
//! themselves, and counts weighted votes against the network threshold.
//!
//! Weighting: a group whose aggregate shows at least `m - tolerance` valid
//! signatures could only be wrong if more members colluded than the fault
//! model admits, so it votes with the full group weight `m`. A partial
//! aggregate is credited exactly its observed signatures.

use crate::bus::{keys, Bus, Fields};
use crate::config::NbftConfig;
use crate::messages::{Alert, Commit, OutPrepare, PrePrepare1, PrePrepare2, RepAggregate, RoundDecision, BOTTOM};
use crate::{ConsensusError, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra wait on top of the aggregation deadline, absorbing representative
/// publish latency
const COLLECT_SLACK: Duration = Duration::from_millis(700);

/// Interval between aggregate polls
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Inter-group orchestrator for one round
pub struct Coordinator {
    cfg: NbftConfig,
    groups: Vec<Vec<String>>,
    reps: Vec<String>,
    bus: Arc<dyn Bus>,
}

impl Coordinator {
    /// Bind the coordinator to the round's topology and bus
    pub fn new(cfg: NbftConfig, groups: Vec<Vec<String>>, reps: Vec<String>, bus: Arc<dyn Bus>) -> Self {
        Self { cfg, groups, reps, bus }
    }

    /// Wipe every key a previous round may have left behind
    ///
    /// The bus persists streams beyond a round; the sweep guarantees a
    /// clean slate before phase 1 writes anything.
    async fn purge(&self, rid: u64) -> Result<()> {
        for gid in 0..self.groups.len() {
            self.bus.delete(&keys::alerts(rid, gid)).await?;
            self.bus.delete(&keys::inprep1(gid)).await?;
            self.bus.delete(&keys::inprep2(gid)).await?;
        }
        self.bus.delete(&keys::rep_votes(rid)).await?;
        self.bus.delete(&keys::decisions(rid)).await?;
        self.bus.delete(keys::COMMIT).await?;
        self.bus.delete(keys::OUTPREPARE).await?;
        self.bus.delete(keys::PREPREPARE1).await?;
        self.bus.delete(keys::PREPREPARE2).await?;
        Ok(())
    }

    /// Purge prior state and persist the round's configuration maps
    pub async fn store_round_config(&self, rid: u64, node_ids: &[String]) -> Result<()> {
        self.purge(rid).await?;

        let config_fields = Fields::from([
            ("n".to_string(), self.cfg.n.to_string()),
            ("m".to_string(), self.cfg.m.to_string()),
            ("R".to_string(), self.cfg.group_count().to_string()),
            ("E".to_string(), self.cfg.group_tolerance().to_string()),
            ("omega".to_string(), self.cfg.network_tolerance().to_string()),
            ("view".to_string(), self.cfg.view.to_string()),
            ("prev".to_string(), self.cfg.prev_hash.clone()),
        ]);
        self.bus.map_set(&keys::round_config(rid), config_fields).await?;

        let group_fields: Fields = self
            .groups
            .iter()
            .enumerate()
            .flat_map(|(gid, group)| {
                group.iter().map(move |nid| (nid.clone(), gid.to_string()))
            })
            .collect();
        self.bus.map_set(&keys::groups(rid), group_fields).await?;

        let rep_fields: Fields = self
            .reps
            .iter()
            .enumerate()
            .map(|(gid, rep)| (gid.to_string(), rep.clone()))
            .collect();
        self.bus.map_set(&keys::rep(rid), rep_fields).await?;

        debug!(rid, nodes = node_ids.len(), groups = self.groups.len(), "Stored round config");
        Ok(())
    }

    /// Votes a group contributes given its valid signature count
    fn group_weight(&self, valid_sigs: usize) -> usize {
        let full = self.cfg.full_weight_threshold();
        if valid_sigs >= full {
            debug!(valid_sigs, full, weight = self.cfg.m, "Group at full weight");
            self.cfg.m
        } else {
            debug!(valid_sigs, full, weight = valid_sigs, "Group below full weight");
            valid_sigs
        }
    }

    /// Collect the latest aggregate per group until the deadline
    async fn collect_aggregates(&self, rid: u64) -> Result<BTreeMap<usize, RepAggregate>> {
        let deadline = tokio::time::Instant::now() + self.cfg.inprep2_deadline + COLLECT_SLACK;
        let mut aggregates: BTreeMap<usize, RepAggregate> = BTreeMap::new();

        info!(rid, groups = self.groups.len(), "Waiting for group aggregates");
        while tokio::time::Instant::now() < deadline && aggregates.len() < self.groups.len() {
            for gid in 0..self.groups.len() {
                if aggregates.contains_key(&gid) {
                    continue;
                }
                let Some((_, fields)) = self.bus.stream_last(&keys::inprep2(gid)).await? else {
                    continue;
                };
                let Some(agg) = RepAggregate::from_fields(&fields) else {
                    continue;
                };
                if agg.rid != rid {
                    continue;
                }
                info!(
                    group = gid,
                    rep = %agg.rep_id,
                    value = %agg.value,
                    valid_sigs = agg.valid_sigs,
                    "Received aggregate"
                );
                aggregates.insert(gid, agg);
            }
            if aggregates.len() < self.groups.len() {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        if aggregates.is_empty() {
            warn!(rid, "No aggregates received before deadline");
        }
        Ok(aggregates)
    }

    /// Groups disqualified by an alert about their own representative
    ///
    /// Only records whose `group_id` names the stream's own group count;
    /// alerts about other groups on the wrong stream are ignored.
    async fn excluded_groups(&self, rid: u64) -> Result<HashSet<usize>> {
        let mut excluded = HashSet::new();
        for gid in 0..self.groups.len() {
            let records = self.bus.stream_range(&keys::alerts(rid, gid), 0, u64::MAX).await?;
            let relevant = records
                .iter()
                .filter_map(|(_, fields)| Alert::from_fields(fields))
                .filter(|alert| alert.group_id == gid)
                .count();
            if relevant > 0 {
                excluded.insert(gid);
                warn!(group = gid, alerts = relevant, "Excluding group");
            }
        }
        Ok(excluded)
    }

    /// Run the inter-group phase: propose, collect, exclude, tally, commit
    pub async fn run_round(&self, rid: u64, value: &str) -> Result<RoundDecision> {
        let proposer = self.reps.first().ok_or_else(|| {
            ConsensusError::InvalidConfig("round has no groups, nothing to propose to".to_string())
        })?;
        let proposal = PrePrepare1::new(rid, proposer, value);
        self.bus.stream_append(keys::PREPREPARE1, proposal.to_fields()).await?;
        info!(rid, proposer = %proposer, value = %value, "Proposal published");

        let aggregates = self.collect_aggregates(rid).await?;
        let excluded = self.excluded_groups(rid).await?;

        // Weighted tally in ascending group order; first-seen order makes
        // the argmax tie-break deterministic
        let mut tally: Vec<(String, usize)> = Vec::new();
        for (gid, agg) in &aggregates {
            if excluded.contains(gid) {
                continue;
            }
            let weight = self.group_weight(agg.valid_sigs);
            match tally.iter_mut().find(|(v, _)| v == &agg.value) {
                Some((_, votes)) => *votes += weight,
                None => tally.push((agg.value.clone(), weight)),
            }
            info!(
                group = *gid,
                value = %agg.value,
                weight,
                valid_sigs = agg.valid_sigs,
                "Counting group"
            );
        }

        let threshold = self.cfg.consensus_threshold();
        let total_votes: usize = tally.iter().map(|(_, votes)| votes).sum();
        let (winner, votes) = tally
            .iter()
            .fold((BOTTOM.to_string(), 0), |(best_v, best_n), (v, n)| {
                if *n > best_n {
                    (v.clone(), *n)
                } else {
                    (best_v, best_n)
                }
            });
        let consensus = total_votes >= threshold;
        let invalid_votes = self.cfg.n.saturating_sub(total_votes);

        info!(
            rid,
            ?tally,
            total_votes,
            invalid_votes,
            threshold,
            winner = %winner,
            votes,
            "Tally result"
        );

        let vote_fields: Fields = tally
            .iter()
            .map(|(v, n)| (v.clone(), n.to_string()))
            .collect();
        self.bus.map_set(&keys::rep_votes(rid), vote_fields).await?;

        let out = OutPrepare {
            rid,
            winner: winner.clone(),
            votes: votes as u64,
            total: total_votes as u64,
            threshold: threshold as u64,
            consensus,
        };
        self.bus.stream_append(keys::OUTPREPARE, out.to_fields()).await?;

        if consensus {
            self.bus.map_set(&keys::decisions(rid), out.to_fields()).await?;
            let commit = Commit {
                rid,
                value: winner.clone(),
                votes: votes as u64,
            };
            self.bus.stream_append(keys::COMMIT, commit.to_fields()).await?;
            let closing = PrePrepare2::new(rid, &winner);
            self.bus.stream_append(keys::PREPREPARE2, closing.to_fields()).await?;
            info!(rid, winner = %winner, total_votes, "Consensus reached, value committed");
        } else {
            warn!(rid, total_votes, threshold, "Consensus not reached");
        }

        Ok(RoundDecision {
            rid,
            winner,
            votes: votes as u64,
            total: total_votes as u64,
            threshold: threshold as u64,
            consensus,
        })
    }
}

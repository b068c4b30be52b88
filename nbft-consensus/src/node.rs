//! Node Actor
//!
//! Per-node behavior inside one consensus group. Every node publishes a
//! signed prepare for the proposed value; the group's representative
//! additionally collects its group stream, aggregates matching signatures
//! into a [`RepAggregate`], and raises [`Alert`]s when the collection looks
//! anomalous. A dishonest node equivocates by substituting a fabricated
//! payload; it never crashes the round.

use crate::bus::{keys, Bus};
use crate::config::NbftConfig;
use crate::messages::{Alert, AlertReason, InPrepare, RepAggregate, BOTTOM};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Phases a representative moves through while aggregating
///
/// `Alerted` augments `Published`: the aggregate is on the bus either way,
/// alerts ride alongside it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RepPhase {
    /// Not yet collecting
    Init,
    /// Reading the group stream
    Collecting,
    /// Enough matching prepares observed
    Quorum,
    /// Collection ended below the quorum
    NoQuorum,
    /// Aggregate appended to the bus
    Published,
    /// Aggregate published together with one or more alerts
    Alerted,
}

/// One node of the network, bound to its group for the round
pub struct Node {
    /// Node identifier
    pub id: String,
    /// Group this node belongs to
    pub group_id: usize,
    /// The group's representative
    pub rep_id: String,
    /// Dishonest nodes equivocate with a fabricated payload
    pub honest: bool,
    cfg: NbftConfig,
    bus: Arc<dyn Bus>,
}

impl Node {
    /// Bind a node to its group, representative, and bus for one round
    pub fn new(
        id: impl Into<String>,
        cfg: NbftConfig,
        group_id: usize,
        rep_id: impl Into<String>,
        honest: bool,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            id: id.into(),
            group_id,
            rep_id: rep_id.into(),
            honest,
            cfg,
            bus,
        }
    }

    /// Whether this node aggregates for its group
    pub fn is_representative(&self) -> bool {
        self.id == self.rep_id
    }

    /// Opaque deterministic signature over the round id
    fn sign(&self, rid: u64) -> String {
        format!("sig:{}:{}", self.id, rid)
    }

    /// Publish this node's prepare for `value` to its group stream
    ///
    /// A dishonest node signs and sends `FAKE:{id}` instead, acting as an
    /// equivocator the group has to vote down.
    pub async fn in_prepare1(&self, rid: u64, value: &str) -> Result<()> {
        let value = if self.honest {
            value.to_string()
        } else {
            format!("FAKE:{}", self.id)
        };
        let sig = self.sign(rid);
        let msg = InPrepare::new(rid, self.group_id, &self.id, &value, sig);
        self.bus
            .stream_append(&keys::inprep1(self.group_id), msg.to_fields())
            .await?;
        debug!(
            node = %self.id,
            group = self.group_id,
            value = %value,
            "Sent prepare"
        );
        Ok(())
    }

    /// Aggregate the group's prepares; a no-op on non-representatives
    ///
    /// Reads the group stream in blocks, keeping the first prepare per
    /// node id, until `m` distinct senders are seen or `deadline` elapses.
    /// The most frequent value (ties broken by first encounter) wins the
    /// group when backed by a quorum of `2·tolerance + 1` matching
    /// prepares; otherwise the aggregate carries the no-consensus sentinel
    /// and zero valid signatures. Alerts follow the aggregate onto the bus.
    pub async fn in_prepare2_collect(
        &self,
        rid: u64,
        deadline: Duration,
    ) -> Result<Option<RepAggregate>> {
        if !self.is_representative() {
            return Ok(None);
        }

        let start = tokio::time::Instant::now();
        let deadline_at = start + deadline;
        let stream = keys::inprep1(self.group_id);

        let mut phase = RepPhase::Collecting;
        debug!(node = %self.id, group = self.group_id, phase = ?phase, "Aggregating prepares");

        let mut last_id = 0u64;
        let mut seen: Vec<InPrepare> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();

        while seen.len() < self.cfg.m {
            let now = tokio::time::Instant::now();
            if now >= deadline_at {
                break;
            }
            let remaining = (deadline_at - now).as_millis() as u64;
            let batch = self
                .bus
                .stream_scan(&stream, last_id, 50, remaining.min(200))
                .await?;
            for (id, fields) in batch {
                last_id = id;
                let Some(msg) = InPrepare::from_fields(&fields) else {
                    continue;
                };
                if msg.rid != rid || msg.group_id != self.group_id {
                    continue;
                }
                if !seen_ids.insert(msg.node_id.clone()) {
                    // First prepare per sender wins, duplicates are dropped
                    continue;
                }
                debug!(
                    node = %self.id,
                    group = self.group_id,
                    from = %msg.node_id,
                    value = %msg.value,
                    "Received prepare"
                );
                seen.push(msg);
            }
        }

        let timed_out = start.elapsed() >= deadline;

        // Value frequencies in first-encounter order, so ties resolve
        // deterministically
        let mut counts: Vec<(String, usize)> = Vec::new();
        for msg in &seen {
            match counts.iter_mut().find(|(v, _)| v == &msg.value) {
                Some((_, n)) => *n += 1,
                None => counts.push((msg.value.clone(), 1)),
            }
        }
        let (top_value, top_count) = counts
            .iter()
            .fold((BOTTOM.to_string(), 0), |(bv, bn), (v, n)| {
                if *n > bn {
                    (v.clone(), *n)
                } else {
                    (bv, bn)
                }
            });

        let has_quorum = top_count >= self.cfg.quorum();
        phase = if has_quorum { RepPhase::Quorum } else { RepPhase::NoQuorum };
        debug!(
            node = %self.id,
            group = self.group_id,
            top_count,
            distinct = counts.len(),
            phase = ?phase,
            "Collection finished"
        );

        let (value, valid_sigs) = if has_quorum {
            (top_value, top_count)
        } else {
            (BOTTOM.to_string(), 0)
        };

        let signers: Vec<String> = seen.iter().map(|m| m.node_id.clone()).collect();
        let aggregate = RepAggregate::new(rid, self.group_id, &self.id, &value, valid_sigs, signers);
        self.bus
            .stream_append(&keys::inprep2(self.group_id), aggregate.to_fields()?)
            .await?;
        phase = RepPhase::Published;
        info!(
            node = %self.id,
            group = self.group_id,
            value = %value,
            valid_sigs,
            phase = ?phase,
            "Published aggregate"
        );

        let mut reasons = Vec::new();
        if timed_out {
            reasons.push(AlertReason::Timeout);
        }
        if !has_quorum {
            if counts.len() > 1 {
                reasons.push(AlertReason::Mismatch);
            }
            reasons.push(AlertReason::WeakSig);
        }

        for reason in reasons {
            let alert = Alert::new(
                rid,
                self.group_id,
                &self.id,
                reason,
                format!("valid_sigs={}, rep={}", valid_sigs, self.rep_id),
            );
            self.bus
                .stream_append(&keys::alerts(rid, self.group_id), alert.to_fields())
                .await?;
            phase = RepPhase::Alerted;
            warn!(
                node = %self.id,
                group = self.group_id,
                reason = reason.as_str(),
                phase = ?phase,
                "Alert broadcast"
            );
        }

        Ok(Some(aggregate))
    }
}

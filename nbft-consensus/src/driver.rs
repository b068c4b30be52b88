//! Round Driver
//!
//! One-shot orchestration of a full consensus round: derive the topology,
//! mark the dishonest nodes, fan out the prepare phase to one task per
//! node, then run representative aggregation concurrently with the
//! coordinator's collection loop. The whole round is bounded by the
//! configured round timeout; elapsing it is an infrastructure failure,
//! not a protocol outcome.

use crate::bus::Bus;
use crate::config::NbftConfig;
use crate::coordinator::Coordinator;
use crate::messages::RoundDecision;
use crate::node::Node;
use crate::partition::{assign_groups, pick_representative};
use crate::{ConsensusError, Result};
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Launches node actors and the coordinator for independent rounds
pub struct RoundDriver {
    cfg: NbftConfig,
    bus: Arc<dyn Bus>,
}

impl RoundDriver {
    /// Bind a driver to its configuration and bus
    pub fn new(cfg: NbftConfig, bus: Arc<dyn Bus>) -> Self {
        Self { cfg, bus }
    }

    /// Run one round, sampling `mal_nodes` dishonest ids uniformly at random
    pub async fn run(&self, rid: u64, value: &str) -> Result<RoundDecision> {
        self.cfg.validate()?;
        let node_ids = self.node_ids();
        let dishonest: HashSet<String> = node_ids
            .choose_multiple(&mut rand::thread_rng(), self.cfg.mal_nodes)
            .cloned()
            .collect();
        self.run_with_dishonest(rid, value, &dishonest).await
    }

    /// Run one round with an explicit set of dishonest node ids
    pub async fn run_with_dishonest(
        &self,
        rid: u64,
        value: &str,
        dishonest: &HashSet<String>,
    ) -> Result<RoundDecision> {
        self.cfg.validate()?;
        let node_ids = self.node_ids();

        let groups = assign_groups(&node_ids, &self.cfg);
        let mut reps = Vec::with_capacity(groups.len());
        for (gid, group) in groups.iter().enumerate() {
            reps.push(pick_representative(group, &self.cfg, gid)?);
        }
        info!(
            rid,
            groups = groups.len(),
            reps = ?reps,
            dishonest = ?dishonest,
            "Round topology derived"
        );

        let coordinator = Coordinator::new(
            self.cfg.clone(),
            groups.clone(),
            reps.clone(),
            self.bus.clone(),
        );
        coordinator.store_round_config(rid, &node_ids).await?;

        let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(node_ids.len());
        for (gid, group) in groups.iter().enumerate() {
            for nid in group {
                let honest = !dishonest.contains(nid);
                if !honest {
                    debug!(node = %nid, group = gid, "Created dishonest node");
                }
                nodes.push(Arc::new(Node::new(
                    nid.clone(),
                    self.cfg.clone(),
                    gid,
                    reps[gid].clone(),
                    honest,
                    self.bus.clone(),
                )));
            }
        }

        let round = self.drive_phases(rid, value, &nodes, &coordinator);
        match tokio::time::timeout(self.cfg.round_timeout, round).await {
            Ok(decision) => decision,
            Err(_) => Err(ConsensusError::RoundTimeout(rid)),
        }
    }

    /// Prepare fan-out, then aggregation concurrent with the coordinator
    ///
    /// Every prepare append completes before any representative starts
    /// reading; the aggregation tasks then race the coordinator's own
    /// deadline, which outlasts theirs.
    async fn drive_phases(
        &self,
        rid: u64,
        value: &str,
        nodes: &[Arc<Node>],
        coordinator: &Coordinator,
    ) -> Result<RoundDecision> {
        let prepare_tasks: Vec<_> = nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                let value = value.to_string();
                tokio::spawn(async move { node.in_prepare1(rid, &value).await })
            })
            .collect();
        for joined in join_all(prepare_tasks).await {
            joined.map_err(|e| ConsensusError::ActorFailed(e.to_string()))??;
        }
        debug!(rid, nodes = nodes.len(), "Prepare phase complete");

        let deadline = self.cfg.inprep2_deadline;
        let collect_tasks: Vec<_> = nodes
            .iter()
            .map(|node| {
                let node = node.clone();
                tokio::spawn(async move { node.in_prepare2_collect(rid, deadline).await })
            })
            .collect();

        let decision = coordinator.run_round(rid, value).await?;

        for joined in join_all(collect_tasks).await {
            joined.map_err(|e| ConsensusError::ActorFailed(e.to_string()))??;
        }

        Ok(decision)
    }

    fn node_ids(&self) -> Vec<String> {
        (0..self.cfg.n).map(|i| format!("node-{}", i)).collect()
    }
}

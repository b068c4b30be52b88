//! End-to-End Round Scenarios
//!
//! Full rounds over the in-process bus, covering:
//! - Honest networks, even and uneven group sizes
//! - Dishonest placements that exclusion absorbs
//! - Dishonest placements that break consensus
//! - Representative timeouts and coordinator exclusion
//! - Deterministic topology derivation

use nbft_consensus::bus::{keys, Bus, MemoryBus};
use nbft_consensus::{
    assign_groups, pick_representative, Alert, Commit, Coordinator, NbftConfig, Node,
    RepAggregate, RoundDriver, BOTTOM,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn node_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("node-{}", i)).collect()
}

const PROPOSAL: &str = "BLOCK_HASH_ABC";

// ============================================================================
// Honest networks
// ============================================================================

#[tokio::test]
async fn honest_network_commits_with_every_signature() {
    let bus = MemoryBus::shared();
    let cfg = NbftConfig::new(16, 4);
    let driver = RoundDriver::new(cfg.clone(), bus.clone());

    let decision = driver.run(1, PROPOSAL).await.unwrap();
    assert!(decision.consensus);
    assert_eq!(decision.winner, PROPOSAL);
    assert_eq!(decision.votes, 16);
    assert_eq!(decision.total, 16);
    assert_eq!(decision.threshold, 12);

    // Every group agreed internally with all m signatures, never more
    for gid in 0..cfg.group_count() {
        let (_, fields) = bus.stream_last(&keys::inprep2(gid)).await.unwrap().unwrap();
        let agg = RepAggregate::from_fields(&fields).unwrap();
        assert_eq!(agg.value, PROPOSAL);
        assert_eq!(agg.valid_sigs, cfg.m);
        assert!(agg.valid_sigs <= cfg.m);
        assert!(bus
            .stream_last(&keys::alerts(1, gid))
            .await
            .unwrap()
            .is_none());
    }

    let (_, commit) = bus.stream_last(keys::COMMIT).await.unwrap().unwrap();
    let commit = Commit::from_fields(&commit).unwrap();
    assert_eq!(commit.value, PROPOSAL);
    assert_eq!(commit.votes, 16);
}

#[tokio::test]
async fn short_last_group_contributes_its_single_signature() {
    let bus = MemoryBus::shared();
    let cfg = NbftConfig::new(17, 4);
    let driver = RoundDriver::new(cfg.clone(), bus.clone());

    let decision = driver.run(1, PROPOSAL).await.unwrap();
    // R=5 groups, one of them a singleton: 4 full-weight groups plus one
    // lone signature against a threshold of (5-1)*4
    assert_eq!(decision.threshold, 16);
    assert_eq!(decision.total, 17);
    assert_eq!(decision.winner, PROPOSAL);
    assert!(decision.consensus);

    let groups = assign_groups(&node_ids(17), &cfg);
    let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
    assert_eq!(sizes, vec![4, 4, 4, 4, 1]);

    let short_gid = 4;
    let (_, fields) = bus
        .stream_last(&keys::inprep2(short_gid))
        .await
        .unwrap()
        .unwrap();
    let agg = RepAggregate::from_fields(&fields).unwrap();
    assert_eq!(agg.valid_sigs, 1);
}

// ============================================================================
// Dishonest placements
// ============================================================================

#[tokio::test]
async fn concentrated_dishonesty_is_excluded_and_consensus_survives() {
    let bus = MemoryBus::shared();
    let cfg = NbftConfig::new(16, 4);
    let groups = assign_groups(&node_ids(16), &cfg);

    // All four dishonest nodes land in the same group
    let dishonest: HashSet<String> = groups[0].iter().cloned().collect();
    let driver = RoundDriver::new(cfg, bus.clone());
    let decision = driver.run_with_dishonest(1, PROPOSAL, &dishonest).await.unwrap();

    // The poisoned group either reports no quorum or alerts its way out;
    // either way the other three carry the round at full weight
    assert!(decision.consensus);
    assert_eq!(decision.winner, PROPOSAL);
    assert_eq!(decision.total, 12);
    assert_eq!(decision.threshold, 12);

    let alerts = bus.stream_range(&keys::alerts(1, 0), 0, u64::MAX).await.unwrap();
    assert!(!alerts.is_empty());
    for (_, fields) in &alerts {
        assert_eq!(Alert::from_fields(fields).unwrap().group_id, 0);
    }

    let (_, fields) = bus.stream_last(&keys::inprep2(0)).await.unwrap().unwrap();
    assert_eq!(RepAggregate::from_fields(&fields).unwrap().value, BOTTOM);
}

#[tokio::test]
async fn spread_dishonesty_breaks_consensus() {
    let bus = MemoryBus::shared();
    let cfg = NbftConfig::new(16, 4);
    let groups = assign_groups(&node_ids(16), &cfg);

    // Two dishonest nodes in each of two groups: both groups fall below
    // quorum, alert, and are excluded
    let dishonest: HashSet<String> = groups[0][..2]
        .iter()
        .chain(groups[1][..2].iter())
        .cloned()
        .collect();
    let driver = RoundDriver::new(cfg, bus.clone());
    let decision = driver.run_with_dishonest(1, PROPOSAL, &dishonest).await.unwrap();

    assert!(!decision.consensus);
    assert_eq!(decision.total, 8);
    assert_eq!(decision.threshold, 12);
    assert_eq!(decision.winner, PROPOSAL);

    // The failed tally is still broadcast, nothing is committed
    assert!(bus.stream_last(keys::OUTPREPARE).await.unwrap().is_some());
    assert!(bus.stream_last(keys::COMMIT).await.unwrap().is_none());
    assert!(bus.map_get(&keys::decisions(1)).await.unwrap().is_none());
}

// ============================================================================
// Representative timeout and exclusion
// ============================================================================

#[tokio::test]
async fn silent_group_times_out_and_is_excluded() {
    let bus = MemoryBus::shared();
    let mut cfg = NbftConfig::new(8, 4);
    cfg.inprep2_deadline = Duration::from_millis(100);

    let groups = assign_groups(&node_ids(8), &cfg);
    let reps: Vec<String> = groups
        .iter()
        .enumerate()
        .map(|(gid, g)| pick_representative(g, &cfg, gid).unwrap())
        .collect();

    // Group 0 prepares in full; only two members of group 1 ever speak
    let bus_dyn: Arc<dyn Bus> = bus.clone();
    for nid in &groups[0] {
        Node::new(nid.clone(), cfg.clone(), 0, reps[0].clone(), true, bus_dyn.clone())
            .in_prepare1(1, PROPOSAL)
            .await
            .unwrap();
    }
    for nid in &groups[1][..2] {
        Node::new(nid.clone(), cfg.clone(), 1, reps[1].clone(), true, bus_dyn.clone())
            .in_prepare1(1, PROPOSAL)
            .await
            .unwrap();
    }

    for (gid, rep) in reps.iter().enumerate() {
        let agg = Node::new(rep.clone(), cfg.clone(), gid, rep.clone(), true, bus_dyn.clone())
            .in_prepare2_collect(1, cfg.inprep2_deadline)
            .await
            .unwrap()
            .unwrap();
        assert!(agg.valid_sigs <= cfg.m);
    }

    // The starved representative reported the sentinel and raised alerts
    let (_, fields) = bus.stream_last(&keys::inprep2(1)).await.unwrap().unwrap();
    let starved = RepAggregate::from_fields(&fields).unwrap();
    assert_eq!(starved.value, BOTTOM);
    assert_eq!(starved.valid_sigs, 0);

    let reasons: Vec<String> = bus
        .stream_range(&keys::alerts(1, 1), 0, u64::MAX)
        .await
        .unwrap()
        .iter()
        .map(|(_, f)| Alert::from_fields(f).unwrap().reason.as_str().to_string())
        .collect();
    assert_eq!(reasons, vec!["timeout", "weak_sig"]);

    let coordinator = Coordinator::new(cfg, groups, reps, bus_dyn);
    let decision = coordinator.run_round(1, PROPOSAL).await.unwrap();
    assert_eq!(decision.total, 4);
    assert!(!decision.consensus);
}

// ============================================================================
// Deterministic topology
// ============================================================================

#[tokio::test]
async fn topology_is_reproducible_and_persisted() {
    let cfg = NbftConfig::new(16, 4);
    let ids = node_ids(16);

    let first = assign_groups(&ids, &cfg);
    let second = assign_groups(&ids, &cfg);
    assert_eq!(first, second);

    let bus = MemoryBus::shared();
    let driver = RoundDriver::new(cfg.clone(), bus.clone());
    driver.run(1, PROPOSAL).await.unwrap();

    // The persisted node-to-group map mirrors the derived topology
    let group_map = bus.map_get(&keys::groups(1)).await.unwrap().unwrap();
    for (gid, group) in first.iter().enumerate() {
        for nid in group {
            assert_eq!(group_map[nid], gid.to_string());
        }
    }

    let rep_map = bus.map_get(&keys::rep(1)).await.unwrap().unwrap();
    for (gid, group) in first.iter().enumerate() {
        let rep = pick_representative(group, &cfg, gid).unwrap();
        assert_eq!(rep_map[&gid.to_string()], rep);
        assert!(group.contains(&rep));
    }

    let config_map = bus.map_get(&keys::round_config(1)).await.unwrap().unwrap();
    assert_eq!(config_map["n"], "16");
    assert_eq!(config_map["R"], "4");
}

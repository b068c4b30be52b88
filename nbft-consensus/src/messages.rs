//! Message Schema
//!
//! Typed records for every stream the protocol touches. On the wire each
//! record is a flat string-to-string map: numbers in decimal, timestamps as
//! float seconds since epoch, the signer list as a JSON array in a single
//! field. Decoding is explicit and per-field; a record that fails to decode
//! is skipped by its reader, never an error.

use crate::bus::Fields;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Sentinel carried in place of a value when a group reached no quorum
pub const BOTTOM: &str = "⊥";

/// Seconds since epoch as a float, the wire timestamp format
pub fn wall_clock_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn get_str(fields: &Fields, key: &str) -> Option<String> {
    match fields.get(key) {
        Some(v) => Some(v.clone()),
        None => {
            debug!(field = key, "record is missing a field, skipping");
            None
        }
    }
}

fn get_u64(fields: &Fields, key: &str) -> Option<u64> {
    let raw = get_str(fields, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!(field = key, raw = %raw, "record field is not an integer, skipping");
            None
        }
    }
}

fn get_usize(fields: &Fields, key: &str) -> Option<usize> {
    get_u64(fields, key).map(|v| v as usize)
}

fn get_f64(fields: &Fields, key: &str) -> Option<f64> {
    let raw = get_str(fields, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!(field = key, raw = %raw, "record field is not a float, skipping");
            None
        }
    }
}

fn get_bool(fields: &Fields, key: &str) -> Option<bool> {
    let raw = get_str(fields, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!(field = key, raw = %raw, "record field is not a bool, skipping");
            None
        }
    }
}

/// Initial proposal broadcast by the primary representative
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrePrepare1 {
    /// Round identifier
    pub rid: u64,
    /// Node id of the proposing representative
    pub proposer: String,
    /// Proposed payload
    pub value: String,
    /// Wire timestamp
    pub ts: f64,
}

impl PrePrepare1 {
    /// Build a proposal stamped with the current wall clock
    pub fn new(rid: u64, proposer: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            rid,
            proposer: proposer.into(),
            value: value.into(),
            ts: wall_clock_ts(),
        }
    }

    /// Encode to the wire map
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("rid".to_string(), self.rid.to_string()),
            ("proposer".to_string(), self.proposer.clone()),
            ("value".to_string(), self.value.clone()),
            ("ts".to_string(), self.ts.to_string()),
        ])
    }

    /// Decode from the wire map; `None` on any missing or malformed field
    pub fn from_fields(fields: &Fields) -> Option<Self> {
        Some(Self {
            rid: get_u64(fields, "rid")?,
            proposer: get_str(fields, "proposer")?,
            value: get_str(fields, "value")?,
            ts: get_f64(fields, "ts")?,
        })
    }
}

/// Decided-value broadcast closing a successful round
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrePrepare2 {
    /// Round identifier
    pub rid: u64,
    /// Winning payload
    pub value: String,
    /// Wire timestamp
    pub ts: f64,
}

impl PrePrepare2 {
    /// Build the closing broadcast for `rid`
    pub fn new(rid: u64, value: impl Into<String>) -> Self {
        Self {
            rid,
            value: value.into(),
            ts: wall_clock_ts(),
        }
    }

    /// Encode to the wire map
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("rid".to_string(), self.rid.to_string()),
            ("value".to_string(), self.value.clone()),
            ("ts".to_string(), self.ts.to_string()),
        ])
    }
}

/// Local prepare sent by each node to its group stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InPrepare {
    /// Round identifier
    pub rid: u64,
    /// Group the sender belongs to
    pub group_id: usize,
    /// Sender node id
    pub node_id: String,
    /// Payload the sender prepares
    pub value: String,
    /// Opaque deterministic signature
    pub sig: String,
    /// Wire timestamp
    pub ts: f64,
}

impl InPrepare {
    /// Build a prepare stamped with the current wall clock
    pub fn new(
        rid: u64,
        group_id: usize,
        node_id: impl Into<String>,
        value: impl Into<String>,
        sig: impl Into<String>,
    ) -> Self {
        Self {
            rid,
            group_id,
            node_id: node_id.into(),
            value: value.into(),
            sig: sig.into(),
            ts: wall_clock_ts(),
        }
    }

    /// Encode to the wire map
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("rid".to_string(), self.rid.to_string()),
            ("group_id".to_string(), self.group_id.to_string()),
            ("node_id".to_string(), self.node_id.clone()),
            ("value".to_string(), self.value.clone()),
            ("sig".to_string(), self.sig.clone()),
            ("ts".to_string(), self.ts.to_string()),
        ])
    }

    /// Decode from the wire map; `None` on any missing or malformed field
    pub fn from_fields(fields: &Fields) -> Option<Self> {
        Some(Self {
            rid: get_u64(fields, "rid")?,
            group_id: get_usize(fields, "group_id")?,
            node_id: get_str(fields, "node_id")?,
            value: get_str(fields, "value")?,
            sig: get_str(fields, "sig")?,
            ts: get_f64(fields, "ts")?,
        })
    }
}

/// A representative's summary of its group's prepare phase
///
/// `value` is the agreed payload, or [`BOTTOM`] when the group reached no
/// quorum, in which case `valid_sigs` is zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepAggregate {
    /// Round identifier
    pub rid: u64,
    /// Group this aggregate summarizes
    pub group_id: usize,
    /// Representative that produced the aggregate
    pub rep_id: String,
    /// Agreed payload, or the no-quorum sentinel
    pub value: String,
    /// Matching signatures behind `value`
    pub valid_sigs: usize,
    /// Node ids whose prepares the representative observed
    pub signers: Vec<String>,
    /// Wire timestamp
    pub ts: f64,
}

impl RepAggregate {
    /// Build an aggregate stamped with the current wall clock
    pub fn new(
        rid: u64,
        group_id: usize,
        rep_id: impl Into<String>,
        value: impl Into<String>,
        valid_sigs: usize,
        signers: Vec<String>,
    ) -> Self {
        Self {
            rid,
            group_id,
            rep_id: rep_id.into(),
            value: value.into(),
            valid_sigs,
            signers,
            ts: wall_clock_ts(),
        }
    }

    /// Whether the group failed to agree on a value
    pub fn is_bottom(&self) -> bool {
        self.value == BOTTOM
    }

    /// Encode to the wire map; the signer list travels as one JSON field
    pub fn to_fields(&self) -> crate::Result<Fields> {
        let sigs_json = serde_json::to_string(&self.signers)?;
        Ok(Fields::from([
            ("rid".to_string(), self.rid.to_string()),
            ("group_id".to_string(), self.group_id.to_string()),
            ("rep_id".to_string(), self.rep_id.clone()),
            ("value".to_string(), self.value.clone()),
            ("valid_sigs".to_string(), self.valid_sigs.to_string()),
            ("sigs_json".to_string(), sigs_json),
            ("ts".to_string(), self.ts.to_string()),
        ]))
    }

    /// Decode from the wire map; `None` on any missing or malformed field
    pub fn from_fields(fields: &Fields) -> Option<Self> {
        let sigs_json = get_str(fields, "sigs_json")?;
        let signers = match serde_json::from_str(&sigs_json) {
            Ok(v) => v,
            Err(_) => {
                debug!(field = "sigs_json", "record field is not a JSON array, skipping");
                return None;
            }
        };
        Some(Self {
            rid: get_u64(fields, "rid")?,
            group_id: get_usize(fields, "group_id")?,
            rep_id: get_str(fields, "rep_id")?,
            value: get_str(fields, "value")?,
            valid_sigs: get_usize(fields, "valid_sigs")?,
            signers,
            ts: get_f64(fields, "ts")?,
        })
    }
}

/// Why a representative raised an alert about its own group
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AlertReason {
    /// Collection ran into the aggregation deadline
    Timeout,
    /// More than one distinct value observed without a quorum
    Mismatch,
    /// Fewer matching signatures than the quorum requires
    WeakSig,
}

impl AlertReason {
    /// Wire spelling of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertReason::Timeout => "timeout",
            AlertReason::Mismatch => "mismatch",
            AlertReason::WeakSig => "weak_sig",
        }
    }

    /// Parse the wire spelling
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "timeout" => Some(AlertReason::Timeout),
            "mismatch" => Some(AlertReason::Mismatch),
            "weak_sig" => Some(AlertReason::WeakSig),
            _ => None,
        }
    }
}

/// Evidence of anomalous group behavior, grounds for exclusion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Round identifier
    pub rid: u64,
    /// Group the alert is about
    pub group_id: usize,
    /// Node that raised the alert
    pub node_id: String,
    /// What went wrong
    pub reason: AlertReason,
    /// Free-form supporting evidence
    pub evidence: String,
    /// Wire timestamp
    pub ts: f64,
}

impl Alert {
    /// Build an alert stamped with the current wall clock
    pub fn new(
        rid: u64,
        group_id: usize,
        node_id: impl Into<String>,
        reason: AlertReason,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            rid,
            group_id,
            node_id: node_id.into(),
            reason,
            evidence: evidence.into(),
            ts: wall_clock_ts(),
        }
    }

    /// Encode to the wire map
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("rid".to_string(), self.rid.to_string()),
            ("group_id".to_string(), self.group_id.to_string()),
            ("node_id".to_string(), self.node_id.clone()),
            ("reason".to_string(), self.reason.as_str().to_string()),
            ("evidence".to_string(), self.evidence.clone()),
            ("ts".to_string(), self.ts.to_string()),
        ])
    }

    /// Decode from the wire map; `None` on any missing or malformed field
    pub fn from_fields(fields: &Fields) -> Option<Self> {
        let reason_raw = get_str(fields, "reason")?;
        let reason = match AlertReason::parse(&reason_raw) {
            Some(r) => r,
            None => {
                debug!(field = "reason", raw = %reason_raw, "unknown alert reason, skipping");
                return None;
            }
        };
        Some(Self {
            rid: get_u64(fields, "rid")?,
            group_id: get_usize(fields, "group_id")?,
            node_id: get_str(fields, "node_id")?,
            reason,
            evidence: get_str(fields, "evidence")?,
            ts: get_f64(fields, "ts")?,
        })
    }
}

/// The coordinator's tally result, broadcast whether or not consensus held
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutPrepare {
    /// Round identifier
    pub rid: u64,
    /// Value with the most votes, or the sentinel when no aggregates arrived
    pub winner: String,
    /// Votes behind the winner
    pub votes: u64,
    /// Votes across all counted values
    pub total: u64,
    /// Votes required for consensus
    pub threshold: u64,
    /// Whether `total` reached `threshold`
    pub consensus: bool,
}

impl OutPrepare {
    /// Encode to the wire map
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("rid".to_string(), self.rid.to_string()),
            ("winner".to_string(), self.winner.clone()),
            ("votes".to_string(), self.votes.to_string()),
            ("total".to_string(), self.total.to_string()),
            ("threshold".to_string(), self.threshold.to_string()),
            ("consensus".to_string(), self.consensus.to_string()),
        ])
    }

    /// Decode from the wire map; `None` on any missing or malformed field
    pub fn from_fields(fields: &Fields) -> Option<Self> {
        Some(Self {
            rid: get_u64(fields, "rid")?,
            winner: get_str(fields, "winner")?,
            votes: get_u64(fields, "votes")?,
            total: get_u64(fields, "total")?,
            threshold: get_u64(fields, "threshold")?,
            consensus: get_bool(fields, "consensus")?,
        })
    }
}

/// Commit record for a round that reached consensus
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Round identifier
    pub rid: u64,
    /// Committed payload
    pub value: String,
    /// Votes behind the committed payload
    pub votes: u64,
}

impl Commit {
    /// Encode to the wire map
    pub fn to_fields(&self) -> Fields {
        Fields::from([
            ("rid".to_string(), self.rid.to_string()),
            ("value".to_string(), self.value.clone()),
            ("votes".to_string(), self.votes.to_string()),
        ])
    }

    /// Decode from the wire map; `None` on any missing or malformed field
    pub fn from_fields(fields: &Fields) -> Option<Self> {
        Some(Self {
            rid: get_u64(fields, "rid")?,
            value: get_str(fields, "value")?,
            votes: get_u64(fields, "votes")?,
        })
    }
}

/// The single externally observable output of a round
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundDecision {
    /// Round identifier
    pub rid: u64,
    /// Value with the most votes, or the sentinel when no aggregates arrived
    pub winner: String,
    /// Votes behind the winner
    pub votes: u64,
    /// Votes across all counted values
    pub total: u64,
    /// Votes required for consensus
    pub threshold: u64,
    /// Whether consensus was reached
    pub consensus: bool,
}

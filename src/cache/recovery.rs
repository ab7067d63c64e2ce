//! Recovery blobs exchanged during post-failure negotiation.
//!
//! Each survivor describes how far it got (barrier counters and the
//! slots it already holds for the current frame). The merged cluster
//! state is the furthest-along point every node can resume from.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::frame::{CacheKey, CachedData};
use crate::error::Result;

/// barrier id -> caller id -> completed rounds
pub type BarrierCounters = BTreeMap<String, BTreeMap<String, u64>>;

/// One node's recovery state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeSyncState {
    pub node_id: String,
    pub counters: BarrierCounters,
    pub cached: Vec<CachedData>,
}

impl NodeSyncState {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Total completed rounds, used to rank how far along a node is
    pub fn progress(&self) -> u64 {
        self.counters
            .values()
            .flat_map(|callers| callers.values())
            .sum()
    }
}

/// Merged state of every survivor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClusterSyncState {
    pub counters: BarrierCounters,
    pub cached: Vec<CachedData>,
}

impl ClusterSyncState {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn counter(&self, barrier_id: &str, caller_id: &str) -> u64 {
        self.counters
            .get(barrier_id)
            .and_then(|callers| callers.get(caller_id))
            .copied()
            .unwrap_or(0)
    }
}

/// Merge every node's state.
///
/// Counters take the maximum per (barrier, caller). A cached slot is taken
/// from the most advanced node that holds it, ties broken by node id, so
/// every node computing the merge gets the same answer.
pub fn build_cluster_sync_state(states: &[NodeSyncState]) -> ClusterSyncState {
    let mut merged = ClusterSyncState::default();

    for state in states {
        for (barrier_id, callers) in &state.counters {
            let entry = merged.counters.entry(barrier_id.clone()).or_default();
            for (caller_id, value) in callers {
                let counter = entry.entry(caller_id.clone()).or_insert(0);
                *counter = (*counter).max(*value);
            }
        }
    }

    let mut ranked: Vec<&NodeSyncState> = states.iter().collect();
    ranked.sort_by(|a, b| {
        b.progress()
            .cmp(&a.progress())
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    let mut taken: BTreeSet<CacheKey> = BTreeSet::new();
    for state in ranked {
        for data in &state.cached {
            if taken.insert(data.key()) {
                merged.cached.push(data.clone());
            }
        }
    }
    merged.cached.sort_by_key(CachedData::key);

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::TimeData;

    fn state(node_id: &str, frame_end: u64, time: Option<f64>) -> NodeSyncState {
        let mut counters = BarrierCounters::new();
        counters
            .entry("FrameEnd".into())
            .or_default()
            .insert(node_id.into(), frame_end);
        NodeSyncState {
            node_id: node_id.into(),
            counters,
            cached: time
                .map(|t| vec![CachedData::Time(TimeData::new(0.016, t))])
                .unwrap_or_default(),
        }
    }

    #[test]
    fn test_counters_take_max() {
        let merged = build_cluster_sync_state(&[
            state("node-b", 4, None),
            state("node-c", 5, None),
        ]);
        assert_eq!(merged.counter("FrameEnd", "node-b"), 4);
        assert_eq!(merged.counter("FrameEnd", "node-c"), 5);
        assert_eq!(merged.counter("FrameEnd", "node-a"), 0);
    }

    #[test]
    fn test_cached_slot_from_most_advanced_node() {
        let merged = build_cluster_sync_state(&[
            state("node-b", 4, Some(1.0)),
            state("node-c", 5, Some(2.0)),
        ]);
        assert_eq!(merged.cached, vec![CachedData::Time(TimeData::new(0.016, 2.0))]);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = build_cluster_sync_state(&[state("node-b", 3, Some(1.0)), state("node-c", 3, Some(2.0))]);
        let b = build_cluster_sync_state(&[state("node-c", 3, Some(2.0)), state("node-b", 3, Some(1.0))]);
        assert_eq!(a, b);
        assert_eq!(a.cached, vec![CachedData::Time(TimeData::new(0.016, 1.0))]);
    }

    #[test]
    fn test_blob_encoding() {
        let original = state("node-b", 2, Some(4.0));
        let bytes = original.to_bytes().unwrap();
        assert_eq!(NodeSyncState::from_bytes(&bytes).unwrap(), original);
    }
}

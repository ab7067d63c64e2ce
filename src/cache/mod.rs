//! Frame Data Cache Module
//!
//! Per-frame producer/consumer handoff for replicated data, plus the
//! barrier counters and recovery blobs used to resume after a failure.

mod slot;
mod frame;
pub mod recovery;

pub use slot::{CacheValue, DataSlot, Slot};
pub use frame::{CacheKey, CachedData, FrameDataCache};
pub use recovery::{build_cluster_sync_state, BarrierCounters, ClusterSyncState, NodeSyncState};

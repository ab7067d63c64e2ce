//! Frame data cache.
//!
//! Two instances exist per node: the local one (this frame's produced or
//! replicated values) and the cluster one, filled only by recovery with
//! the merged state of all survivors.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::recovery::{BarrierCounters, ClusterSyncState, NodeSyncState};
use super::slot::{CacheValue, DataSlot, Slot};
use crate::sync::{EventsData, NativeInputData, ObjectsData, SyncGroup, TimeData};

/// Selects one cached artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKey {
    Time,
    Objects(SyncGroup),
    Events,
    NativeInput,
}

impl CacheKey {
    pub const ALL: [CacheKey; 6] = [
        CacheKey::Time,
        CacheKey::Objects(SyncGroup::PreTick),
        CacheKey::Objects(SyncGroup::Tick),
        CacheKey::Objects(SyncGroup::PostTick),
        CacheKey::Events,
        CacheKey::NativeInput,
    ];
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::Time => write!(f, "GetTimeData"),
            CacheKey::Objects(group) => write!(f, "GetObjectsData_{}", group),
            CacheKey::Events => write!(f, "GetEventsData"),
            CacheKey::NativeInput => write!(f, "GetNativeInputData"),
        }
    }
}

/// A cached value tagged with its kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedData {
    Time(TimeData),
    Objects(SyncGroup, ObjectsData),
    Events(EventsData),
    NativeInput(NativeInputData),
}

impl CachedData {
    pub fn key(&self) -> CacheKey {
        match self {
            CachedData::Time(_) => CacheKey::Time,
            CachedData::Objects(group, _) => CacheKey::Objects(*group),
            CachedData::Events(_) => CacheKey::Events,
            CachedData::NativeInput(_) => CacheKey::NativeInput,
        }
    }
}

impl CacheValue for TimeData {
    fn into_data(self) -> CachedData {
        CachedData::Time(self)
    }

    fn from_data(data: CachedData) -> Option<Self> {
        match data {
            CachedData::Time(time) => Some(time),
            _ => None,
        }
    }
}

impl CacheValue for EventsData {
    fn into_data(self) -> CachedData {
        CachedData::Events(self)
    }

    fn from_data(data: CachedData) -> Option<Self> {
        match data {
            CachedData::Events(events) => Some(events),
            _ => None,
        }
    }
}

/// Objects slots remember their group so the kind-erased view can tag them
pub struct ObjectsSlot {
    group: SyncGroup,
    slot: Slot<ObjectsData>,
}

impl ObjectsSlot {
    fn new(group: SyncGroup) -> Self {
        Self {
            group,
            slot: Slot::new(),
        }
    }
}

impl std::ops::Deref for ObjectsSlot {
    type Target = Slot<ObjectsData>;

    fn deref(&self) -> &Self::Target {
        &self.slot
    }
}

impl DataSlot for ObjectsSlot {
    fn is_cached(&self) -> bool {
        self.slot.is_cached()
    }

    fn load_data(&self) -> Option<CachedData> {
        self.slot.load().map(|data| CachedData::Objects(self.group, data))
    }

    fn save_data(&self, data: CachedData) -> bool {
        match data {
            CachedData::Objects(group, objects) if group == self.group => {
                self.slot.save(objects);
                true
            }
            _ => false,
        }
    }

    fn reset(&self) {
        self.slot.reset()
    }

    fn release(&self) {
        self.slot.release()
    }
}

/// Native input shares its map type with objects, so it gets a wrapper too
pub struct NativeInputSlot {
    slot: Slot<NativeInputData>,
}

impl std::ops::Deref for NativeInputSlot {
    type Target = Slot<NativeInputData>;

    fn deref(&self) -> &Self::Target {
        &self.slot
    }
}

impl DataSlot for NativeInputSlot {
    fn is_cached(&self) -> bool {
        self.slot.is_cached()
    }

    fn load_data(&self) -> Option<CachedData> {
        self.slot.load().map(CachedData::NativeInput)
    }

    fn save_data(&self, data: CachedData) -> bool {
        match data {
            CachedData::NativeInput(input) => {
                self.slot.save(input);
                true
            }
            _ => false,
        }
    }

    fn reset(&self) {
        self.slot.reset()
    }

    fn release(&self) {
        self.slot.release()
    }
}

/// Per-frame cache of every replicated artifact
pub struct FrameDataCache {
    time: Slot<TimeData>,
    objects: [ObjectsSlot; 3],
    events: Slot<EventsData>,
    native_input: NativeInputSlot,
    /// Completed barrier rounds per (barrier, caller)
    barrier_counters: Mutex<BarrierCounters>,
}

impl Default for FrameDataCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDataCache {
    pub fn new() -> Self {
        Self {
            time: Slot::new(),
            objects: [
                ObjectsSlot::new(SyncGroup::PreTick),
                ObjectsSlot::new(SyncGroup::Tick),
                ObjectsSlot::new(SyncGroup::PostTick),
            ],
            events: Slot::new(),
            native_input: NativeInputSlot { slot: Slot::new() },
            barrier_counters: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn time(&self) -> &Slot<TimeData> {
        &self.time
    }

    pub fn objects(&self, group: SyncGroup) -> &Slot<ObjectsData> {
        &self.objects[group.index()]
    }

    pub fn events(&self) -> &Slot<EventsData> {
        &self.events
    }

    pub fn native_input(&self) -> &Slot<NativeInputData> {
        &self.native_input
    }

    /// Kind-erased slot for a key
    pub fn slot(&self, key: CacheKey) -> &dyn DataSlot {
        match key {
            CacheKey::Time => &self.time,
            CacheKey::Objects(group) => &self.objects[group.index()],
            CacheKey::Events => &self.events,
            CacheKey::NativeInput => &self.native_input,
        }
    }

    pub fn is_cached(&self, key: CacheKey) -> bool {
        self.slot(key).is_cached()
    }

    pub fn load(&self, key: CacheKey) -> Option<CachedData> {
        self.slot(key).load_data()
    }

    pub fn save(&self, data: CachedData) {
        let key = data.key();
        self.slot(key).save_data(data);
    }

    /// Time is reset on its own at frame start
    pub fn reset_time(&self) {
        self.time.reset();
    }

    /// Objects, events and native input are reset at frame end
    pub fn reset_frame(&self) {
        for slot in &self.objects {
            slot.reset();
        }
        self.events.reset();
        self.native_input.reset();
    }

    /// Wake every blocked reader, used on teardown
    pub fn release_all(&self) {
        for key in CacheKey::ALL {
            self.slot(key).release();
        }
    }

    /// Drop every value and counter
    pub fn clear(&self) {
        for key in CacheKey::ALL {
            self.slot(key).reset();
        }
        self.barrier_counters.lock().clear();
    }

    pub fn barrier_counter(&self, barrier_id: &str, caller_id: &str) -> u64 {
        self.barrier_counters
            .lock()
            .get(barrier_id)
            .and_then(|callers| callers.get(caller_id))
            .copied()
            .unwrap_or(0)
    }

    /// Highest completed round any caller reached on a barrier
    pub fn max_barrier_counter(&self, barrier_id: &str) -> u64 {
        self.barrier_counters
            .lock()
            .get(barrier_id)
            .and_then(|callers| callers.values().max())
            .copied()
            .unwrap_or(0)
    }

    /// Record one more completed round. Returns the new counter.
    pub fn increment_barrier_counter(&self, barrier_id: &str, caller_id: &str) -> u64 {
        let mut counters = self.barrier_counters.lock();
        let counter = counters
            .entry(barrier_id.to_string())
            .or_default()
            .entry(caller_id.to_string())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn barrier_counters(&self) -> BarrierCounters {
        self.barrier_counters.lock().clone()
    }

    /// Snapshot of this node's cache for recovery negotiation
    pub fn generate_node_sync_state(&self, node_id: &str) -> NodeSyncState {
        NodeSyncState {
            node_id: node_id.to_string(),
            counters: self.barrier_counters(),
            cached: CacheKey::ALL.iter().filter_map(|key| self.load(*key)).collect(),
        }
    }

    /// Load the merged cluster state. Counters only ever move forward.
    pub fn update_cluster_sync_state(&self, state: &ClusterSyncState) {
        {
            let mut counters = self.barrier_counters.lock();
            for (barrier_id, callers) in &state.counters {
                let local = counters.entry(barrier_id.clone()).or_default();
                for (caller_id, value) in callers {
                    let counter = local.entry(caller_id.clone()).or_insert(0);
                    *counter = (*counter).max(*value);
                }
            }
        }

        for data in &state.cached {
            self.save(data.clone());
        }
    }
}

//! Sync objects and their per-group registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Serialized objects keyed by sync id
pub type ObjectsData = BTreeMap<String, String>;

/// Replication phase an object belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncGroup {
    PreTick,
    Tick,
    PostTick,
}

impl SyncGroup {
    /// Groups in processing order
    pub const ALL: [SyncGroup; 3] = [SyncGroup::PreTick, SyncGroup::Tick, SyncGroup::PostTick];

    pub fn index(self) -> usize {
        match self {
            SyncGroup::PreTick => 0,
            SyncGroup::Tick => 1,
            SyncGroup::PostTick => 2,
        }
    }
}

impl std::fmt::Display for SyncGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncGroup::PreTick => write!(f, "PreTick"),
            SyncGroup::Tick => write!(f, "Tick"),
            SyncGroup::PostTick => write!(f, "PostTick"),
        }
    }
}

/// An object whose state is replicated from the primary.
///
/// Owners keep the object alive; the coordinator only holds a weak
/// reference, so implementations use interior mutability.
pub trait SyncObject: Send + Sync {
    /// Identity shared by every node
    fn sync_id(&self) -> String;

    fn is_active(&self) -> bool;

    fn is_dirty(&self) -> bool;

    fn serialize_to_string(&self) -> String;

    /// Apply replicated state. Returns false if the data was rejected.
    fn deserialize_from_string(&self, data: &str) -> bool;

    fn clear_dirty(&self);
}

/// Per-group registry of non-owning sync object references
#[derive(Default)]
pub struct ObjectRegistry {
    groups: [Mutex<HashMap<String, Weak<dyn SyncObject>>>; 3],
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, group: SyncGroup, object: &Arc<dyn SyncObject>) {
        let id = object.sync_id();
        tracing::debug!("Registering sync object '{}' in group {}", id, group);
        self.groups[group.index()]
            .lock()
            .insert(id, Arc::downgrade(object));
    }

    /// Remove an object from whichever group holds it
    pub fn unregister(&self, sync_id: &str) -> bool {
        let mut removed = false;
        for group in &self.groups {
            removed |= group.lock().remove(sync_id).is_some();
        }
        removed
    }

    pub fn clear(&self) {
        for group in &self.groups {
            group.lock().clear();
        }
    }

    pub fn len(&self, group: SyncGroup) -> usize {
        self.groups[group.index()].lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.lock().is_empty())
    }

    /// Serialize every active dirty object of a group and clear its dirty flag
    pub fn collect_dirty(&self, group: SyncGroup) -> ObjectsData {
        let mut data = ObjectsData::new();
        let mut objects = self.groups[group.index()].lock();

        // Owners that went away without unregistering
        objects.retain(|_, weak| weak.strong_count() > 0);

        for (id, weak) in objects.iter() {
            if let Some(object) = weak.upgrade() {
                if object.is_active() && object.is_dirty() {
                    data.insert(id.clone(), object.serialize_to_string());
                    object.clear_dirty();
                }
            }
        }

        data
    }

    /// Apply replicated data to the registered objects of a group
    pub fn apply(&self, group: SyncGroup, data: &ObjectsData) {
        let objects: Vec<(String, Arc<dyn SyncObject>)> = {
            let objects = self.groups[group.index()].lock();
            data.keys()
                .filter_map(|id| {
                    objects
                        .get(id)
                        .and_then(|weak| weak.upgrade())
                        .map(|object| (id.clone(), object))
                })
                .collect()
        };

        for (id, object) in objects {
            if let Some(serialized) = data.get(&id) {
                if !object.deserialize_from_string(serialized) {
                    tracing::warn!("Sync object '{}' rejected replicated data", id);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Minimal sync object holding a string value
    pub struct ValueObject {
        pub id: String,
        pub value: Mutex<String>,
        pub dirty: AtomicBool,
        pub active: AtomicBool,
    }

    impl ValueObject {
        pub fn new(id: &str, value: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                value: Mutex::new(value.to_string()),
                dirty: AtomicBool::new(true),
                active: AtomicBool::new(true),
            })
        }

        pub fn set(&self, value: &str) {
            *self.value.lock() = value.to_string();
            self.dirty.store(true, Ordering::SeqCst);
        }

        pub fn get(&self) -> String {
            self.value.lock().clone()
        }
    }

    impl SyncObject for ValueObject {
        fn sync_id(&self) -> String {
            self.id.clone()
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn is_dirty(&self) -> bool {
            self.dirty.load(Ordering::SeqCst)
        }

        fn serialize_to_string(&self) -> String {
            self.get()
        }

        fn deserialize_from_string(&self, data: &str) -> bool {
            *self.value.lock() = data.to_string();
            true
        }

        fn clear_dirty(&self) {
            self.dirty.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_collect_dirty_only() {
        let registry = ObjectRegistry::new();
        let a = ValueObject::new("a", "1");
        let b = ValueObject::new("b", "2");
        b.clear_dirty();

        let a_dyn: Arc<dyn SyncObject> = a.clone();
        let b_dyn: Arc<dyn SyncObject> = b.clone();
        registry.register(SyncGroup::Tick, &a_dyn);
        registry.register(SyncGroup::Tick, &b_dyn);

        let data = registry.collect_dirty(SyncGroup::Tick);
        assert_eq!(data.len(), 1);
        assert_eq!(data.get("a").map(String::as_str), Some("1"));
        assert!(!a.is_dirty());

        // Nothing dirty on the second pass
        assert!(registry.collect_dirty(SyncGroup::Tick).is_empty());
        assert!(registry.collect_dirty(SyncGroup::PreTick).is_empty());
    }

    #[test]
    fn test_inactive_objects_skipped() {
        let registry = ObjectRegistry::new();
        let a = ValueObject::new("a", "1");
        a.active.store(false, Ordering::SeqCst);
        let a_dyn: Arc<dyn SyncObject> = a.clone();
        registry.register(SyncGroup::PostTick, &a_dyn);

        assert!(registry.collect_dirty(SyncGroup::PostTick).is_empty());
        assert!(a.is_dirty());
    }

    #[test]
    fn test_dropped_owner_is_pruned() {
        let registry = ObjectRegistry::new();
        {
            let a = ValueObject::new("a", "1");
            let a_dyn: Arc<dyn SyncObject> = a;
            registry.register(SyncGroup::PreTick, &a_dyn);
        }
        assert!(registry.collect_dirty(SyncGroup::PreTick).is_empty());
        assert_eq!(registry.len(SyncGroup::PreTick), 0);
    }

    #[test]
    fn test_apply_and_unregister() {
        let registry = ObjectRegistry::new();
        let a = ValueObject::new("a", "old");
        let a_dyn: Arc<dyn SyncObject> = a.clone();
        registry.register(SyncGroup::Tick, &a_dyn);

        let mut data = ObjectsData::new();
        data.insert("a".into(), "new".into());
        data.insert("unknown".into(), "ignored".into());
        registry.apply(SyncGroup::Tick, &data);
        assert_eq!(a.get(), "new");

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.is_empty());
    }
}

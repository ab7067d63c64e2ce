//! Cluster events and the per-frame event queue.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Text event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterEventJson {
    pub category: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub is_system_event: bool,
    #[serde(default)]
    pub should_discard_on_repeat: bool,
}

impl ClusterEventJson {
    pub fn new(category: &str, event_type: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            event_type: event_type.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn discard_on_repeat(mut self, discard: bool) -> Self {
        self.should_discard_on_repeat = discard;
        self
    }

    pub fn system(mut self, system: bool) -> Self {
        self.is_system_event = system;
        self
    }

    pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    /// Deduplication key within a frame
    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.category, self.event_type, self.name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Binary event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterEventBinary {
    pub event_id: i32,
    pub event_data: Vec<u8>,
    pub is_system_event: bool,
    pub should_discard_on_repeat: bool,
}

impl ClusterEventBinary {
    pub fn new(event_id: i32, event_data: Vec<u8>) -> Self {
        Self {
            event_id,
            event_data,
            ..Self::default()
        }
    }

    pub fn discard_on_repeat(mut self, discard: bool) -> Self {
        self.should_discard_on_repeat = discard;
        self
    }

    pub fn system(mut self, system: bool) -> Self {
        self.is_system_event = system;
        self
    }
}

/// Every event of a frame, in delivery order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventsData {
    pub json: Vec<ClusterEventJson>,
    pub binary: Vec<ClusterEventBinary>,
}

impl EventsData {
    pub fn is_empty(&self) -> bool {
        self.json.is_empty() && self.binary.is_empty()
    }
}

/// Receives the events replicated each frame
pub trait ClusterEventListener: Send + Sync {
    fn on_cluster_event_json(&self, _event: &ClusterEventJson) {}

    fn on_cluster_event_binary(&self, _event: &ClusterEventBinary) {}
}

/// Events emitted on the primary during the current frame.
///
/// Discardable events are keyed (and partitioned by the system flag) so
/// that the latest emission of a key wins; everything else is kept in
/// emission order.
#[derive(Debug, Default)]
pub struct EventQueue {
    json_discardable: BTreeMap<bool, BTreeMap<String, ClusterEventJson>>,
    json_kept: Vec<ClusterEventJson>,
    binary_discardable: BTreeMap<bool, BTreeMap<i32, ClusterEventBinary>>,
    binary_kept: Vec<ClusterEventBinary>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_json(&mut self, event: ClusterEventJson) {
        if event.should_discard_on_repeat {
            self.json_discardable
                .entry(event.is_system_event)
                .or_default()
                .insert(event.dedup_key(), event);
        } else {
            self.json_kept.push(event);
        }
    }

    pub fn push_binary(&mut self, event: ClusterEventBinary) {
        if event.should_discard_on_repeat {
            self.binary_discardable
                .entry(event.is_system_event)
                .or_default()
                .insert(event.event_id, event);
        } else {
            self.binary_kept.push(event);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.json_discardable.values().all(BTreeMap::is_empty)
            && self.json_kept.is_empty()
            && self.binary_discardable.values().all(BTreeMap::is_empty)
            && self.binary_kept.is_empty()
    }

    /// Take every queued event. System events come first, then the
    /// remaining discardable ones, then the ordered list.
    pub fn drain(&mut self) -> EventsData {
        let mut data = EventsData::default();

        let mut json_discardable = std::mem::take(&mut self.json_discardable);
        for system in [true, false] {
            if let Some(events) = json_discardable.remove(&system) {
                data.json.extend(events.into_values());
            }
        }
        data.json.append(&mut self.json_kept);

        let mut binary_discardable = std::mem::take(&mut self.binary_discardable);
        for system in [true, false] {
            if let Some(events) = binary_discardable.remove(&system) {
                data.binary.extend(events.into_values());
            }
        }
        data.binary.append(&mut self.binary_kept);

        data
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discardable_json_deduplicated() {
        let mut queue = EventQueue::new();
        let low = ClusterEventJson::new("Sys", "Warn", "Low").discard_on_repeat(true);

        queue.push_json(low.clone());
        queue.push_json(low.clone());
        queue.push_json(low.clone().discard_on_repeat(false));

        let data = queue.drain();
        assert_eq!(data.json.len(), 2);
        assert!(data.json[0].should_discard_on_repeat);
        assert!(!data.json[1].should_discard_on_repeat);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_latest_discardable_wins() {
        let mut queue = EventQueue::new();
        queue.push_json(
            ClusterEventJson::new("Cam", "Move", "Main")
                .discard_on_repeat(true)
                .with_parameter("x", "1"),
        );
        queue.push_json(
            ClusterEventJson::new("Cam", "Move", "Main")
                .discard_on_repeat(true)
                .with_parameter("x", "2"),
        );

        let data = queue.drain();
        assert_eq!(data.json.len(), 1);
        assert_eq!(data.json[0].parameters.get("x").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_system_partition_is_separate() {
        let mut queue = EventQueue::new();
        queue.push_binary(ClusterEventBinary::new(7, vec![1]).discard_on_repeat(true));
        queue.push_binary(
            ClusterEventBinary::new(7, vec![2])
                .discard_on_repeat(true)
                .system(true),
        );
        queue.push_binary(ClusterEventBinary::new(7, vec![3]));

        let data = queue.drain();
        assert_eq!(data.binary.len(), 3);
        assert!(data.binary[0].is_system_event);
        assert_eq!(data.binary[2].event_data, vec![3]);
    }

    #[test]
    fn test_json_text_form() {
        let event = ClusterEventJson::new("Show", "Cue", "Start").with_parameter("scene", "2");
        let text = event.to_json().unwrap();
        assert!(text.contains("\"type\":\"Cue\""));
        assert_eq!(ClusterEventJson::from_json(&text).unwrap(), event);
    }
}

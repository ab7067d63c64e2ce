//! Replicated Data Module
//!
//! The data a primary publishes every frame: time, sync objects,
//! cluster events and native input.

mod time;
pub(crate) mod object;
mod event;

pub use time::{FrameTime, TimeData};
pub use object::{ObjectRegistry, ObjectsData, SyncGroup, SyncObject};
pub use event::{
    ClusterEventBinary, ClusterEventJson, ClusterEventListener, EventQueue, EventsData,
};

use std::collections::BTreeMap;

/// Native input state keyed by input name
pub type NativeInputData = BTreeMap<String, String>;

//! WolfSync - Render Cluster Frame Synchronization
//!
//! Keeps the render nodes of a multi-display cluster producing identical
//! frames. One node is primary: it publishes each frame's time, sync
//! objects, events and native input, and every node meets at barriers
//! around the frame.
//!
//! # Architecture
//!
//! A process owns one [`ClusterCoordinator`]. At session start it builds a
//! node controller for the operation mode (servers and client sets), a
//! failover controller that wraps every remote call in a transaction, and
//! a per-frame data cache whose slots block readers until the frame's data
//! is produced.
//!
//! # Features
//!
//! - Primary to secondary replication of time, objects, events and input
//! - Reusable cluster barriers with per-round payload exchange
//! - Node drop and primary election with post-failure negotiation
//! - TCP transport and an in-process transport for tests and tooling

pub mod config;
pub mod error;
pub mod state;
pub mod sync;
pub mod cache;
pub mod protocol;
pub mod network;
pub mod barrier;
pub mod controller;
pub mod failover;
pub mod cluster;

pub use cluster::ClusterCoordinator;
pub use config::ClusterConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ClusterCoordinator, ClusterObserver, TerminationHandler};
    pub use crate::config::{ClusterConfig, FailoverPolicy};
    pub use crate::error::{Error, Result};
    pub use crate::network::{LocalNetwork, TcpTransport, Transport};
    pub use crate::state::{DropReason, NodeRole, OperationMode};
    pub use crate::sync::{
        ClusterEventBinary, ClusterEventJson, ClusterEventListener, NativeInputData, SyncGroup,
        SyncObject, TimeData,
    };
}

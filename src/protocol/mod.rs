//! Cluster Protocol
//!
//! Services, result codes and the wire messages exchanged between nodes.

mod message;

pub use message::{
    ClusterHostingInfo, FrameHeader, NodeHostingInfo, Request, Response,
};

use serde::{Deserialize, Serialize};

/// Result of a protocol call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Ok,
    /// Invalid in the current mode or role
    NotAllowed,
    /// The current mode does not support the call at all
    NotImplemented,
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Ok => write!(f, "OK"),
            ResultCode::NotAllowed => write!(f, "NOT_ALLOWED"),
            ResultCode::NotImplemented => write!(f, "NOT_IMPLEMENTED"),
        }
    }
}

/// Network services every node can host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKind {
    ClusterSync,
    RenderSync,
    EventsJson,
    EventsBinary,
    GenericBarrier,
    InternalComm,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::ClusterSync,
        ServiceKind::RenderSync,
        ServiceKind::EventsJson,
        ServiceKind::EventsBinary,
        ServiceKind::GenericBarrier,
        ServiceKind::InternalComm,
    ];

    /// Services peers inside the cluster talk to
    pub const INTERNAL: [ServiceKind; 4] = [
        ServiceKind::ClusterSync,
        ServiceKind::RenderSync,
        ServiceKind::GenericBarrier,
        ServiceKind::InternalComm,
    ];

    /// Services tooling outside the cluster may talk to
    pub const EXTERNAL: [ServiceKind; 2] = [ServiceKind::EventsJson, ServiceKind::EventsBinary];

    /// Registry name of the service
    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::ClusterSync => "ClusterSync",
            ServiceKind::RenderSync => "RenderSync",
            ServiceKind::EventsJson => "ClusterEventsJson",
            ServiceKind::EventsBinary => "ClusterEventsBinary",
            ServiceKind::GenericBarrier => "GenericBarrier",
            ServiceKind::InternalComm => "InternalComm",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

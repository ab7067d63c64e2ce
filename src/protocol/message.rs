//! Wire Messages
//!
//! Requests and responses for every service, encoded with bincode and
//! framed by `FrameHeader` on TCP.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{ResultCode, ServiceKind};
use crate::error::{Error, Result};
use crate::state::DropReason;
use crate::sync::{
    ClusterEventBinary, ClusterEventJson, EventsData, NativeInputData, ObjectsData, SyncGroup,
    TimeData,
};

/// Where a node's services can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeHostingInfo {
    pub node_id: String,
    pub host: String,
    /// service name -> port
    pub ports: BTreeMap<String, u16>,
}

/// Hosting info of every node, keyed by node id
pub type ClusterHostingInfo = BTreeMap<String, NodeHostingInfo>;

/// Protocol requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    // ========== ClusterSync ==========
    WaitForGameStart { node_id: String },
    WaitForFrameStart { node_id: String },
    WaitForFrameEnd { node_id: String },
    GetTimeData,
    GetObjectsData { group: SyncGroup },
    GetEventsData,
    GetNativeInputData,

    // ========== RenderSync ==========
    SynchronizeOnBarrier { node_id: String },

    // ========== Events ==========
    EmitClusterEventJson { event: ClusterEventJson },
    EmitClusterEventBinary { event: ClusterEventBinary },

    // ========== GenericBarrier ==========
    CreateBarrier {
        barrier_id: String,
        /// node id -> caller ids
        participants: BTreeMap<String, BTreeSet<String>>,
        timeout_ms: u64,
    },
    WaitUntilBarrierIsCreated { barrier_id: String },
    IsBarrierAvailable { barrier_id: String },
    ReleaseBarrier { barrier_id: String },
    SyncOnBarrier { barrier_id: String, caller_id: String },
    SyncOnBarrierWithData {
        barrier_id: String,
        caller_id: String,
        data: Vec<u8>,
    },

    // ========== InternalComm ==========
    GatherServicesHostingInfo { info: NodeHostingInfo },
    PostFailureNegotiate { node_id: String, data: Vec<u8> },
    RequestNodeDrop { node_id: String, reason: DropReason },
}

impl Request {
    /// Service that answers this request
    pub fn service(&self) -> ServiceKind {
        match self {
            Request::WaitForGameStart { .. }
            | Request::WaitForFrameStart { .. }
            | Request::WaitForFrameEnd { .. }
            | Request::GetTimeData
            | Request::GetObjectsData { .. }
            | Request::GetEventsData
            | Request::GetNativeInputData => ServiceKind::ClusterSync,
            Request::SynchronizeOnBarrier { .. } => ServiceKind::RenderSync,
            Request::EmitClusterEventJson { .. } => ServiceKind::EventsJson,
            Request::EmitClusterEventBinary { .. } => ServiceKind::EventsBinary,
            Request::CreateBarrier { .. }
            | Request::WaitUntilBarrierIsCreated { .. }
            | Request::IsBarrierAvailable { .. }
            | Request::ReleaseBarrier { .. }
            | Request::SyncOnBarrier { .. }
            | Request::SyncOnBarrierWithData { .. } => ServiceKind::GenericBarrier,
            Request::GatherServicesHostingInfo { .. }
            | Request::PostFailureNegotiate { .. }
            | Request::RequestNodeDrop { .. } => ServiceKind::InternalComm,
        }
    }

    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::WaitForGameStart { .. } => "WaitForGameStart",
            Request::WaitForFrameStart { .. } => "WaitForFrameStart",
            Request::WaitForFrameEnd { .. } => "WaitForFrameEnd",
            Request::GetTimeData => "GetTimeData",
            Request::GetObjectsData { .. } => "GetObjectsData",
            Request::GetEventsData => "GetEventsData",
            Request::GetNativeInputData => "GetNativeInputData",
            Request::SynchronizeOnBarrier { .. } => "SynchronizeOnBarrier",
            Request::EmitClusterEventJson { .. } => "EmitClusterEventJson",
            Request::EmitClusterEventBinary { .. } => "EmitClusterEventBinary",
            Request::CreateBarrier { .. } => "CreateBarrier",
            Request::WaitUntilBarrierIsCreated { .. } => "WaitUntilBarrierIsCreated",
            Request::IsBarrierAvailable { .. } => "IsBarrierAvailable",
            Request::ReleaseBarrier { .. } => "ReleaseBarrier",
            Request::SyncOnBarrier { .. } => "SyncOnBarrier",
            Request::SyncOnBarrierWithData { .. } => "SyncOnBarrierWithData",
            Request::GatherServicesHostingInfo { .. } => "GatherServicesHostingInfo",
            Request::PostFailureNegotiate { .. } => "PostFailureNegotiate",
            Request::RequestNodeDrop { .. } => "RequestNodeDrop",
        }
    }

    /// Serialize request to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize request from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Protocol responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    /// The server refused the call for its mode or role
    Rejected { code: ResultCode, message: String },
    /// The server accepted the call but could not carry it out
    Failed { message: String },
    Time(TimeData),
    Objects(ObjectsData),
    Events(EventsData),
    NativeInput(NativeInputData),
    Bool(bool),
    Bytes(Vec<u8>),
    HostingInfo(ClusterHostingInfo),
}

impl Response {
    pub fn not_allowed(message: impl Into<String>) -> Self {
        Response::Rejected {
            code: ResultCode::NotAllowed,
            message: message.into(),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Response::Rejected {
            code: ResultCode::NotImplemented,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Response::Failed {
            message: message.into(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Response::Ok => "Ok",
            Response::Rejected { .. } => "Rejected",
            Response::Failed { .. } => "Failed",
            Response::Time(_) => "Time",
            Response::Objects(_) => "Objects",
            Response::Events(_) => "Events",
            Response::NativeInput(_) => "NativeInput",
            Response::Bool(_) => "Bool",
            Response::Bytes(_) => "Bytes",
            Response::HostingInfo(_) => "HostingInfo",
        }
    }

    /// Turn rejections and failures into errors
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Rejected {
                code: ResultCode::NotImplemented,
                message,
            } => Err(Error::NotImplemented(message)),
            Response::Rejected { message, .. } => Err(Error::NotAllowed(message)),
            Response::Failed { message } => Err(Error::Internal(message)),
            other => Ok(other),
        }
    }

    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest frame accepted from the wire
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header. Lengths past `u32::MAX` saturate so the
    /// header never matches a body it cannot describe.
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: u32::try_from(data.len()).unwrap_or(u32::MAX),
            checksum: crc32fast::hash(data),
        }
    }

    /// Check that a body of `size` bytes fits in one frame
    pub fn check_length(size: usize) -> Result<()> {
        if size > Self::MAX_LENGTH as usize {
            return Err(Error::MessageTooLarge {
                size,
                limit: Self::MAX_LENGTH,
            });
        }
        Ok(())
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }

    /// Check a received body against this header
    pub fn verify(&self, body: &[u8]) -> bool {
        body.len() == self.length as usize && crc32fast::hash(body) == self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_routing() {
        assert_eq!(Request::GetTimeData.service(), ServiceKind::ClusterSync);
        assert_eq!(
            Request::SynchronizeOnBarrier { node_id: "n".into() }.service(),
            ServiceKind::RenderSync
        );
        assert_eq!(
            Request::ReleaseBarrier { barrier_id: "b".into() }.service(),
            ServiceKind::GenericBarrier
        );
        assert_eq!(
            Request::RequestNodeDrop {
                node_id: "n".into(),
                reason: DropReason::Failed
            }
            .service(),
            ServiceKind::InternalComm
        );
    }

    #[test]
    fn test_rejection_maps_to_error() {
        let err = Response::not_implemented("CreateBarrier")
            .into_result()
            .unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::NotImplemented));

        let err = Response::not_allowed("GetTimeData").into_result().unwrap_err();
        assert_eq!(err.result_code(), Some(ResultCode::NotAllowed));

        assert!(Response::Bool(true).into_result().is_ok());
    }

    #[test]
    fn test_frame_header() {
        let data = b"GetObjectsData";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
        assert!(restored.verify(data));
        assert!(!restored.verify(b"GetObjectsDatA"));
    }
}

//! Server-side request handling.
//!
//! Every service a node hosts shares one `ServerContext`: the built-in
//! barriers, the generic barriers, the terminating flag and a weak handle
//! back to the coordinator for data exports and node drops.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crate::barrier::{
    BarrierOutcome, BarrierRegistry, ClusterBarrier, FRAME_END_BARRIER, FRAME_START_BARRIER,
    GAME_START_BARRIER, HOSTING_INFO_BARRIER, NEGOTIATION_BARRIER, RENDER_SYNC_BARRIER,
};
use crate::cache::{build_cluster_sync_state, NodeSyncState};
use crate::cluster::ClusterCoordinator;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::network::RequestHandler;
use crate::protocol::{ClusterHostingInfo, NodeHostingInfo, Request, Response, ServiceKind};
use crate::state::DropReason;

/// State shared by every server of a node
pub struct ServerContext {
    node_id: String,
    /// Frame, render and internal barriers
    sync_barriers: BarrierRegistry,
    /// Barriers created through the GenericBarrier service
    generic_barriers: BarrierRegistry,
    generic_wait_timeout: Duration,
    terminating: AtomicBool,
    coordinator: Weak<ClusterCoordinator>,
}

impl ServerContext {
    pub fn new(
        node_id: &str,
        config: &ClusterConfig,
        coordinator: Weak<ClusterCoordinator>,
    ) -> Arc<Self> {
        let nodes = config.node_ids();
        let sync_barriers = BarrierRegistry::new();

        let builtin = [
            (GAME_START_BARRIER, config.game_start_timeout()),
            (FRAME_START_BARRIER, config.frame_start_timeout()),
            (FRAME_END_BARRIER, config.frame_end_timeout()),
            (RENDER_SYNC_BARRIER, config.render_sync_timeout()),
            (HOSTING_INFO_BARRIER, config.game_start_timeout()),
            (NEGOTIATION_BARRIER, config.negotiation_timeout()),
        ];
        for (barrier_id, timeout) in builtin {
            sync_barriers.insert(Arc::new(ClusterBarrier::for_nodes(barrier_id, &nodes, timeout)));
        }

        Arc::new(Self {
            node_id: node_id.to_string(),
            sync_barriers,
            generic_barriers: BarrierRegistry::new(),
            generic_wait_timeout: Duration::from_millis(config.network.request_timeout_ms),
            terminating: AtomicBool::new(false),
            coordinator,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Reject every further request and wake every barrier waiter
    pub fn terminate(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        self.sync_barriers.deactivate_all();
        self.generic_barriers.deactivate_all();
    }

    /// Forget a node in every barrier this node hosts
    pub fn remove_node(&self, node_id: &str) {
        self.sync_barriers.remove_node(node_id);
        self.generic_barriers.remove_node(node_id);
    }

    fn sync_on(
        &self,
        registry: &BarrierRegistry,
        barrier_id: &str,
        caller_id: &str,
        data: Vec<u8>,
    ) -> Result<BarrierOutcome> {
        let barrier = registry
            .get(barrier_id)
            .ok_or_else(|| Error::Barrier(format!("barrier '{}' does not exist", barrier_id)))?;
        let outcome = barrier.wait(caller_id, data)?;

        for node_id in &outcome.timed_out {
            self.drop_late_node(node_id);
        }
        Ok(outcome)
    }

    /// Nodes that missed a barrier are dropped from a separate thread; the
    /// drop waits for in-flight transactions, possibly including the one
    /// this handler is serving.
    fn drop_late_node(&self, node_id: &str) {
        let coordinator = self.coordinator.clone();
        let node = node_id.to_string();

        let spawned = thread::Builder::new()
            .name(format!("wolfsync-drop-{}", node_id))
            .spawn(move || {
                if let Some(coordinator) = coordinator.upgrade() {
                    if let Err(e) = coordinator.drop_node(&node, DropReason::Failed) {
                        tracing::error!("Failed to drop late node {}: {}", node, e);
                    }
                }
            });

        if let Err(e) = spawned {
            tracing::error!("Could not spawn drop thread for {}: {}", node_id, e);
        }
    }
}

/// Handler for one hosted service
pub struct ServiceHandler {
    kind: ServiceKind,
    context: Arc<ServerContext>,
}

impl ServiceHandler {
    pub fn new(kind: ServiceKind, context: Arc<ServerContext>) -> Self {
        Self { kind, context }
    }

    fn dispatch(&self, coordinator: &ClusterCoordinator, request: Request) -> Result<Response> {
        let context = &self.context;

        let response = match request {
            // ClusterSync
            Request::WaitForGameStart { node_id } => {
                context.sync_on(&context.sync_barriers, GAME_START_BARRIER, &node_id, Vec::new())?;
                Response::Ok
            }
            Request::WaitForFrameStart { node_id } => {
                context.sync_on(&context.sync_barriers, FRAME_START_BARRIER, &node_id, Vec::new())?;
                Response::Ok
            }
            Request::WaitForFrameEnd { node_id } => {
                context.sync_on(&context.sync_barriers, FRAME_END_BARRIER, &node_id, Vec::new())?;
                Response::Ok
            }
            Request::GetTimeData => match coordinator.export_time_data() {
                Some(time) => Response::Time(time),
                None => Response::failed("time data released before it was cached"),
            },
            Request::GetObjectsData { group } => match coordinator.export_objects_data(group) {
                Some(objects) => Response::Objects(objects),
                None => Response::failed(format!("{} objects released before they were cached", group)),
            },
            Request::GetEventsData => match coordinator.export_events_data() {
                Some(events) => Response::Events(events),
                None => Response::failed("events released before they were cached"),
            },
            Request::GetNativeInputData => match coordinator.export_native_input_data() {
                Some(input) => Response::NativeInput(input),
                None => Response::failed("native input released before it was cached"),
            },

            // RenderSync
            Request::SynchronizeOnBarrier { node_id } => {
                context.sync_on(&context.sync_barriers, RENDER_SYNC_BARRIER, &node_id, Vec::new())?;
                Response::Ok
            }

            // Events
            Request::EmitClusterEventJson { event } => {
                coordinator.queue_cluster_event_json(event);
                Response::Ok
            }
            Request::EmitClusterEventBinary { event } => {
                coordinator.queue_cluster_event_binary(event);
                Response::Ok
            }

            // GenericBarrier
            Request::CreateBarrier {
                barrier_id,
                participants,
                timeout_ms,
            } => Response::Bool(context.generic_barriers.create(
                &barrier_id,
                &participants,
                Duration::from_millis(timeout_ms),
            )),
            Request::WaitUntilBarrierIsCreated { barrier_id } => Response::Bool(
                context
                    .generic_barriers
                    .wait_until_created(&barrier_id, context.generic_wait_timeout),
            ),
            Request::IsBarrierAvailable { barrier_id } => {
                Response::Bool(context.generic_barriers.is_available(&barrier_id))
            }
            Request::ReleaseBarrier { barrier_id } => {
                Response::Bool(context.generic_barriers.release(&barrier_id))
            }
            Request::SyncOnBarrier {
                barrier_id,
                caller_id,
            } => {
                context.sync_on(&context.generic_barriers, &barrier_id, &caller_id, Vec::new())?;
                Response::Ok
            }
            Request::SyncOnBarrierWithData {
                barrier_id,
                caller_id,
                data,
            } => {
                let outcome = context.sync_on(&context.generic_barriers, &barrier_id, &caller_id, data)?;
                Response::Bytes(bincode::serialize(&*outcome.response)?)
            }

            // InternalComm
            Request::GatherServicesHostingInfo { info } => {
                let caller = info.node_id.clone();
                let outcome = context.sync_on(
                    &context.sync_barriers,
                    HOSTING_INFO_BARRIER,
                    &caller,
                    bincode::serialize(&info)?,
                )?;

                let mut cluster = ClusterHostingInfo::new();
                for bytes in outcome.response.values() {
                    let node: NodeHostingInfo = bincode::deserialize(bytes)?;
                    cluster.insert(node.node_id.clone(), node);
                }
                Response::HostingInfo(cluster)
            }
            Request::PostFailureNegotiate { node_id, data } => {
                let outcome = context.sync_on(&context.sync_barriers, NEGOTIATION_BARRIER, &node_id, data)?;

                let states = outcome
                    .response
                    .values()
                    .map(|bytes| NodeSyncState::from_bytes(bytes))
                    .collect::<Result<Vec<_>>>()?;
                let merged = build_cluster_sync_state(&states);

                tracing::info!(
                    "Negotiated cluster state from {} node(s): {:?}",
                    states.len(),
                    states.iter().map(|s| s.node_id.as_str()).collect::<Vec<_>>()
                );
                Response::Bytes(merged.to_bytes()?)
            }
            Request::RequestNodeDrop { node_id, reason } => {
                let coordinator = context.coordinator.clone();
                thread::Builder::new()
                    .name(format!("wolfsync-drop-{}", node_id))
                    .spawn(move || {
                        if let Some(coordinator) = coordinator.upgrade() {
                            coordinator.handle_drop_request(&node_id, reason);
                        }
                    })?;
                Response::Ok
            }
        };

        Ok(response)
    }
}

impl RequestHandler for ServiceHandler {
    fn handle(&self, request: Request) -> Response {
        if self.context.is_terminating() {
            return Response::not_allowed(format!(
                "{} rejected: node {} is shutting down",
                request.type_name(),
                self.context.node_id
            ));
        }

        if request.service() != self.kind {
            return Response::not_allowed(format!(
                "{} is not served by {}",
                request.type_name(),
                self.kind
            ));
        }

        let Some(coordinator) = self.context.coordinator.upgrade() else {
            return Response::failed("coordinator is gone");
        };

        let type_name = request.type_name();
        match self.dispatch(&coordinator, request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("{} on {} failed: {}", type_name, self.kind, e);
                Response::failed(e.to_string())
            }
        }
    }
}

/// Map of service name to the port a bound server listens on
pub fn hosting_ports(services: &BTreeMap<&'static str, String>) -> BTreeMap<String, u16> {
    services
        .iter()
        .filter_map(|(name, address)| {
            address
                .rsplit_once(':')
                .and_then(|(_, port)| port.parse().ok())
                .map(|port| (name.to_string(), port))
        })
        .collect()
}

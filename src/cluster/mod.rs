//! Cluster Coordinator
//!
//! Single authority for role, primary identity, the active node set and
//! per-frame data replication. One coordinator lives per process; the
//! controllers it creates only hold weak references back to it.

mod barriers;
mod observer;

pub use observer::{ClusterObserver, ProcessExit, TerminationHandler};

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::barrier::{FRAME_END_BARRIER, FRAME_START_BARRIER, GAME_START_BARRIER, RENDER_SYNC_BARRIER};
use crate::cache::{CacheKey, CachedData, FrameDataCache};
use crate::config::ClusterConfig;
use crate::controller::NodeController;
use crate::error::{Error, Result};
use crate::failover::{FailoverController, FailoverStats, FailureSink};
use crate::network::Transport;
use crate::protocol::{ClusterHostingInfo, Request, Response, ServiceKind};
use crate::state::{ClusterMembership, ClusterSummary, DropReason, NodeRole, OperationMode};
use crate::sync::{
    ClusterEventBinary, ClusterEventJson, ClusterEventListener, EventQueue, EventsData,
    NativeInputData, ObjectRegistry, ObjectsData, SyncGroup, SyncObject, TimeData,
};

/// Everything that exists only between StartSession and EndSession
struct Session {
    node_id: String,
    config: Arc<ClusterConfig>,
    controller: Arc<NodeController>,
    failover: Arc<FailoverController>,
    /// This node's producer/consumer cache
    cache: Arc<FrameDataCache>,
    export_timeout: Duration,
}

impl Session {
    fn is_cluster(&self) -> bool {
        self.controller.mode() == OperationMode::Cluster
    }
}

pub struct ClusterCoordinator {
    self_ref: Weak<ClusterCoordinator>,
    transport: Arc<dyn Transport>,
    membership: Arc<ClusterMembership>,
    session: RwLock<Option<Arc<Session>>>,
    objects: ObjectRegistry,
    events: Mutex<EventQueue>,
    listeners: RwLock<Vec<Arc<dyn ClusterEventListener>>>,
    observers: RwLock<Vec<Arc<dyn ClusterObserver>>>,
    termination: RwLock<Arc<dyn TerminationHandler>>,
    /// Last values the host handed in on this node
    last_time: Mutex<Option<TimeData>>,
    last_native_input: Mutex<NativeInputData>,
    /// Time imported this frame
    current_time: Mutex<Option<TimeData>>,
    hosting_info: RwLock<ClusterHostingInfo>,
}

impl ClusterCoordinator {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            transport,
            membership: Arc::new(ClusterMembership::new()),
            session: RwLock::new(None),
            objects: ObjectRegistry::new(),
            events: Mutex::new(EventQueue::new()),
            listeners: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            termination: RwLock::new(Arc::new(ProcessExit)),
            last_time: Mutex::new(None),
            last_native_input: Mutex::new(NativeInputData::new()),
            current_time: Mutex::new(None),
            hosting_info: RwLock::new(ClusterHostingInfo::new()),
        })
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| Error::NotAllowed("no active cluster session".to_string()))
    }

    // ========== Session lifecycle ==========

    /// Start a session as `node_id`. Fails on an empty or unknown node id,
    /// an invalid configuration, or when networking cannot start.
    pub fn start_session(&self, config: ClusterConfig, node_id: &str) -> Result<()> {
        if node_id.is_empty() {
            return Err(Error::Config("node id is empty".to_string()));
        }
        config.validate()?;
        if config.node(node_id).is_none() {
            return Err(Error::UnknownNode(node_id.to_string()));
        }
        if self.session.read().is_some() {
            return Err(Error::Config("a session is already running".to_string()));
        }

        let config = Arc::new(config);
        self.membership
            .init(node_id, &config.node_ids(), &config.primary_node_id);

        let controller = Arc::new(NodeController::new(
            config.operation_mode,
            node_id,
            Arc::clone(&config),
            Arc::clone(&self.transport),
            Arc::clone(&self.membership),
            self.self_ref.clone(),
        ));
        let cache = Arc::new(FrameDataCache::new());
        let sink: Weak<dyn FailureSink> = self.self_ref.clone();
        let failover = Arc::new(FailoverController::new(
            node_id,
            &config,
            Arc::clone(&self.membership),
            Arc::clone(&controller),
            Arc::clone(&cache),
            sink,
        ));

        // Servers may answer as soon as they are up, so the session must
        // exist before networking starts
        *self.session.write() = Some(Arc::new(Session {
            node_id: node_id.to_string(),
            export_timeout: Duration::from_millis(config.network.request_timeout_ms),
            config,
            controller: Arc::clone(&controller),
            failover,
            cache,
        }));

        if let Err(e) = controller.start_session() {
            tracing::error!("Networking failed to start for node {}: {}", node_id, e);
            self.end_session();
            return Err(e);
        }

        tracing::info!(
            "Session started: node {} as {} in {} mode (primary {})",
            node_id,
            self.membership.role(),
            controller.mode(),
            self.membership.primary_node_id()
        );
        Ok(())
    }

    /// Tear the session down. Every blocked reader is released first so
    /// nothing stays stuck waiting on this node.
    pub fn end_session(&self) {
        let Some(session) = self.session.write().take() else {
            return;
        };

        self.observers.write().clear();
        self.listeners.write().clear();

        session.controller.end_session();
        session.cache.release_all();
        session.failover.release();

        self.membership.clear();
        self.objects.clear();
        self.events.lock().clear();
        *self.last_time.lock() = None;
        self.last_native_input.lock().clear();
        *self.current_time.lock() = None;
        self.hosting_info.write().clear();

        tracing::info!("Session ended for node {}", session.node_id);
    }

    pub fn has_session(&self) -> bool {
        self.session.read().is_some()
    }

    // ========== Frame lifecycle ==========

    /// Meet the other nodes once before the first frame and exchange
    /// service hosting info
    pub fn wait_for_game_start(&self) -> Result<()> {
        let session = self.session()?;
        if !session.is_cluster() {
            return Ok(());
        }

        session.failover.sync(
            GAME_START_BARRIER,
            &session.node_id,
            Request::WaitForGameStart {
                node_id: session.node_id.clone(),
            },
        )?;
        self.gather_services_hosting_info(&session)
    }

    fn gather_services_hosting_info(&self, session: &Session) -> Result<()> {
        let Some(info) = session.controller.local_hosting_info() else {
            return Ok(());
        };

        match session.failover.push(
            "GatherServicesHostingInfo",
            Request::GatherServicesHostingInfo { info },
        )? {
            Response::HostingInfo(cluster) => {
                tracing::info!("Gathered hosting info of {} node(s)", cluster.len());
                *self.hosting_info.write() = cluster;
                Ok(())
            }
            other => Err(Error::Internal(format!(
                "unexpected {} response to GatherServicesHostingInfo",
                other.type_name()
            ))),
        }
    }

    /// Reset this frame's time and wait for every node to start the frame.
    ///
    /// The reset happens before this node arrives at the barrier, and the
    /// barrier cannot release before the primary arrives, so no secondary
    /// can read the previous frame's time from the primary.
    pub fn start_frame(&self, frame: u64) -> Result<()> {
        let session = self.session()?;
        session.cache.reset_time();
        session.failover.reset_time();
        *self.current_time.lock() = None;

        if session.is_cluster() {
            session.failover.sync(
                FRAME_START_BARRIER,
                &session.node_id,
                Request::WaitForFrameStart {
                    node_id: session.node_id.clone(),
                },
            )?;
        }

        tracing::trace!("Frame {} started on {}", frame, session.node_id);
        Ok(())
    }

    /// Wait for every node to finish the frame, then clear the frame's
    /// objects, events and native input
    pub fn end_frame(&self, frame: u64) -> Result<()> {
        let session = self.session()?;
        self.wait_for_frame_end()?;

        session.cache.reset_frame();
        session.failover.reset_frame();

        tracing::trace!("Frame {} ended on {}", frame, session.node_id);
        Ok(())
    }

    pub fn wait_for_frame_end(&self) -> Result<()> {
        let session = self.session()?;
        if !session.is_cluster() {
            return Ok(());
        }

        session
            .failover
            .sync(
                FRAME_END_BARRIER,
                &session.node_id,
                Request::WaitForFrameEnd {
                    node_id: session.node_id.clone(),
                },
            )
            .map(|_| ())
    }

    /// Render thread lockstep
    pub fn synchronize_on_render_barrier(&self) -> Result<()> {
        let session = self.session()?;
        if !session.is_cluster() {
            return Ok(());
        }

        session
            .failover
            .sync(
                RENDER_SYNC_BARRIER,
                &session.node_id,
                Request::SynchronizeOnBarrier {
                    node_id: session.node_id.clone(),
                },
            )
            .map(|_| ())
    }

    pub fn pre_tick(&self, _delta_seconds: f64) -> Result<()> {
        self.sync_objects(SyncGroup::PreTick)?;
        self.sync_events().map(|_| ())
    }

    pub fn tick(&self, _delta_seconds: f64) -> Result<()> {
        self.sync_objects(SyncGroup::Tick)
    }

    pub fn post_tick(&self, _delta_seconds: f64) -> Result<()> {
        self.sync_objects(SyncGroup::PostTick)
    }

    // ========== Producers (primary) ==========

    /// Serialize dirty objects of a group into this frame's slot
    pub fn cache_objects(&self, group: SyncGroup) -> Result<()> {
        let session = self.session()?;
        self.require_primary("CacheObjects")?;

        if session.cache.objects(group).fill_with(|| self.objects.collect_dirty(group)) {
            tracing::trace!("Cached {} objects", group);
        }
        Ok(())
    }

    /// Record the host's time for this frame. Every node records it; only
    /// the primary publishes it.
    pub fn cache_time_data(&self, time: TimeData) -> Result<()> {
        *self.last_time.lock() = Some(time);
        let session = self.session()?;

        if self.membership.is_primary() {
            session.cache.time().fill_with(|| time);
        }
        Ok(())
    }

    /// Move queued events into this frame's slot
    pub fn cache_events(&self) -> Result<()> {
        let session = self.session()?;
        self.require_primary("CacheEvents")?;

        session.cache.events().fill_with(|| self.events.lock().drain());
        Ok(())
    }

    /// Record native input. Every node records it; only the primary
    /// publishes it.
    pub fn cache_native_input_data(&self, input: NativeInputData) -> Result<()> {
        *self.last_native_input.lock() = input.clone();
        let session = self.session()?;

        if self.membership.is_primary() {
            session.cache.native_input().fill_with(|| input);
        }
        Ok(())
    }

    fn require_primary(&self, operation: &str) -> Result<()> {
        if self.membership.is_primary() {
            Ok(())
        } else {
            Err(Error::NotAllowed(format!(
                "{} is primary-only, node {} is {}",
                operation,
                self.membership.node_id(),
                self.membership.role()
            )))
        }
    }

    // ========== Replication (every node) ==========

    pub fn sync_objects(&self, group: SyncGroup) -> Result<()> {
        let session = self.session()?;
        let data = session.failover.get(CacheKey::Objects(group), &|| {
            if let Err(e) = self.cache_objects(group) {
                tracing::warn!("Could not cache {} objects: {}", group, e);
            }
        })?;

        // Applied on the primary too, so it runs on exactly what it published
        if let CachedData::Objects(_, objects) = data {
            self.objects.apply(group, &objects);
        }
        Ok(())
    }

    pub fn sync_time_data(&self) -> Result<TimeData> {
        let session = self.session()?;
        let data = session.failover.get(CacheKey::Time, &|| {
            let time = self.last_time.lock().unwrap_or_default();
            session.cache.time().fill_with(|| time);
        })?;

        match data {
            CachedData::Time(time) => {
                *self.current_time.lock() = Some(time);
                Ok(time)
            }
            other => Err(Error::Internal(format!("expected time data, got {:?}", other.key()))),
        }
    }

    /// Pull this frame's events and hand them to the listeners
    pub fn sync_events(&self) -> Result<EventsData> {
        let session = self.session()?;
        let data = session.failover.get(CacheKey::Events, &|| {
            if let Err(e) = self.cache_events() {
                tracing::warn!("Could not cache events: {}", e);
            }
        })?;

        let CachedData::Events(events) = data else {
            return Err(Error::Internal("expected events data".to_string()));
        };

        let listeners = self.listeners.read().clone();
        for event in &events.json {
            for listener in &listeners {
                listener.on_cluster_event_json(event);
            }
        }
        for event in &events.binary {
            for listener in &listeners {
                listener.on_cluster_event_binary(event);
            }
        }
        Ok(events)
    }

    pub fn sync_native_input_data(&self) -> Result<NativeInputData> {
        let session = self.session()?;
        let data = session.failover.get(CacheKey::NativeInput, &|| {
            let input = self.last_native_input.lock().clone();
            session.cache.native_input().fill_with(|| input);
        })?;

        match data {
            CachedData::NativeInput(input) => Ok(input),
            other => Err(Error::Internal(format!(
                "expected native input, got {:?}",
                other.key()
            ))),
        }
    }

    // ========== Consumers (server side) ==========

    /// Block until this frame's time is cached, then copy it out
    pub fn export_time_data(&self) -> Option<TimeData> {
        let session = self.session().ok()?;
        session.cache.time().wait_load_for(session.export_timeout)
    }

    pub fn export_objects_data(&self, group: SyncGroup) -> Option<ObjectsData> {
        let session = self.session().ok()?;
        session.cache.objects(group).wait_load_for(session.export_timeout)
    }

    pub fn export_events_data(&self) -> Option<EventsData> {
        let session = self.session().ok()?;
        session.cache.events().wait_load_for(session.export_timeout)
    }

    pub fn export_native_input_data(&self) -> Option<NativeInputData> {
        let session = self.session().ok()?;
        session.cache.native_input().wait_load_for(session.export_timeout)
    }

    // ========== Events ==========

    /// Queue on the primary, forward from a secondary. `primary_only`
    /// events emitted on a secondary are dropped.
    pub fn emit_cluster_event_json(&self, event: ClusterEventJson, primary_only: bool) -> Result<()> {
        let session = self.session()?;

        if self.membership.is_primary() {
            self.queue_cluster_event_json(event);
            return Ok(());
        }
        if primary_only {
            tracing::trace!("Primary-only event {} not forwarded", event.dedup_key());
            return Ok(());
        }

        session
            .failover
            .push("EmitClusterEventJson", Request::EmitClusterEventJson { event })
            .map(|_| ())
    }

    pub fn emit_cluster_event_binary(&self, event: ClusterEventBinary, primary_only: bool) -> Result<()> {
        let session = self.session()?;

        if self.membership.is_primary() {
            self.queue_cluster_event_binary(event);
            return Ok(());
        }
        if primary_only {
            tracing::trace!("Primary-only binary event {} not forwarded", event.event_id);
            return Ok(());
        }

        session
            .failover
            .push("EmitClusterEventBinary", Request::EmitClusterEventBinary { event })
            .map(|_| ())
    }

    /// Add an event to this frame's queue
    pub fn queue_cluster_event_json(&self, event: ClusterEventJson) {
        self.events.lock().push_json(event);
    }

    pub fn queue_cluster_event_binary(&self, event: ClusterEventBinary) {
        self.events.lock().push_binary(event);
    }

    // ========== Node drops ==========

    /// Ask a node to leave the cluster. Primary only.
    pub fn drop_cluster_node(&self, node_id: &str) -> Result<()> {
        self.drop_node(node_id, DropReason::UserRequest)
    }

    /// A user request is sent to the target, which shuts itself down; the
    /// local active set is untouched until the cluster sees it go. A failed
    /// node is removed here and now.
    pub fn drop_node(&self, node_id: &str, reason: DropReason) -> Result<()> {
        let session = self.session()?;

        match reason {
            DropReason::UserRequest => {
                self.require_primary("DropClusterNode")?;
                if !self.membership.is_active(node_id) {
                    return Err(Error::UnknownNode(node_id.to_string()));
                }
                if node_id == session.node_id {
                    self.terminate(&format!("node {} dropped by user request", node_id));
                    return Ok(());
                }

                tracing::info!("Requesting node {} to leave the cluster", node_id);
                let results = session.failover.mcast(
                    "RequestNodeDrop",
                    Request::RequestNodeDrop {
                        node_id: node_id.to_string(),
                        reason,
                    },
                    &[node_id.to_string()],
                );
                results
                    .into_iter()
                    .next()
                    .map(|(_, result)| result.map(|_| ()))
                    .unwrap_or(Ok(()))
            }
            DropReason::Failed => self.drop_failed_node(&session, node_id, true),
        }
    }

    /// Failure pipeline: leave the active set, release the node's
    /// resources, tell the other survivors, recover, then notify.
    fn drop_failed_node(&self, session: &Session, node_id: &str, broadcast: bool) -> Result<()> {
        if node_id == session.node_id {
            let reason = format!("node {} was dropped from the cluster as failed", node_id);
            self.terminate(&reason);
            return Err(Error::Unrecoverable(reason));
        }

        if !self.membership.all_nodes().iter().any(|id| id == node_id) {
            return Err(Error::UnknownNode(node_id.to_string()));
        }

        let newly_dropped = self.membership.deactivate(node_id);
        if newly_dropped {
            tracing::warn!(
                "Dropping failed node {} ({} node(s) remain active)",
                node_id,
                self.membership.active_count()
            );
            session.controller.drop_node_resources(node_id);

            if broadcast && session.is_cluster() {
                let targets: Vec<String> = self
                    .membership
                    .active_nodes()
                    .into_iter()
                    .filter(|id| id != &session.node_id)
                    .collect();
                session.failover.mcast(
                    "RequestNodeDrop",
                    Request::RequestNodeDrop {
                        node_id: node_id.to_string(),
                        reason: DropReason::Failed,
                    },
                    &targets,
                );
            }
        }

        // Whoever takes the recovery lock first processes the failure; the
        // other caller returns once it is done.
        let outcome = match session.failover.handle_failure(node_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Cluster cannot recover from failure of {}: {}", node_id, e);
                self.terminate(&e.to_string());
                return Err(e);
            }
        };
        if !outcome.handled {
            tracing::debug!("Failure of {} handled elsewhere", node_id);
            return Ok(());
        }

        let mut failed = vec![node_id.to_string()];
        failed.extend(outcome.also_failed);
        for failed_node in &failed {
            self.notify_node_failed(failed_node);
        }
        if let Some(primary) = &outcome.new_primary {
            self.notify_primary_changed(primary);
        }

        for failed_node in &failed {
            let event = ClusterEventJson::new("Cluster", "NodeFailed", failed_node)
                .system(true)
                .discard_on_repeat(false);
            if let Err(e) = self.emit_cluster_event_json(event, true) {
                tracing::warn!("Could not emit node-down event for {}: {}", failed_node, e);
            }
        }
        Ok(())
    }

    /// Drop request arriving from another node
    pub fn handle_drop_request(&self, node_id: &str, reason: DropReason) {
        let Ok(session) = self.session() else {
            return;
        };

        match reason {
            DropReason::UserRequest if node_id == session.node_id => {
                tracing::info!("Primary asked node {} to leave the cluster", node_id);
                self.terminate("drop requested by the primary");
            }
            DropReason::UserRequest => {
                tracing::warn!("Ignoring drop request addressed to {}", node_id);
            }
            DropReason::Failed => {
                if let Err(e) = self.drop_failed_node(&session, node_id, false) {
                    tracing::warn!("Dropping {} on peer request failed: {}", node_id, e);
                }
            }
        }
    }

    fn terminate(&self, reason: &str) {
        let handler = Arc::clone(&*self.termination.read());
        handler.terminate(reason);
    }

    // ========== Role ==========

    /// Move the primary to `node_id`. No-op if it already is primary or is
    /// not active.
    ///
    /// Only promotes. A node that was primary keeps `NodeRole::Primary`, and
    /// with it the primary-only producers and `drop_cluster_node`, even
    /// though `primary_node_id` now names another node. Demotion is left to
    /// whoever drives the handover.
    pub fn set_primary_node(&self, node_id: &str) -> bool {
        if self.membership.set_primary(node_id) {
            tracing::info!("Primary node is now {}", node_id);
            self.notify_primary_changed(node_id);
            true
        } else {
            false
        }
    }

    pub fn node_id(&self) -> String {
        self.membership.node_id()
    }

    pub fn role(&self) -> NodeRole {
        self.membership.role()
    }

    pub fn is_primary(&self) -> bool {
        self.membership.is_primary()
    }

    pub fn primary_node_id(&self) -> String {
        self.membership.primary_node_id()
    }

    pub fn active_nodes(&self) -> Vec<String> {
        self.membership.active_nodes()
    }

    pub fn all_nodes(&self) -> Vec<String> {
        self.membership.all_nodes()
    }

    pub fn summary(&self) -> ClusterSummary {
        self.membership.summary()
    }

    pub fn operation_mode(&self) -> Option<OperationMode> {
        self.session().ok().map(|s| s.controller.mode())
    }

    /// Time imported by the last `sync_time_data` of this frame
    pub fn current_time_data(&self) -> Option<TimeData> {
        *self.current_time.lock()
    }

    pub fn hosting_info(&self) -> ClusterHostingInfo {
        self.hosting_info.read().clone()
    }

    pub fn failover_stats(&self) -> Option<FailoverStats> {
        self.session().ok().map(|s| s.failover.stats())
    }

    pub fn is_failure_processed(&self, node_id: &str) -> bool {
        self.session()
            .map(|s| s.failover.is_failure_processed(node_id))
            .unwrap_or(false)
    }

    pub fn barrier_counter(&self, barrier_id: &str) -> u64 {
        self.session()
            .map(|s| s.cache.barrier_counter(barrier_id, &s.node_id))
            .unwrap_or(0)
    }

    /// Bound address of a service this node hosts
    pub fn local_service_address(&self, service: ServiceKind) -> Option<String> {
        self.session().ok()?.controller.service_address(service)
    }

    // ========== Registration ==========

    pub fn register_sync_object(&self, group: SyncGroup, object: &Arc<dyn SyncObject>) {
        self.objects.register(group, object);
    }

    pub fn unregister_sync_object(&self, sync_id: &str) -> bool {
        self.objects.unregister(sync_id)
    }

    pub fn add_event_listener(&self, listener: Arc<dyn ClusterEventListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn ClusterEventListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn add_observer(&self, observer: Arc<dyn ClusterObserver>) {
        self.observers.write().push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ClusterObserver>) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    pub fn set_termination_handler(&self, handler: Arc<dyn TerminationHandler>) {
        *self.termination.write() = handler;
    }

    fn notify_node_failed(&self, node_id: &str) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_node_failed(node_id);
        }
    }

    fn notify_primary_changed(&self, primary_node_id: &str) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_primary_changed(primary_node_id);
        }
    }
}

impl FailureSink for ClusterCoordinator {
    fn on_node_failure(&self, node_id: &str) -> Result<()> {
        let session = self.session()?;
        self.drop_failed_node(&session, node_id, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LocalNetwork;
    use crate::sync::object::tests::ValueObject;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        reasons: Mutex<Vec<String>>,
    }

    impl TerminationHandler for Recorder {
        fn terminate(&self, reason: &str) {
            self.reasons.lock().push(reason.to_string());
        }
    }

    #[derive(Default)]
    struct CountingListener {
        json: AtomicUsize,
    }

    impl ClusterEventListener for CountingListener {
        fn on_cluster_event_json(&self, _event: &ClusterEventJson) {
            self.json.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn single_node(mode: OperationMode) -> Arc<ClusterCoordinator> {
        let network = LocalNetwork::new();
        let coordinator = ClusterCoordinator::new(Arc::new(network.transport("127.0.0.1")));
        let mut config = ClusterConfig::sample();
        config.operation_mode = mode;
        coordinator.start_session(config, "node-a").unwrap();
        coordinator
    }

    #[test]
    fn test_start_session_rejects_bad_node_ids() {
        let coordinator = ClusterCoordinator::new(Arc::new(LocalNetwork::new().transport("127.0.0.1")));

        assert!(matches!(
            coordinator.start_session(ClusterConfig::sample(), ""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            coordinator.start_session(ClusterConfig::sample(), "node-z"),
            Err(Error::UnknownNode(_))
        ));
        assert!(!coordinator.has_session());
    }

    #[test]
    fn test_initial_role() {
        let coordinator = single_node(OperationMode::Disabled);
        assert_eq!(coordinator.role(), NodeRole::Primary);
        assert_eq!(coordinator.active_nodes().len(), 3);

        coordinator.end_session();
        assert_eq!(coordinator.role(), NodeRole::None);
        assert!(coordinator.active_nodes().is_empty());
    }

    #[test]
    fn test_disabled_mode_frame_runs_locally() {
        let coordinator = single_node(OperationMode::Disabled);
        let object = ValueObject::new("camera", "0,0,0");
        let handle: Arc<dyn SyncObject> = object.clone();
        coordinator.register_sync_object(SyncGroup::Tick, &handle);

        coordinator.start_frame(1).unwrap();
        coordinator.cache_time_data(TimeData::new(0.016, 10.0)).unwrap();
        assert_eq!(coordinator.sync_time_data().unwrap(), TimeData::new(0.016, 10.0));

        object.set("1,2,3");
        coordinator.pre_tick(0.016).unwrap();
        coordinator.tick(0.016).unwrap();
        coordinator.post_tick(0.016).unwrap();

        let published = coordinator.export_objects_data(SyncGroup::Tick).unwrap();
        assert_eq!(published.get("camera").map(String::as_str), Some("1,2,3"));
        assert!(!object.is_dirty());

        coordinator.end_frame(1).unwrap();
        assert_eq!(coordinator.barrier_counter(FRAME_END_BARRIER), 0);
    }

    #[test]
    fn test_primary_imports_published_objects() {
        let coordinator = single_node(OperationMode::Disabled);
        let object = ValueObject::new("camera", "0,0,0");
        let handle: Arc<dyn SyncObject> = object.clone();
        coordinator.register_sync_object(SyncGroup::Tick, &handle);

        coordinator.start_frame(1).unwrap();
        object.set("1,2,3");
        coordinator.cache_objects(SyncGroup::Tick).unwrap();

        // Changes after publishing are overwritten by the import
        object.set("9,9,9");
        coordinator.tick(0.016).unwrap();

        let published = coordinator.export_objects_data(SyncGroup::Tick).unwrap();
        assert_eq!(published.get("camera").map(String::as_str), Some("1,2,3"));
        assert_eq!(object.get(), "1,2,3");
    }

    #[test]
    fn test_events_reach_listeners_once() {
        let coordinator = single_node(OperationMode::Disabled);
        let listener = Arc::new(CountingListener::default());
        coordinator.add_event_listener(listener.clone());

        let event = ClusterEventJson::new("Sys", "Warn", "Low").discard_on_repeat(true);
        coordinator.emit_cluster_event_json(event.clone(), false).unwrap();
        coordinator.emit_cluster_event_json(event.clone(), false).unwrap();
        coordinator
            .emit_cluster_event_json(event.discard_on_repeat(false), false)
            .unwrap();

        coordinator.start_frame(1).unwrap();
        let events = coordinator.sync_events().unwrap();
        assert_eq!(events.json.len(), 2);
        assert_eq!(listener.json.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_secondary_cannot_produce_or_drop() {
        let network = LocalNetwork::new();
        let coordinator = ClusterCoordinator::new(Arc::new(network.transport("127.0.0.2")));
        let mut config = ClusterConfig::sample();
        config.operation_mode = OperationMode::Disabled;
        coordinator.start_session(config, "node-b").unwrap();

        assert_eq!(coordinator.role(), NodeRole::Secondary);
        assert!(coordinator.cache_events().is_err());
        assert!(matches!(
            coordinator.drop_cluster_node("node-c"),
            Err(Error::NotAllowed(_))
        ));
        assert_eq!(coordinator.active_nodes().len(), 3);
    }

    #[test]
    fn test_set_primary_node() {
        let coordinator = single_node(OperationMode::Disabled);
        assert!(!coordinator.set_primary_node("node-a"));
        assert!(!coordinator.set_primary_node("node-z"));
        assert!(coordinator.set_primary_node("node-b"));
        assert_eq!(coordinator.primary_node_id(), "node-b");

        // No demotion: the old primary keeps its role
        assert_eq!(coordinator.role(), NodeRole::Primary);
        assert!(coordinator.is_primary());
    }

    #[test]
    fn test_self_drop_terminates() {
        let coordinator = single_node(OperationMode::Disabled);
        let recorder = Arc::new(Recorder::default());
        coordinator.set_termination_handler(recorder.clone());

        assert!(coordinator.drop_node("node-a", DropReason::Failed).is_err());
        assert_eq!(recorder.reasons.lock().len(), 1);
    }

    #[test]
    fn test_end_session_releases_blocked_exports() {
        let coordinator = single_node(OperationMode::Disabled);
        let reader = {
            let coordinator = Arc::clone(&coordinator);
            std::thread::spawn(move || coordinator.export_events_data())
        };

        std::thread::sleep(Duration::from_millis(30));
        coordinator.end_session();
        assert_eq!(reader.join().unwrap(), None);
    }
}

//! Common test utilities for wolfsync cluster tests.
//!
//! Every node of a test cluster lives in this process and talks over one
//! `LocalNetwork`, with the configured request timeout. Node `i` is `node-<letter>` on host `127.0.0.<i+1>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use wolfsync::cluster::{ClusterCoordinator, ClusterObserver, TerminationHandler};
use wolfsync::config::{ClusterConfig, FailoverPolicy, NodeConfig};
use wolfsync::network::LocalNetwork;
use wolfsync::state::OperationMode;
use wolfsync::sync::{ClusterEventJson, ClusterEventListener, SyncGroup, SyncObject, TimeData};

/// Sync id of the object every test node registers
pub const OBJECT_ID: &str = "stage.light";

/// Records termination requests instead of exiting the test process
#[derive(Default)]
pub struct RecordingTermination {
    pub reasons: Mutex<Vec<String>>,
}

impl TerminationHandler for RecordingTermination {
    fn terminate(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub json: Mutex<Vec<ClusterEventJson>>,
}

impl ClusterEventListener for RecordingListener {
    fn on_cluster_event_json(&self, event: &ClusterEventJson) {
        self.json.lock().unwrap().push(event.clone());
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub failed: Mutex<Vec<String>>,
    pub primaries: Mutex<Vec<String>>,
}

impl ClusterObserver for RecordingObserver {
    fn on_node_failed(&self, node_id: &str) {
        self.failed.lock().unwrap().push(node_id.to_string());
    }

    fn on_primary_changed(&self, primary_node_id: &str) {
        self.primaries.lock().unwrap().push(primary_node_id.to_string());
    }
}

/// String-valued sync object
pub struct TestObject {
    value: Mutex<String>,
    dirty: AtomicBool,
}

impl TestObject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(String::new()),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn set(&self, value: &str) {
        *self.value.lock().unwrap() = value.to_string();
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn get(&self) -> String {
        self.value.lock().unwrap().clone()
    }
}

impl SyncObject for TestObject {
    fn sync_id(&self) -> String {
        OBJECT_ID.to_string()
    }

    fn is_active(&self) -> bool {
        true
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn serialize_to_string(&self) -> String {
        self.get()
    }

    fn deserialize_from_string(&self, data: &str) -> bool {
        *self.value.lock().unwrap() = data.to_string();
        true
    }

    fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }
}

/// Where in a frame `TestCluster::crash_during_frame` kills its node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    AfterStartFrame,
    AfterSyncTime,
    AfterPreTick,
    AfterEndFrame,
}

pub struct TestNode {
    pub index: usize,
    pub id: String,
    pub host: String,
    pub coordinator: Arc<ClusterCoordinator>,
    pub terminations: Arc<RecordingTermination>,
    pub listener: Arc<RecordingListener>,
    pub observer: Arc<RecordingObserver>,
    pub object: Arc<TestObject>,
    /// Time imported each frame
    pub times: Mutex<Vec<TimeData>>,
}

impl TestNode {
    /// Time this node hands to the coordinator; only the primary's is
    /// published
    fn local_time(&self, frame: u64) -> TimeData {
        let offset = self.index as f64 * 1000.0;
        TimeData::new(0.016, frame as f64 * 0.016 + offset)
    }

    fn run_frame(&self, frame: u64) -> wolfsync::Result<()> {
        self.run_frame_until(frame, None)
    }

    /// Run `frame`, stopping right after `stop` when given
    fn run_frame_until(&self, frame: u64, stop: Option<CrashPoint>) -> wolfsync::Result<()> {
        let coordinator = &self.coordinator;

        coordinator.start_frame(frame)?;
        if stop == Some(CrashPoint::AfterStartFrame) {
            return Ok(());
        }

        coordinator.cache_time_data(self.local_time(frame))?;
        let time = coordinator.sync_time_data()?;
        self.times.lock().unwrap().push(time);
        if stop == Some(CrashPoint::AfterSyncTime) {
            return Ok(());
        }

        if coordinator.is_primary() {
            self.object.set(&format!("frame-{}", frame));
        }

        coordinator.pre_tick(time.delta_seconds)?;
        if stop == Some(CrashPoint::AfterPreTick) {
            return Ok(());
        }

        coordinator.tick(time.delta_seconds)?;
        coordinator.post_tick(time.delta_seconds)?;
        coordinator.end_frame(frame)?;
        if stop == Some(CrashPoint::AfterEndFrame) {
            return Ok(());
        }

        coordinator.synchronize_on_render_barrier()
    }

    pub fn terminated(&self) -> bool {
        !self.terminations.reasons.lock().unwrap().is_empty()
    }
}

/// Test configuration with short timeouts
pub fn test_config(node_count: usize, mode: OperationMode, policy: FailoverPolicy) -> ClusterConfig {
    let mut config = ClusterConfig::sample();
    config.operation_mode = mode;
    config.nodes = (0..node_count)
        .map(|i| NodeConfig {
            id: node_id(i),
            host: format!("127.0.0.{}", i + 1),
        })
        .collect();
    config.primary_node_id = node_id(0);

    config.network.connect_retries = 50;
    config.network.connect_retry_delay_ms = 20;
    config.network.bind_retries = 3;
    config.network.bind_retry_delay_ms = 10;
    config.network.connect_timeout_ms = 200;
    config.network.request_timeout_ms = 8000;
    config.network.game_start_barrier_timeout_ms = 5000;
    config.network.frame_start_barrier_timeout_ms = 1500;
    config.network.frame_end_barrier_timeout_ms = 1500;
    config.network.render_sync_barrier_timeout_ms = 1500;
    config.network.generic_barrier_timeout_ms = 1500;

    config.failover.policy = policy;
    config.failover.negotiation_timeout_ms = 3000;
    config.failover.transaction_retries = 3;
    config
}

pub fn node_id(index: usize) -> String {
    format!("node-{}", (b'a' + index as u8) as char)
}

pub struct TestCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestCluster {
    /// Start a session on every node of `config`, all nodes in parallel
    pub fn start(config: ClusterConfig) -> Self {
        let network = LocalNetwork::new();

        let nodes: Vec<TestNode> = config
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let transport = network.transport_with_timeout(
                    &node.host,
                    Duration::from_millis(config.network.request_timeout_ms),
                );
                let coordinator = ClusterCoordinator::new(Arc::new(transport));
                let terminations = Arc::new(RecordingTermination::default());
                coordinator.set_termination_handler(terminations.clone());

                TestNode {
                    index,
                    id: node.id.clone(),
                    host: node.host.clone(),
                    coordinator,
                    terminations,
                    listener: Arc::new(RecordingListener::default()),
                    observer: Arc::new(RecordingObserver::default()),
                    object: TestObject::new(),
                    times: Mutex::new(Vec::new()),
                }
            })
            .collect();

        thread::scope(|scope| {
            let handles: Vec<_> = nodes
                .iter()
                .map(|node| {
                    let config = config.clone();
                    scope.spawn(move || node.coordinator.start_session(config, &node.id))
                })
                .collect();

            for (node, handle) in nodes.iter().zip(handles) {
                handle
                    .join()
                    .expect("start thread panicked")
                    .unwrap_or_else(|e| panic!("{} failed to start: {}", node.id, e));
            }
        });

        for node in &nodes {
            node.coordinator.add_event_listener(node.listener.clone());
            node.coordinator.add_observer(node.observer.clone());
            let object: Arc<dyn SyncObject> = node.object.clone();
            node.coordinator.register_sync_object(SyncGroup::Tick, &object);
        }

        Self { network, nodes }
    }

    pub fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("no test node {}", id))
    }

    /// Run the game start barrier on the given nodes in parallel
    pub fn game_start(&self, ids: &[&str]) -> Vec<wolfsync::Result<()>> {
        self.on_nodes(ids, |node| node.coordinator.wait_for_game_start())
    }

    /// Run `frames` on the given nodes in parallel; the first error stops a
    /// node's loop
    pub fn run_frames(
        &self,
        ids: &[&str],
        frames: std::ops::RangeInclusive<u64>,
    ) -> Vec<wolfsync::Result<()>> {
        self.on_nodes(ids, |node| {
            for frame in frames.clone() {
                node.run_frame(frame)?;
            }
            Ok(())
        })
    }

    fn on_nodes<F>(&self, ids: &[&str], op: F) -> Vec<wolfsync::Result<()>>
    where
        F: Fn(&TestNode) -> wolfsync::Result<()> + Sync,
    {
        let op = &op;
        thread::scope(|scope| {
            let handles: Vec<_> = ids
                .iter()
                .map(|id| {
                    let node = self.node(id);
                    scope.spawn(move || op(node))
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().expect("node thread panicked"))
                .collect()
        })
    }

    /// Run `frames` on `survivors` while `victim` runs the first of them up
    /// to `point` and then crashes
    pub fn crash_during_frame(
        &self,
        victim: &str,
        point: CrashPoint,
        survivors: &[&str],
        frames: std::ops::RangeInclusive<u64>,
    ) -> Vec<wolfsync::Result<()>> {
        let first = *frames.start();
        thread::scope(|scope| {
            let node = self.node(victim);
            scope.spawn(move || {
                if let Err(e) = node.run_frame_until(first, Some(point)) {
                    panic!("{} failed before crashing: {}", node.id, e);
                }
                self.crash(victim);
            });

            self.run_frames(survivors, frames)
        })
    }

    /// Kill a node: nothing reaches it any more and its servers are gone
    pub fn crash(&self, id: &str) {
        let node = self.node(id);
        self.network.sever_host(&node.host);
        node.coordinator.end_session();
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.coordinator.end_session();
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn assert_all_ok(results: &[wolfsync::Result<()>]) {
    for (i, result) in results.iter().enumerate() {
        if let Err(e) = result {
            panic!("node #{} failed: {}", i, e);
        }
    }
}

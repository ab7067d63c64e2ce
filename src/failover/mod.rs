//! Failover Controller
//!
//! Wraps every outgoing protocol call in a transaction. Transactions share
//! the recovery lock; recovery takes it exclusively, so no transaction of
//! any kind runs while the cluster is being put back together.

mod transaction;

pub use transaction::{FailoverStats, TransactionKind};

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::cache::{CacheKey, CachedData, ClusterSyncState, FrameDataCache};
use crate::config::{ClusterConfig, FailoverPolicy};
use crate::controller::NodeController;
use crate::error::{Error, Result};
use crate::protocol::{Request, Response};
use crate::state::{elect_primary, ClusterMembership};
use transaction::TransactionStats;

/// Receives nodes found dead by a transaction
pub trait FailureSink: Send + Sync {
    /// Run the node failure pipeline. An error means the cluster could not
    /// recover.
    fn on_node_failure(&self, node_id: &str) -> Result<()>;
}

/// What a handled failure changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    /// False when another caller already processed this failure
    pub handled: bool,
    pub new_primary: Option<String>,
    /// Primary candidates that were found dead during the election
    pub also_failed: Vec<String>,
}

pub struct FailoverController {
    node_id: String,
    policy: FailoverPolicy,
    transaction_retries: u32,
    membership: Arc<ClusterMembership>,
    controller: Arc<NodeController>,
    local_cache: Arc<FrameDataCache>,
    /// Merged state of all survivors, filled by recovery only
    cluster_cache: FrameDataCache,
    /// Shared by transactions, exclusive for recovery
    recovery_lock: RwLock<()>,
    failed_nodes_processed: Mutex<HashSet<String>>,
    stats: TransactionStats,
    sink: Weak<dyn FailureSink>,
}

impl FailoverController {
    pub fn new(
        node_id: &str,
        config: &ClusterConfig,
        membership: Arc<ClusterMembership>,
        controller: Arc<NodeController>,
        local_cache: Arc<FrameDataCache>,
        sink: Weak<dyn FailureSink>,
    ) -> Self {
        let policy = config.effective_failover_policy();
        tracing::info!("Failover policy for node {}: {:?}", node_id, policy);

        Self {
            node_id: node_id.to_string(),
            policy,
            transaction_retries: config.failover.transaction_retries,
            membership,
            controller,
            local_cache,
            cluster_cache: FrameDataCache::new(),
            recovery_lock: RwLock::new(()),
            failed_nodes_processed: Mutex::new(HashSet::new()),
            stats: TransactionStats::default(),
            sink,
        }
    }

    pub fn policy(&self) -> FailoverPolicy {
        self.policy
    }

    pub fn cluster_cache(&self) -> &FrameDataCache {
        &self.cluster_cache
    }

    pub fn stats(&self) -> FailoverStats {
        self.stats.snapshot()
    }

    pub fn transaction_count(&self, name: &str) -> u64 {
        self.stats.count(name)
    }

    pub fn is_failure_processed(&self, node_id: &str) -> bool {
        self.failed_nodes_processed.lock().contains(node_id)
    }

    /// Run `attempt` under the shared side of the recovery lock, handing
    /// node failures to the sink and retrying against the new topology.
    fn run<T>(
        &self,
        kind: TransactionKind,
        name: &str,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let sequence = self.stats.record(kind, name);
        let mut failures = 0;

        loop {
            let result = {
                let _guard = self.recovery_lock.read();
                attempt()
            };

            let failed = match &result {
                Err(e) => e.failed_node().map(str::to_string),
                Ok(_) => None,
            };
            let Some(failed) = failed else {
                return result;
            };

            failures += 1;
            tracing::warn!(
                "{} transaction {}#{} lost node {} (attempt {}/{})",
                kind,
                name,
                sequence,
                failed,
                failures,
                self.transaction_retries + 1
            );

            // The guard is released here; failure handling needs the lock
            // exclusively.
            self.report_failure(&failed)?;

            if failures > self.transaction_retries {
                return result;
            }
        }
    }

    fn report_failure(&self, node_id: &str) -> Result<()> {
        match self.sink.upgrade() {
            Some(sink) => sink.on_node_failure(node_id),
            None => Err(Error::ShuttingDown),
        }
    }

    /// GET: serve from the local cache, then from recovered cluster state,
    /// then from the primary. The primary itself runs `produce` to fill its
    /// slot instead of calling itself.
    pub fn get(&self, key: CacheKey, produce: &dyn Fn()) -> Result<CachedData> {
        let name = key.to_string();

        self.run(TransactionKind::Get, &name, || {
            if self.local_cache.is_cached(key) {
                if let Some(data) = self.local_cache.load(key) {
                    return Ok(data);
                }
            }

            if self.cluster_cache.is_cached(key) {
                if let Some(data) = self.cluster_cache.load(key) {
                    tracing::debug!("{} served from recovered cluster state", name);
                    self.local_cache.save(data.clone());
                    return Ok(data);
                }
            }

            if self.membership.is_primary() {
                produce();
                return self
                    .local_cache
                    .load(key)
                    .ok_or_else(|| Error::Internal(format!("{} produced no data", name)));
            }

            let response = self.controller.call_primary(request_for(key))?;
            let data = cached_from_response(key, response)?;
            self.local_cache.save(data.clone());
            Ok(data)
        })
    }

    /// PUSH: one call to the primary, no caching
    pub fn push(&self, name: &str, request: Request) -> Result<Response> {
        self.run(TransactionKind::Push, name, || {
            self.controller.call_primary(request.clone())
        })
    }

    /// SYNC: one barrier round on the primary, counted on success.
    ///
    /// A round the cluster already completed before a recovery is counted
    /// without calling again.
    pub fn sync(&self, barrier_id: &str, caller_id: &str, request: Request) -> Result<Response> {
        self.run(TransactionKind::Sync, barrier_id, || {
            let completed = self.cluster_cache.max_barrier_counter(barrier_id);
            let mine = self.local_cache.barrier_counter(barrier_id, caller_id);
            if completed > mine {
                let counter = self.local_cache.increment_barrier_counter(barrier_id, caller_id);
                tracing::info!(
                    "Barrier {} round {} for {} completed before recovery, skipping",
                    barrier_id,
                    counter,
                    caller_id
                );
                return Ok(Response::Ok);
            }

            let response = self.controller.call_primary(request.clone())?;
            self.local_cache.increment_barrier_counter(barrier_id, caller_id);
            Ok(response)
        })
    }

    /// MCAST: call every target independently. Failed targets are reported
    /// after all calls were made.
    pub fn mcast(
        &self,
        name: &str,
        request: Request,
        targets: &[String],
    ) -> Vec<(String, Result<Response>)> {
        self.stats.record(TransactionKind::Mcast, name);

        let results: Vec<(String, Result<Response>)> = targets
            .iter()
            .map(|target| {
                let _guard = self.recovery_lock.read();
                (target.clone(), self.controller.call(target, request.clone()))
            })
            .collect();

        for (target, result) in &results {
            if let Err(e) = result {
                match e.failed_node() {
                    Some(failed) => {
                        if let Err(e) = self.report_failure(failed) {
                            tracing::error!("{} to {}: failure handling failed: {}", name, target, e);
                        }
                    }
                    None => tracing::warn!("{} to {} failed: {}", name, target, e),
                }
            }
        }

        results
    }

    /// Handle a failed node under the exclusive recovery lock.
    ///
    /// The node must already be out of the active set. Each node is
    /// processed at most once.
    pub fn handle_failure(&self, failed_node_id: &str) -> Result<FailureOutcome> {
        let _guard = self.recovery_lock.write();

        if !self
            .failed_nodes_processed
            .lock()
            .insert(failed_node_id.to_string())
        {
            tracing::debug!("Failure of {} already processed", failed_node_id);
            return Ok(FailureOutcome::default());
        }

        self.stats
            .failures_handled
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let was_primary = self.membership.primary_node_id() == failed_node_id;

        tracing::warn!(
            "Handling failure of {} node {} (policy {:?})",
            if was_primary { "primary" } else { "secondary" },
            failed_node_id,
            self.policy
        );

        match (self.policy, was_primary) {
            (FailoverPolicy::Disabled, _) => Err(Error::Unrecoverable(format!(
                "node {} failed and failover is disabled",
                failed_node_id
            ))),
            (FailoverPolicy::DropSecondaries, true) => Err(Error::Unrecoverable(format!(
                "primary {} failed and policy only tolerates secondary failures",
                failed_node_id
            ))),
            (_, false) => {
                tracing::info!(
                    "Secondary {} dropped, {} node(s) remain",
                    failed_node_id,
                    self.membership.active_count()
                );
                Ok(FailureOutcome {
                    handled: true,
                    ..FailureOutcome::default()
                })
            }
            (FailoverPolicy::Failover, true) => self.recover_primary(),
        }
    }

    /// Elect a primary among the survivors and negotiate the resume point.
    /// Runs with the recovery lock held exclusively.
    fn recover_primary(&self) -> Result<FailureOutcome> {
        let mut outcome = FailureOutcome {
            handled: true,
            ..FailureOutcome::default()
        };

        loop {
            let active = self.membership.active_nodes();
            let candidate = elect_primary(&active).ok_or_else(|| {
                Error::Unrecoverable("no eligible primary among surviving nodes".to_string())
            })?;

            self.membership.set_primary(&candidate);
            self.stats
                .elections
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tracing::info!(
                "Elected {} as primary from {:?} (this node is {})",
                candidate,
                active,
                self.membership.role()
            );

            match self.negotiate(&candidate) {
                Ok(()) => {
                    outcome.new_primary = Some(candidate);
                    return Ok(outcome);
                }
                Err(e) if e.failed_node() == Some(candidate.as_str()) && candidate != self.node_id => {
                    tracing::warn!("Primary candidate {} is unreachable: {}", candidate, e);
                    self.membership.deactivate(&candidate);
                    self.controller.drop_node_resources(&candidate);
                    self.failed_nodes_processed.lock().insert(candidate.clone());
                    outcome.also_failed.push(candidate);
                }
                Err(e) => {
                    return Err(Error::Unrecoverable(format!(
                        "recovery negotiation with {} failed: {}",
                        candidate, e
                    )))
                }
            }
        }
    }

    /// RECOVERY: exchange sync state through the new primary
    fn negotiate(&self, primary: &str) -> Result<()> {
        self.stats
            .record(TransactionKind::Recovery, crate::barrier::NEGOTIATION_BARRIER);

        let state = self.local_cache.generate_node_sync_state(&self.node_id);
        let response = self.controller.call(
            primary,
            Request::PostFailureNegotiate {
                node_id: self.node_id.clone(),
                data: state.to_bytes()?,
            },
        )?;

        let bytes = match response {
            Response::Bytes(bytes) => bytes,
            other => {
                return Err(Error::Internal(format!(
                    "unexpected {} response to negotiation",
                    other.type_name()
                )))
            }
        };

        let merged = ClusterSyncState::from_bytes(&bytes)?;
        self.cluster_cache.update_cluster_sync_state(&merged);
        self.stats
            .recoveries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        tracing::info!(
            "Recovery negotiated with {}: {} barrier(s), {} cached slot(s)",
            primary,
            merged.counters.len(),
            merged.cached.len()
        );
        Ok(())
    }

    /// Frame boundary resets for recovered state
    pub fn reset_time(&self) {
        self.cluster_cache.reset_time();
    }

    pub fn reset_frame(&self) {
        self.cluster_cache.reset_frame();
    }

    pub fn release(&self) {
        self.cluster_cache.release_all();
    }
}

fn request_for(key: CacheKey) -> Request {
    match key {
        CacheKey::Time => Request::GetTimeData,
        CacheKey::Objects(group) => Request::GetObjectsData { group },
        CacheKey::Events => Request::GetEventsData,
        CacheKey::NativeInput => Request::GetNativeInputData,
    }
}

fn cached_from_response(key: CacheKey, response: Response) -> Result<CachedData> {
    match (key, response) {
        (CacheKey::Time, Response::Time(time)) => Ok(CachedData::Time(time)),
        (CacheKey::Objects(group), Response::Objects(objects)) => {
            Ok(CachedData::Objects(group, objects))
        }
        (CacheKey::Events, Response::Events(events)) => Ok(CachedData::Events(events)),
        (CacheKey::NativeInput, Response::NativeInput(input)) => Ok(CachedData::NativeInput(input)),
        (key, other) => Err(Error::Internal(format!(
            "unexpected {} response to {}",
            other.type_name(),
            key
        ))),
    }
}

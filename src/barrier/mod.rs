//! Barrier Module
//!
//! Rendezvous points hosted by every node's servers. Only the primary's
//! barriers are used at any given time; secondaries keep theirs so they
//! can take over after an election.

mod registry;

pub use registry::BarrierRegistry;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Nodes meet here once after session start
pub const GAME_START_BARRIER: &str = "GameStart";
pub const FRAME_START_BARRIER: &str = "FrameStart";
pub const FRAME_END_BARRIER: &str = "FrameEnd";
/// Render thread lockstep
pub const RENDER_SYNC_BARRIER: &str = "RenderSync";
pub const HOSTING_INFO_BARRIER: &str = "ServicesHostingInfo";
pub const NEGOTIATION_BARRIER: &str = "PostFailureNegotiate";

/// caller id -> data a caller brought to the round
pub type BarrierData = BTreeMap<String, Vec<u8>>;

/// Result of one barrier round as seen by one caller
#[derive(Debug, Clone)]
pub struct BarrierOutcome {
    /// Every caller's request data for the round
    pub response: Arc<BarrierData>,
    /// Nodes whose callers never arrived; only reported to the caller that
    /// detected the timeout
    pub timed_out: Vec<String>,
}

struct BarrierState {
    /// caller id -> owning node id
    participants: BTreeMap<String, String>,
    arrived: BarrierData,
    generation: u64,
    round_started: Option<Instant>,
    last_response: Arc<BarrierData>,
    active: bool,
}

impl BarrierState {
    fn round_complete(&self) -> bool {
        !self.arrived.is_empty()
            && self
                .participants
                .keys()
                .all(|caller| self.arrived.contains_key(caller))
    }

    fn complete_round(&mut self) {
        self.last_response = Arc::new(std::mem::take(&mut self.arrived));
        self.generation += 1;
        self.round_started = None;
    }
}

/// A reusable barrier with per-round timeout
pub struct ClusterBarrier {
    id: String,
    timeout: Duration,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl ClusterBarrier {
    /// Barrier with explicit node -> callers participants
    pub fn new(id: &str, participants: &BTreeMap<String, BTreeSet<String>>, timeout: Duration) -> Self {
        let participants = participants
            .iter()
            .flat_map(|(node_id, callers)| {
                callers
                    .iter()
                    .map(move |caller| (caller.clone(), node_id.clone()))
            })
            .collect();

        Self {
            id: id.to_string(),
            timeout,
            state: Mutex::new(BarrierState {
                participants,
                arrived: BarrierData::new(),
                generation: 0,
                round_started: None,
                last_response: Arc::new(BarrierData::new()),
                active: true,
            }),
            released: Condvar::new(),
        }
    }

    /// Barrier where every node is its own single caller
    pub fn for_nodes(id: &str, nodes: &[String], timeout: Duration) -> Self {
        let participants = nodes
            .iter()
            .map(|node| (node.clone(), BTreeSet::from([node.clone()])))
            .collect();
        Self::new(id, &participants, timeout)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn participants(&self) -> Vec<String> {
        self.state.lock().participants.keys().cloned().collect()
    }

    /// Arrive at the barrier and block until the round is released
    pub fn wait(&self, caller_id: &str, data: Vec<u8>) -> Result<BarrierOutcome> {
        let mut state = self.state.lock();

        if !state.active {
            return Err(Error::Barrier(format!("barrier '{}' is not active", self.id)));
        }
        if !state.participants.contains_key(caller_id) {
            return Err(Error::Barrier(format!(
                "'{}' is not a participant of barrier '{}'",
                caller_id, self.id
            )));
        }
        if state.arrived.contains_key(caller_id) {
            return Err(Error::Barrier(format!(
                "'{}' already waits on barrier '{}'",
                caller_id, self.id
            )));
        }

        state.arrived.insert(caller_id.to_string(), data);
        let started = *state.round_started.get_or_insert_with(Instant::now);
        let generation = state.generation;

        if state.round_complete() {
            state.complete_round();
            self.released.notify_all();
            return Ok(BarrierOutcome {
                response: Arc::clone(&state.last_response),
                timed_out: Vec::new(),
            });
        }

        let deadline = started + self.timeout;
        loop {
            let timed_out = self.released.wait_until(&mut state, deadline).timed_out();

            if state.generation != generation {
                return Ok(BarrierOutcome {
                    response: Arc::clone(&state.last_response),
                    timed_out: Vec::new(),
                });
            }
            if !state.active {
                return Err(Error::Barrier(format!("barrier '{}' was released", self.id)));
            }
            if timed_out {
                let missing: Vec<String> = state
                    .participants
                    .keys()
                    .filter(|caller| !state.arrived.contains_key(*caller))
                    .cloned()
                    .collect();

                let mut missing_nodes = BTreeSet::new();
                for caller in &missing {
                    if let Some(node_id) = state.participants.remove(caller) {
                        missing_nodes.insert(node_id);
                    }
                }

                tracing::warn!(
                    "Barrier '{}' timed out after {:?}, missing callers: {:?}",
                    self.id,
                    self.timeout,
                    missing
                );

                state.complete_round();
                self.released.notify_all();
                return Ok(BarrierOutcome {
                    response: Arc::clone(&state.last_response),
                    timed_out: missing_nodes.into_iter().collect(),
                });
            }
        }
    }

    /// Remove every caller owned by a node, releasing the round if the rest
    /// already arrived
    pub fn remove_node(&self, node_id: &str) {
        let mut state = self.state.lock();
        let callers: Vec<String> = state
            .participants
            .iter()
            .filter(|(_, owner)| owner.as_str() == node_id)
            .map(|(caller, _)| caller.clone())
            .collect();

        if callers.is_empty() {
            return;
        }

        for caller in &callers {
            state.participants.remove(caller);
            state.arrived.remove(caller);
        }

        tracing::debug!("Barrier '{}' dropped callers {:?} of node {}", self.id, callers, node_id);

        if state.round_complete() {
            state.complete_round();
            self.released.notify_all();
        }
    }

    /// Wake every waiter with an error and refuse new arrivals
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        state.active = false;
        self.released.notify_all();
    }
}

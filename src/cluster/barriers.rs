//! Application-defined barriers.
//!
//! Creation and release go to every active node so any of them can host
//! the barrier after a failover; waits are served by the primary.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::ClusterCoordinator;
use crate::barrier::BarrierData;
use crate::error::{Error, Result};
use crate::protocol::{Request, Response};

impl ClusterCoordinator {
    /// Create a barrier on every active node. Returns the primary's answer:
    /// false if the barrier already existed there. Without a timeout the
    /// configured generic barrier timeout applies.
    pub fn create_barrier(
        &self,
        barrier_id: &str,
        participants: &BTreeMap<String, BTreeSet<String>>,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let timeout = timeout.unwrap_or_else(|| self.generic_barrier_timeout());
        let request = Request::CreateBarrier {
            barrier_id: barrier_id.to_string(),
            participants: participants.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        self.broadcast_barrier_call("CreateBarrier", request)
    }

    /// Block until the primary has the barrier, bounded by the request
    /// timeout
    pub fn wait_until_barrier_is_created(&self, barrier_id: &str) -> Result<bool> {
        let session = self.session()?;
        let response = session.failover.push(
            "WaitUntilBarrierIsCreated",
            Request::WaitUntilBarrierIsCreated {
                barrier_id: barrier_id.to_string(),
            },
        )?;
        expect_bool("WaitUntilBarrierIsCreated", response)
    }

    pub fn is_barrier_available(&self, barrier_id: &str) -> Result<bool> {
        let session = self.session()?;
        let response = session.failover.push(
            "IsBarrierAvailable",
            Request::IsBarrierAvailable {
                barrier_id: barrier_id.to_string(),
            },
        )?;
        expect_bool("IsBarrierAvailable", response)
    }

    /// Release a barrier everywhere. Waiters get an error.
    pub fn release_barrier(&self, barrier_id: &str) -> Result<bool> {
        let request = Request::ReleaseBarrier {
            barrier_id: barrier_id.to_string(),
        };
        self.broadcast_barrier_call("ReleaseBarrier", request)
    }

    pub fn sync_on_barrier(&self, barrier_id: &str, caller_id: &str) -> Result<()> {
        let session = self.session()?;
        session
            .failover
            .sync(
                barrier_id,
                caller_id,
                Request::SyncOnBarrier {
                    barrier_id: barrier_id.to_string(),
                    caller_id: caller_id.to_string(),
                },
            )
            .map(|_| ())
    }

    /// Arrive with a payload. Returns every caller's payload keyed by
    /// caller id; empty when the round was completed before a recovery.
    pub fn sync_on_barrier_with_data(
        &self,
        barrier_id: &str,
        caller_id: &str,
        data: Vec<u8>,
    ) -> Result<BarrierData> {
        let session = self.session()?;
        let response = session.failover.sync(
            barrier_id,
            caller_id,
            Request::SyncOnBarrierWithData {
                barrier_id: barrier_id.to_string(),
                caller_id: caller_id.to_string(),
                data,
            },
        )?;

        match response {
            Response::Bytes(bytes) => Ok(bincode::deserialize(&bytes)?),
            Response::Ok => Ok(BarrierData::new()),
            other => Err(Error::Internal(format!(
                "unexpected {} response to SyncOnBarrierWithData",
                other.type_name()
            ))),
        }
    }

    fn generic_barrier_timeout(&self) -> Duration {
        self.session()
            .map(|session| session.config.generic_barrier_timeout())
            .unwrap_or_default()
    }

    fn broadcast_barrier_call(&self, name: &str, request: Request) -> Result<bool> {
        let session = self.session()?;
        let primary = self.membership.primary_node_id();
        let targets = self.membership.active_nodes();

        let results = session.failover.mcast(name, request, &targets);
        let primary_result = results
            .into_iter()
            .find(|(node_id, _)| *node_id == primary)
            .map(|(_, result)| result)
            .ok_or_else(|| Error::Barrier(format!("{}: primary {} not reached", name, primary)))?;

        expect_bool(name, primary_result?)
    }
}

fn expect_bool(name: &str, response: Response) -> Result<bool> {
    match response {
        Response::Bool(value) => Ok(value),
        other => Err(Error::Internal(format!(
            "unexpected {} response to {}",
            other.type_name(),
            name
        ))),
    }
}

//! Transaction kinds and counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// How a remote call is wrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TransactionKind {
    /// Cached read from the primary
    Get,
    /// Side-effecting call to the primary
    Push,
    /// Barrier round on the primary
    Sync,
    /// Independent call to each of several nodes
    Mcast,
    /// Post-failure negotiation, exclusive
    Recovery,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 5] = [
        TransactionKind::Get,
        TransactionKind::Push,
        TransactionKind::Sync,
        TransactionKind::Mcast,
        TransactionKind::Recovery,
    ];

    fn index(self) -> usize {
        match self {
            TransactionKind::Get => 0,
            TransactionKind::Push => 1,
            TransactionKind::Sync => 2,
            TransactionKind::Mcast => 3,
            TransactionKind::Recovery => 4,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::Get => write!(f, "GET"),
            TransactionKind::Push => write!(f, "PUSH"),
            TransactionKind::Sync => write!(f, "SYNC"),
            TransactionKind::Mcast => write!(f, "MCAST"),
            TransactionKind::Recovery => write!(f, "RECOVERY"),
        }
    }
}

/// Snapshot of failover activity
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailoverStats {
    /// transaction kind -> count
    pub transactions: BTreeMap<String, u64>,
    /// transaction name -> count
    pub names: BTreeMap<String, u64>,
    pub failures_handled: u64,
    pub elections: u64,
    pub recoveries: u64,
}

#[derive(Default)]
pub(crate) struct TransactionStats {
    by_kind: [AtomicU64; 5],
    by_name: Mutex<BTreeMap<String, u64>>,
    pub failures_handled: AtomicU64,
    pub elections: AtomicU64,
    pub recoveries: AtomicU64,
}

impl TransactionStats {
    /// Count a transaction. Returns its per-name sequence number.
    pub fn record(&self, kind: TransactionKind, name: &str) -> u64 {
        self.by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);

        let mut names = self.by_name.lock();
        let counter = names.entry(name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn count(&self, name: &str) -> u64 {
        self.by_name.lock().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> FailoverStats {
        FailoverStats {
            transactions: TransactionKind::ALL
                .iter()
                .map(|kind| {
                    (
                        kind.to_string(),
                        self.by_kind[kind.index()].load(Ordering::Relaxed),
                    )
                })
                .collect(),
            names: self.by_name.lock().clone(),
            failures_handled: self.failures_handled.load(Ordering::Relaxed),
            elections: self.elections.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_name_counter_is_monotonic() {
        let stats = TransactionStats::default();
        assert_eq!(stats.record(TransactionKind::Get, "GetTimeData"), 1);
        assert_eq!(stats.record(TransactionKind::Get, "GetTimeData"), 2);
        assert_eq!(stats.record(TransactionKind::Sync, "FrameEnd"), 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.transactions["GET"], 2);
        assert_eq!(snapshot.transactions["SYNC"], 1);
        assert_eq!(snapshot.transactions["RECOVERY"], 0);
        assert_eq!(stats.count("GetTimeData"), 2);
    }
}

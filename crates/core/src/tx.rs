//! Multi-participant transactions.
//!
//! An `N`-participant transaction is created by any participant; the rest
//! join by id. Each participant submits exactly one patch (with an
//! optional match) through its [`Patcher`]. The `N`-th arrival runs the
//! commit sequence; everyone else blocks on the transaction's completion
//! signal and wakes with the shared [`TxResult`]. Either every
//! participant observes the same committed commit number, or every
//! participant observes the same abort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use logd_dlog::ScopeId;
use logd_value::{KindedPath, Node};

use crate::error::TxError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Committing,
    Committed,
    Aborted,
}

/// The shared outcome of a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TxResult {
    pub committed: bool,
    pub commit: Option<u64>,
    pub error: Option<TxError>,
}

impl TxResult {
    pub(crate) fn committed(commit: u64) -> Self {
        TxResult {
            committed: true,
            commit: Some(commit),
            error: None,
        }
    }

    pub(crate) fn aborted(error: TxError) -> Self {
        TxResult {
            committed: false,
            commit: None,
            error: Some(error),
        }
    }
}

/// One participant's contribution.
#[derive(Clone, Debug)]
pub(crate) struct Participant {
    pub path: KindedPath,
    pub body: Node,
    pub match_: Option<Node>,
    pub tx_seq: u64,
}

#[derive(Debug)]
pub(crate) struct TxInner {
    pub received: Vec<Participant>,
    pub status: TxStatus,
    pub result: Option<TxResult>,
}

/// Transaction state, shared between its participants and the store.
#[derive(Debug)]
pub struct Tx {
    pub(crate) id: u64,
    pub(crate) participants: u32,
    pub(crate) scope: Option<ScopeId>,
    pub(crate) created_at: Instant,
    pub(crate) deadline: Duration,
    pub(crate) inner: Mutex<TxInner>,
    pub(crate) done: Condvar,
}

impl Tx {
    pub(crate) fn new(
        id: u64,
        participants: u32,
        scope: Option<ScopeId>,
        deadline: Duration,
    ) -> Arc<Self> {
        Arc::new(Tx {
            id,
            participants,
            scope,
            created_at: Instant::now(),
            deadline,
            inner: Mutex::new(TxInner {
                received: Vec::with_capacity(participants as usize),
                status: TxStatus::Pending,
                result: None,
            }),
            done: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn participant_count(&self) -> u32 {
        self.participants
    }

    pub fn scope(&self) -> Option<&ScopeId> {
        self.scope.as_ref()
    }

    pub(crate) fn expired(&self) -> bool {
        self.created_at.elapsed() > self.deadline
    }

    /// Terminal result if the transaction has completed.
    pub fn result(&self) -> Option<TxResult> {
        self.inner.lock().result.clone()
    }

    /// Record an outcome and wake every waiter. Idempotent: the first
    /// outcome wins.
    pub(crate) fn finish(&self, status: TxStatus, result: TxResult) -> TxResult {
        let mut inner = self.inner.lock();
        if let Some(existing) = &inner.result {
            return existing.clone();
        }
        inner.status = status;
        inner.result = Some(result.clone());
        self.done.notify_all();
        result
    }

    /// Block until the transaction completes or its deadline passes.
    /// Returns `None` on deadline; the caller decides to abort.
    pub(crate) fn wait(&self) -> Option<TxResult> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(result) = &inner.result {
                return Some(result.clone());
            }
            let until = self.created_at + self.deadline;
            if self.done.wait_until(&mut inner, until).timed_out() {
                return inner.result.clone();
            }
        }
    }
}

/// On-disk form of an in-flight transaction (`meta/transactions/<id>.pending`),
/// rewritten via temp + rename.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PendingTxFile {
    pub id: u64,
    pub participants: u32,
    pub scope: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One line of `meta/transactions.log`: the durable record that a
/// transaction committed, for recovery.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TxLogRecord {
    pub tx: u64,
    pub commit: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn finish_is_idempotent_first_wins() {
        let tx = Tx::new(1, 2, None, Duration::from_secs(5));
        let first = tx.finish(TxStatus::Committed, TxResult::committed(9));
        let second = tx.finish(
            TxStatus::Aborted,
            TxResult::aborted(TxError {
                kind: ErrorKind::Conflict,
                message: "too late".into(),
            }),
        );
        assert_eq!(first, second);
        assert_eq!(tx.result().unwrap().commit, Some(9));
        assert_eq!(tx.inner.lock().status, TxStatus::Committed);
    }

    #[test]
    fn wait_returns_after_finish_from_other_thread() {
        let tx = Tx::new(1, 2, None, Duration::from_secs(5));
        let waiter = tx.clone();
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(20));
        tx.finish(TxStatus::Committed, TxResult::committed(3));
        let got = handle.join().unwrap().unwrap();
        assert_eq!(got.commit, Some(3));
    }

    #[test]
    fn wait_times_out_without_result() {
        let tx = Tx::new(1, 2, None, Duration::from_millis(10));
        assert!(tx.wait().is_none());
        assert!(tx.expired());
    }
}

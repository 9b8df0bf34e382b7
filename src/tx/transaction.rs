use super::ids::TransactionId;
use super::manager::{FinishTarget, TxManager, TxState};
use super::partition::{NodeAndTerm, TablePartitionId};
use crate::error::PartTxError;
use crate::hlc::{HybridTimestamp, HybridTimestampTracker};
use crate::lock::{Lock, LockKey, LockMode};
use crate::replica::messages::FinishOutcome;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// What the finish protocol needs from any transaction.
pub trait InternalTransaction: Send + Sync {
    fn id(&self) -> TransactionId;

    fn is_read_only(&self) -> bool;

    /// Begin timestamp for read-write transactions, read timestamp for read-only ones.
    fn start_timestamp(&self) -> HybridTimestamp;

    fn state(&self) -> TxState;
}

pub struct ReadWriteTransaction {
    id: TransactionId,
    manager: TxManager,
    enlisted: DashMap<TablePartitionId, NodeAndTerm>,
    observable_ts_tracker: Arc<HybridTimestampTracker>,
    commit_part: OnceLock<TablePartitionId>,
    /// Held shared by `enlist` and exclusively while `finish` snapshots the
    /// enlistment, so an accepted enlistment is always part of the snapshot.
    enlistment: RwLock<()>,
    finishing: AtomicBool,
    state: Mutex<TxState>,
}

impl ReadWriteTransaction {
    pub(crate) fn new(
        id: TransactionId,
        manager: TxManager,
        observable_ts_tracker: Arc<HybridTimestampTracker>,
    ) -> Self {
        Self {
            id,
            manager,
            enlisted: DashMap::new(),
            observable_ts_tracker,
            commit_part: OnceLock::new(),
            enlistment: RwLock::new(()),
            finishing: AtomicBool::new(false),
            state: Mutex::new(TxState::Pending),
        }
    }

    /// Records the primary and lease term a partition is accessed through.
    /// The first entry recorded for a partition wins and is returned to every
    /// later caller, whatever they passed in.
    pub fn enlist(
        &self,
        partition: TablePartitionId,
        node_and_term: NodeAndTerm,
    ) -> Result<NodeAndTerm, PartTxError> {
        let _enlistment = self.enlistment.read();
        if self.finishing.load(Ordering::Acquire) {
            return Err(PartTxError::TransactionAlreadyFinished { tx_id: self.id });
        }
        Ok(self
            .enlisted
            .entry(partition)
            .or_insert(node_and_term)
            .value()
            .clone())
    }

    /// True only for the first call over the transaction's lifetime.
    pub fn assign_commit_partition(&self, partition: TablePartitionId) -> bool {
        self.commit_part.set(partition).is_ok()
    }

    pub fn commit_partition(&self) -> Option<TablePartitionId> {
        self.commit_part.get().copied()
    }

    pub fn enlisted_node_and_term(&self, partition: TablePartitionId) -> Option<NodeAndTerm> {
        self.enlisted.get(&partition).map(|e| e.value().clone())
    }

    pub fn enlisted_partitions(&self) -> Vec<TablePartitionId> {
        let mut partitions: Vec<TablePartitionId> = self.enlisted.iter().map(|e| *e.key()).collect();
        partitions.sort();
        partitions
    }

    pub fn observable_timestamp_tracker(&self) -> &Arc<HybridTimestampTracker> {
        &self.observable_ts_tracker
    }

    /// Takes a row lock on behalf of this transaction; released when it finishes.
    pub async fn lock(&self, key: LockKey, mode: LockMode) -> Result<Lock, PartTxError> {
        if self.finishing.load(Ordering::Acquire) {
            return Err(PartTxError::TransactionAlreadyFinished { tx_id: self.id });
        }
        self.manager.lock_manager().acquire(self.id, key, mode).await
    }

    pub async fn commit(&self) -> Result<FinishOutcome, PartTxError> {
        self.finish(true).await
    }

    pub async fn rollback(&self) -> Result<FinishOutcome, PartTxError> {
        self.finish(false).await
    }

    async fn finish(&self, commit: bool) -> Result<FinishOutcome, PartTxError> {
        let (enlisted_groups, target) = {
            let _enlistment = self.enlistment.write();
            if self.finishing.swap(true, Ordering::AcqRel) {
                return Err(PartTxError::TransactionAlreadyFinished { tx_id: self.id });
            }
            let enlisted_groups: HashMap<TablePartitionId, u64> = self
                .enlisted
                .iter()
                .map(|e| (*e.key(), e.value().term))
                .collect();
            match self.finish_target(&enlisted_groups) {
                Ok(target) => (enlisted_groups, target),
                Err(e) => {
                    // Nothing was sent; the caller may assign a commit partition and retry.
                    self.finishing.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        };

        *self.state.lock() = TxState::Finishing;
        let result = self
            .manager
            .finish(
                &self.observable_ts_tracker,
                target,
                commit,
                enlisted_groups,
                self.id,
            )
            .await;
        match &result {
            Ok(outcome) => *self.state.lock() = outcome.outcome.into(),
            Err(PartTxError::TransactionAborted { .. }) => *self.state.lock() = TxState::Aborted,
            // Undetermined: the commit partition holds the answer.
            Err(_) => {}
        }
        result
    }

    fn finish_target(
        &self,
        enlisted_groups: &HashMap<TablePartitionId, u64>,
    ) -> Result<Option<FinishTarget>, PartTxError> {
        if enlisted_groups.is_empty() {
            return Ok(None);
        }
        let commit_partition = self.commit_partition().ok_or_else(|| {
            PartTxError::ContractViolation(format!(
                "transaction {} enlisted partitions but has no commit partition",
                self.id
            ))
        })?;
        let entry = self.enlisted_node_and_term(commit_partition).ok_or_else(|| {
            PartTxError::ContractViolation(format!(
                "commit partition {commit_partition} of transaction {} is not enlisted",
                self.id
            ))
        })?;
        Ok(Some(FinishTarget {
            commit_partition,
            recipient: entry.node,
            term: entry.term,
        }))
    }
}

impl InternalTransaction for ReadWriteTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn start_timestamp(&self) -> HybridTimestamp {
        self.id.begin_timestamp()
    }

    fn state(&self) -> TxState {
        *self.state.lock()
    }
}

/// Reads a consistent snapshot at `read_timestamp`; never enlists.
pub struct ReadOnlyTransaction {
    id: TransactionId,
    manager: TxManager,
    observable_ts_tracker: Arc<HybridTimestampTracker>,
    read_timestamp: HybridTimestamp,
    finishing: AtomicBool,
    state: Mutex<TxState>,
}

impl ReadOnlyTransaction {
    pub(crate) fn new(
        id: TransactionId,
        manager: TxManager,
        observable_ts_tracker: Arc<HybridTimestampTracker>,
        read_timestamp: HybridTimestamp,
    ) -> Self {
        Self {
            id,
            manager,
            observable_ts_tracker,
            read_timestamp,
            finishing: AtomicBool::new(false),
            state: Mutex::new(TxState::Pending),
        }
    }

    pub fn read_timestamp(&self) -> HybridTimestamp {
        self.read_timestamp
    }

    pub async fn commit(&self) -> Result<FinishOutcome, PartTxError> {
        self.finish(true).await
    }

    pub async fn rollback(&self) -> Result<FinishOutcome, PartTxError> {
        self.finish(false).await
    }

    async fn finish(&self, commit: bool) -> Result<FinishOutcome, PartTxError> {
        if self.finishing.swap(true, Ordering::AcqRel) {
            return Err(PartTxError::TransactionAlreadyFinished { tx_id: self.id });
        }
        let outcome = self
            .manager
            .finish(
                &self.observable_ts_tracker,
                None,
                commit,
                HashMap::new(),
                self.id,
            )
            .await?;
        *self.state.lock() = outcome.outcome.into();
        Ok(outcome)
    }
}

impl InternalTransaction for ReadOnlyTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn start_timestamp(&self) -> HybridTimestamp {
        self.read_timestamp
    }

    fn state(&self) -> TxState {
        *self.state.lock()
    }
}

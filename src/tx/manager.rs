use super::ids::{TransactionId, TransactionIdGenerator};
use super::partition::{ClusterNode, TablePartitionId};
use super::transaction::{ReadOnlyTransaction, ReadWriteTransaction};
use crate::busy_lock::BusyLock;
use crate::config::PartTxConfig;
use crate::error::PartTxError;
use crate::hlc::{HybridClock, HybridTimestamp, HybridTimestampTracker};
use crate::lock::LockManager;
use crate::replica::ReplicaService;
use crate::replica::messages::{FinishOutcome, FinishRequest, TxOutcome};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Finishing,
    Committed,
    Aborted,
}

impl From<TxOutcome> for TxState {
    fn from(outcome: TxOutcome) -> Self {
        match outcome {
            TxOutcome::Committed => TxState::Committed,
            TxOutcome::Aborted => TxState::Aborted,
        }
    }
}

/// Where the durable decision of a transaction goes: the commit partition and
/// the primary (with its lease term) it was enlisted through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishTarget {
    pub commit_partition: TablePartitionId,
    pub recipient: ClusterNode,
    pub term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxManagerMetrics {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub finish_failures: u64,
    pub active: usize,
}

#[derive(Debug, Default)]
struct TxTelemetry {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    finish_failures: AtomicU64,
}

struct TxManagerInner {
    config: Arc<PartTxConfig>,
    clock: Arc<dyn HybridClock>,
    id_gen: TransactionIdGenerator,
    lock_manager: Arc<LockManager>,
    replica: Arc<dyn ReplicaService>,
    active: DashMap<TransactionId, TxState>,
    busy: BusyLock,
    telemetry: TxTelemetry,
}

/// Creates transactions, keeps the registry of active ones and runs the
/// finish protocol on their behalf. Cheap to clone.
#[derive(Clone)]
pub struct TxManager {
    inner: Arc<TxManagerInner>,
}

/// The request may have been applied even though no reply arrived.
fn outcome_undetermined(error: &PartTxError) -> bool {
    matches!(
        error,
        PartTxError::Timeout | PartTxError::Unavailable { .. }
    )
}

impl TxManager {
    pub fn new(
        config: Arc<PartTxConfig>,
        clock: Arc<dyn HybridClock>,
        replica: Arc<dyn ReplicaService>,
    ) -> Self {
        let id_gen = TransactionIdGenerator::new(Arc::clone(&clock), &config.node_name);
        let lock_manager = Arc::new(LockManager::new(config.lock_wait_timeout()));
        Self {
            inner: Arc::new(TxManagerInner {
                config,
                clock,
                id_gen,
                lock_manager,
                replica,
                active: DashMap::new(),
                busy: BusyLock::new(),
                telemetry: TxTelemetry::default(),
            }),
        }
    }

    pub fn config(&self) -> &PartTxConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &Arc<dyn HybridClock> {
        &self.inner.clock
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.inner.lock_manager
    }

    /// Starts a read-write transaction in the causal session of `tracker`.
    /// The begin timestamp is past anything the session has observed.
    pub fn begin(
        &self,
        tracker: Arc<HybridTimestampTracker>,
    ) -> Result<ReadWriteTransaction, PartTxError> {
        let id = self.register(&tracker)?;
        debug!(tx_id = %id, "read-write transaction started");
        Ok(ReadWriteTransaction::new(id, self.clone(), tracker))
    }

    pub fn begin_read_only(
        &self,
        tracker: Arc<HybridTimestampTracker>,
    ) -> Result<ReadOnlyTransaction, PartTxError> {
        let id = self.register(&tracker)?;
        let safe_time = self
            .inner
            .clock
            .now()
            .subtract_physical_time(self.inner.config.read_only_lag_ms);
        let read_timestamp = match tracker.get() {
            Some(observed) if observed > safe_time => observed,
            _ => safe_time,
        };
        debug!(tx_id = %id, %read_timestamp, "read-only transaction started");
        Ok(ReadOnlyTransaction::new(
            id,
            self.clone(),
            tracker,
            read_timestamp,
        ))
    }

    fn register(&self, tracker: &HybridTimestampTracker) -> Result<TransactionId, PartTxError> {
        let _guard = self.inner.busy.enter().ok_or(PartTxError::NodeStopping)?;
        let limit = self.inner.config.max_active_transactions;
        if self.inner.active.len() >= limit {
            return Err(PartTxError::TooManyTransactions { limit });
        }
        if let Some(observed) = tracker.get() {
            self.inner.clock.update(observed);
        }
        let id = self.inner.id_gen.next();
        self.inner.active.insert(id, TxState::Pending);
        self.inner.telemetry.started.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Turns an enlistment set and a commit/abort intent into one durable
    /// decision.
    ///
    /// With no `target` nothing was enlisted and nothing is sent. Otherwise one
    /// finish request goes to the commit partition's primary carrying every
    /// enlisted group with its term. The session tracker and the local clock
    /// move past the decision timestamp.
    ///
    /// The transaction leaves the registry whatever the result. Its locks are
    /// released once the result is definite. After [`PartTxError::Timeout`] or
    /// [`PartTxError::Unavailable`] the request may already be recorded, so the
    /// locks stay held until a retry for the same `tx_id` returns. The commit
    /// partition answers a retry with the decision it recorded first.
    pub async fn finish(
        &self,
        tracker: &HybridTimestampTracker,
        target: Option<FinishTarget>,
        commit: bool,
        enlisted_groups: HashMap<TablePartitionId, u64>,
        tx_id: TransactionId,
    ) -> Result<FinishOutcome, PartTxError> {
        let _guard = self.inner.busy.enter().ok_or(PartTxError::NodeStopping)?;
        if let Some(mut state) = self.inner.active.get_mut(&tx_id) {
            *state = TxState::Finishing;
        }

        let result = match target {
            None if enlisted_groups.is_empty() => Ok(FinishOutcome {
                outcome: TxOutcome::from_commit(commit),
                timestamp: None,
            }),
            None => Err(PartTxError::ContractViolation(format!(
                "transaction {tx_id} enlisted {} partitions but has no commit partition",
                enlisted_groups.len()
            ))),
            Some(target) => self.send_finish(target, commit, enlisted_groups, tx_id).await,
        };

        self.inner.active.remove(&tx_id);
        if result.as_ref().is_err_and(outcome_undetermined) {
            debug!(%tx_id, "finish outcome undetermined, keeping locks");
        } else {
            self.inner.lock_manager.release_all(tx_id);
        }

        match result {
            Ok(outcome) => {
                if let Some(ts) = outcome.timestamp {
                    self.inner.clock.update(ts);
                    tracker.update(ts);
                }
                let counter = match outcome.outcome {
                    TxOutcome::Committed => &self.inner.telemetry.committed,
                    TxOutcome::Aborted => &self.inner.telemetry.aborted,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                if commit && outcome.outcome == TxOutcome::Aborted {
                    return Err(PartTxError::TransactionAborted { tx_id });
                }
                Ok(outcome)
            }
            Err(e) => {
                self.inner
                    .telemetry
                    .finish_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(%tx_id, commit, error = %e, "transaction finish failed");
                Err(e)
            }
        }
    }

    async fn send_finish(
        &self,
        target: FinishTarget,
        commit: bool,
        enlisted_groups: HashMap<TablePartitionId, u64>,
        tx_id: TransactionId,
    ) -> Result<FinishOutcome, PartTxError> {
        if !enlisted_groups.contains_key(&target.commit_partition) {
            return Err(PartTxError::ContractViolation(format!(
                "commit partition {} of transaction {tx_id} is not enlisted",
                target.commit_partition
            )));
        }
        debug!(
            %tx_id,
            commit,
            commit_partition = %target.commit_partition,
            recipient = %target.recipient,
            term = target.term,
            groups = enlisted_groups.len(),
            "sending finish request"
        );
        let request = FinishRequest {
            tx_id,
            commit,
            commit_partition: target.commit_partition,
            enlisted_groups,
            term: target.term,
        };
        match tokio::time::timeout(
            self.inner.config.finish_timeout(),
            self.inner.replica.finish(&target.recipient, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PartTxError::Timeout),
        }
    }

    /// State of an active transaction; `None` once it has finished.
    pub fn state(&self, tx_id: TransactionId) -> Option<TxState> {
        self.inner.active.get(&tx_id).map(|s| *s.value())
    }

    pub fn pending(&self) -> usize {
        self.inner.active.len()
    }

    pub fn metrics(&self) -> TxManagerMetrics {
        let t = &self.inner.telemetry;
        TxManagerMetrics {
            started: t.started.load(Ordering::Relaxed),
            committed: t.committed.load(Ordering::Relaxed),
            aborted: t.aborted.load(Ordering::Relaxed),
            finish_failures: t.finish_failures.load(Ordering::Relaxed),
            active: self.inner.active.len(),
        }
    }

    pub fn now(&self) -> HybridTimestamp {
        self.inner.clock.now()
    }

    /// Lets in-flight finishes complete; afterwards `begin` and `finish` fail
    /// with [`PartTxError::NodeStopping`]. Repeated calls are no-ops.
    pub async fn stop(&self) {
        if self.inner.busy.is_blocked() {
            return;
        }
        self.inner.busy.block().await;
        info!(
            node = %self.inner.config.node_name,
            pending = self.inner.active.len(),
            "transaction manager stopped"
        );
    }
}

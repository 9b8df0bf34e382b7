pub mod busy_lock;
pub mod config;
pub mod error;
pub mod event;
pub mod hlc;
pub mod index;
#[cfg(test)]
mod lib_tests;
pub mod lock;
pub mod replica;
pub mod storage;
pub mod tx;

use crate::config::PartTxConfig;
use crate::error::PartTxError;
use crate::hlc::{HybridClock, HybridClockImpl, HybridTimestampTracker};
use crate::index::{DropIndexEvent, IndexBuilder, PrimaryReplicaExpiredEvent};
use crate::lock::LockManager;
use crate::replica::ReplicaService;
use crate::tx::{ClusterNode, ReadOnlyTransaction, ReadWriteTransaction, TxManager};
use std::sync::Arc;
use tracing::info;

pub use crate::error::PartTxErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationalMetrics {
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub finish_failures: u64,
    pub active_transactions: usize,
    pub held_lock_keys: usize,
    pub active_index_builds: usize,
}

/// Transaction coordination and index building for one cluster node.
pub struct PartTxNode {
    config: Arc<PartTxConfig>,
    local_node: ClusterNode,
    clock: Arc<dyn HybridClock>,
    tx_manager: TxManager,
    index_builder: IndexBuilder,
}

impl PartTxNode {
    /// Must be called from within a tokio runtime; index builds run on it.
    pub fn start(
        config: PartTxConfig,
        replica: Arc<dyn ReplicaService>,
    ) -> Result<Self, PartTxError> {
        Self::with_clock(config, replica, Arc::new(HybridClockImpl::new()))
    }

    pub fn with_clock(
        config: PartTxConfig,
        replica: Arc<dyn ReplicaService>,
        clock: Arc<dyn HybridClock>,
    ) -> Result<Self, PartTxError> {
        config.validate()?;
        let config = Arc::new(config);
        let index_builder = IndexBuilder::new(&config, Arc::clone(&replica))?;
        let tx_manager = TxManager::new(Arc::clone(&config), Arc::clone(&clock), replica);
        info!(
            node = %config.node_name,
            index_build_threads = config.index_build_threads,
            batch_size = config.index_build_batch_size,
            "parttx node started"
        );
        Ok(Self {
            local_node: ClusterNode::named(config.node_name.clone()),
            config,
            clock,
            tx_manager,
            index_builder,
        })
    }

    pub fn config(&self) -> &PartTxConfig {
        &self.config
    }

    pub fn local_node(&self) -> &ClusterNode {
        &self.local_node
    }

    pub fn clock(&self) -> &Arc<dyn HybridClock> {
        &self.clock
    }

    pub fn tx_manager(&self) -> &TxManager {
        &self.tx_manager
    }

    pub fn index_builder(&self) -> &IndexBuilder {
        &self.index_builder
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.tx_manager.lock_manager()
    }

    pub fn begin(
        &self,
        tracker: Arc<HybridTimestampTracker>,
    ) -> Result<ReadWriteTransaction, PartTxError> {
        self.tx_manager.begin(tracker)
    }

    pub fn begin_read_only(
        &self,
        tracker: Arc<HybridTimestampTracker>,
    ) -> Result<ReadOnlyTransaction, PartTxError> {
        self.tx_manager.begin_read_only(tracker)
    }

    pub fn on_primary_replica_expired(&self, event: PrimaryReplicaExpiredEvent) {
        info!(
            node = %self.config.node_name,
            group = %event.group_id,
            term = event.term,
            "primary lease expired, stopping index builds"
        );
        self.index_builder
            .stop_building_indexes(event.group_id.table_id, event.group_id.partition_id);
    }

    pub fn on_index_dropped(&self, event: DropIndexEvent) {
        self.index_builder
            .stop_building_indexes_for_index(event.index_id);
    }

    pub fn on_table_dropped(&self, table_id: i32) {
        self.index_builder.stop_building_table_indexes(table_id);
    }

    pub fn operational_metrics(&self) -> OperationalMetrics {
        let tx = self.tx_manager.metrics();
        OperationalMetrics {
            transactions_started: tx.started,
            transactions_committed: tx.committed,
            transactions_aborted: tx.aborted,
            finish_failures: tx.finish_failures,
            active_transactions: tx.active,
            held_lock_keys: self.lock_manager().locked_keys(),
            active_index_builds: self.index_builder.active_tasks().len(),
        }
    }

    /// Closes the index builder, then drains and stops the transaction manager.
    pub async fn shutdown(&self) {
        self.index_builder.close().await;
        self.tx_manager.stop().await;
        info!(node = %self.config.node_name, "parttx node stopped");
    }
}

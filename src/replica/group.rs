use super::ReplicaService;
use super::messages::{
    BuildIndexRequest, FinishOutcome, FinishRequest, ReplicatedCommand, TxOutcome,
    encode_command,
};
use crate::error::{PartTxError, ResourceType};
use crate::hlc::{HybridClock, HybridTimestamp};
use crate::storage::{IndexStorage, MvPartitionStorage};
use crate::tx::ids::TransactionId;
use crate::tx::partition::{ClusterNode, TablePartitionId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Decision record held by a commit partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStateMeta {
    pub outcome: TxOutcome,
    pub timestamp: HybridTimestamp,
    pub enlisted_groups: HashMap<TablePartitionId, u64>,
}

/// One partition's replication group as seen from its primary.
///
/// Commands are applied one at a time under the log lock, which plays the
/// role of the consensus log's linearizable apply.
pub struct ReplicaGroup {
    group_id: TablePartitionId,
    clock: Arc<dyn HybridClock>,
    /// Current lease term; doubles as the enlistment consistency token.
    lease_term: AtomicU64,
    tx_states: DashMap<TransactionId, TxStateMeta>,
    log: Mutex<Vec<Vec<u8>>>,
    partition_storage: Arc<dyn MvPartitionStorage>,
    index_storages: DashMap<i32, Arc<dyn IndexStorage>>,
}

impl ReplicaGroup {
    pub fn new(
        group_id: TablePartitionId,
        clock: Arc<dyn HybridClock>,
        partition_storage: Arc<dyn MvPartitionStorage>,
        lease_term: u64,
    ) -> Self {
        Self {
            group_id,
            clock,
            lease_term: AtomicU64::new(lease_term),
            tx_states: DashMap::new(),
            log: Mutex::new(Vec::new()),
            partition_storage,
            index_storages: DashMap::new(),
        }
    }

    pub fn group_id(&self) -> TablePartitionId {
        self.group_id
    }

    pub fn lease_term(&self) -> u64 {
        self.lease_term.load(Ordering::Acquire)
    }

    /// A new lease was granted; requests carrying older terms are rejected from now on.
    pub fn renew_lease(&self) -> u64 {
        let _log = self.log.lock();
        self.lease_term.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn register_index(&self, index_id: i32, storage: Arc<dyn IndexStorage>) {
        self.index_storages.insert(index_id, storage);
    }

    pub fn partition_storage(&self) -> &Arc<dyn MvPartitionStorage> {
        &self.partition_storage
    }

    pub fn tx_state(&self, tx_id: TransactionId) -> Option<TxStateMeta> {
        self.tx_states.get(&tx_id).map(|s| s.value().clone())
    }

    pub fn applied_commands(&self) -> usize {
        self.log.lock().len()
    }

    pub fn command_log(&self) -> Vec<Vec<u8>> {
        self.log.lock().clone()
    }

    /// Records the decision for a transaction. A repeated request returns the
    /// decision recorded first, whatever the repeated request asked for.
    pub fn apply_finish(&self, request: &FinishRequest) -> Result<FinishOutcome, PartTxError> {
        let mut log = self.log.lock();

        if let Some(existing) = self.tx_states.get(&request.tx_id) {
            debug!(
                tx_id = %request.tx_id,
                group = %self.group_id,
                outcome = ?existing.outcome,
                "finish already recorded"
            );
            return Ok(FinishOutcome {
                outcome: existing.outcome,
                timestamp: Some(existing.timestamp),
            });
        }

        let current_term = self.lease_term();
        if request.term != current_term {
            return Err(PartTxError::PrimaryReplicaMiss {
                group: self.group_id,
                expected_term: request.term,
                current_term,
            });
        }
        if !request.enlisted_groups.contains_key(&self.group_id) {
            return Err(PartTxError::ContractViolation(format!(
                "commit partition {} is missing from enlisted groups of {}",
                self.group_id, request.tx_id
            )));
        }

        let outcome = TxOutcome::from_commit(request.commit);
        let timestamp = self.clock.now();
        let mut enlisted_groups: Vec<(TablePartitionId, u64)> = request
            .enlisted_groups
            .iter()
            .map(|(group, term)| (*group, *term))
            .collect();
        enlisted_groups.sort();
        log.push(encode_command(&ReplicatedCommand::FinishTx {
            tx_id: request.tx_id,
            outcome,
            timestamp,
            enlisted_groups,
        })?);
        self.tx_states.insert(
            request.tx_id,
            TxStateMeta {
                outcome,
                timestamp,
                enlisted_groups: request.enlisted_groups.clone(),
            },
        );
        Ok(FinishOutcome {
            outcome,
            timestamp: Some(timestamp),
        })
    }

    /// Indexes one batch and moves the index's persisted cursor past it.
    pub fn apply_build_index(&self, request: &BuildIndexRequest) -> Result<(), PartTxError> {
        let mut log = self.log.lock();

        let current = self.lease_term();
        if request.enlistment_consistency_token != current {
            return Err(PartTxError::StaleFencingToken {
                group: self.group_id,
                token: request.enlistment_consistency_token,
                current,
            });
        }
        let index = self
            .index_storages
            .get(&request.index_id)
            .map(|i| Arc::clone(i.value()))
            .ok_or_else(|| PartTxError::NotFound {
                resource_type: ResourceType::Index,
                resource_id: format!("{}/{}", self.group_id, request.index_id),
            })?;

        log.push(encode_command(&ReplicatedCommand::BuildIndex {
            index_id: request.index_id,
            row_ids: request.row_ids.clone(),
            finish: request.finish,
        })?);
        for row_id in &request.row_ids {
            if let Some(row) = self.partition_storage.read(*row_id) {
                index.put(*row_id, row);
            }
        }
        let next = if request.finish {
            None
        } else {
            request.row_ids.last().and_then(|last| last.increment())
        };
        index.set_next_row_id_to_build(next);
        Ok(())
    }
}

/// Routes requests to groups registered under (node, partition).
#[derive(Default)]
pub struct LocalReplicaService {
    groups: DashMap<(String, TablePartitionId), Arc<ReplicaGroup>>,
}

impl LocalReplicaService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, node: &ClusterNode, group: Arc<ReplicaGroup>) {
        self.groups.insert((node.id.clone(), group.group_id()), group);
    }

    pub fn remove_group(&self, node: &ClusterNode, group_id: TablePartitionId) {
        self.groups.remove(&(node.id.clone(), group_id));
    }

    pub fn group(&self, node: &ClusterNode, group_id: TablePartitionId) -> Option<Arc<ReplicaGroup>> {
        self.groups
            .get(&(node.id.clone(), group_id))
            .map(|g| Arc::clone(g.value()))
    }

    fn route(
        &self,
        node: &ClusterNode,
        group_id: TablePartitionId,
    ) -> Result<Arc<ReplicaGroup>, PartTxError> {
        self.group(node, group_id)
            .ok_or_else(|| PartTxError::Unavailable {
                message: format!("no replica of {group_id} on node {node}"),
            })
    }
}

#[async_trait]
impl ReplicaService for LocalReplicaService {
    async fn finish(
        &self,
        recipient: &ClusterNode,
        request: FinishRequest,
    ) -> Result<FinishOutcome, PartTxError> {
        self.route(recipient, request.commit_partition)?
            .apply_finish(&request)
    }

    async fn build_index(
        &self,
        recipient: &ClusterNode,
        request: BuildIndexRequest,
    ) -> Result<(), PartTxError> {
        self.route(recipient, request.group_id())?
            .apply_build_index(&request)
    }
}

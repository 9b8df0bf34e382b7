use crate::error::PartTxError;
use crate::hlc::HybridTimestamp;
use crate::storage::RowId;
use crate::tx::ids::TransactionId;
use crate::tx::partition::TablePartitionId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxOutcome {
    Committed,
    Aborted,
}

impl TxOutcome {
    pub fn from_commit(commit: bool) -> Self {
        if commit {
            TxOutcome::Committed
        } else {
            TxOutcome::Aborted
        }
    }
}

/// Durable finish request, sent to the primary of the commit partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRequest {
    pub tx_id: TransactionId,
    pub commit: bool,
    pub commit_partition: TablePartitionId,
    /// Every enlisted partition with the lease term it was enlisted under.
    pub enlisted_groups: HashMap<TablePartitionId, u64>,
    /// Term of the commit partition's lease the request is addressed to.
    pub term: u64,
}

/// Decision recorded by the commit partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishOutcome {
    pub outcome: TxOutcome,
    /// Decision timestamp; `None` when nothing had to be made durable.
    pub timestamp: Option<HybridTimestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIndexRequest {
    pub table_id: i32,
    pub partition_id: i32,
    pub index_id: i32,
    /// Ascending, at most one batch worth of row ids.
    pub row_ids: Vec<RowId>,
    /// Last batch: the index is complete once it is applied.
    pub finish: bool,
    pub enlistment_consistency_token: u64,
}

impl BuildIndexRequest {
    pub fn group_id(&self) -> TablePartitionId {
        TablePartitionId::new(self.table_id, self.partition_id)
    }
}

/// Commands appended to a replication group's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatedCommand {
    FinishTx {
        tx_id: TransactionId,
        outcome: TxOutcome,
        timestamp: HybridTimestamp,
        enlisted_groups: Vec<(TablePartitionId, u64)>,
    },
    BuildIndex {
        index_id: i32,
        row_ids: Vec<RowId>,
        finish: bool,
    },
}

pub fn encode_command(command: &ReplicatedCommand) -> Result<Vec<u8>, PartTxError> {
    rmp_serde::to_vec(command).map_err(|e| PartTxError::Encode(e.to_string()))
}

pub fn decode_command(bytes: &[u8]) -> Result<ReplicatedCommand, PartTxError> {
    rmp_serde::from_slice(bytes).map_err(|e| PartTxError::Decode(e.to_string()))
}

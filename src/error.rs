use crate::tx::ids::TransactionId;
use crate::tx::partition::TablePartitionId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Table,
    Partition,
    Index,
    Node,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Table => write!(f, "table"),
            ResourceType::Partition => write!(f, "partition"),
            ResourceType::Index => write!(f, "index"),
            ResourceType::Node => write!(f, "node"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartTxErrorCode {
    Encode,
    Decode,
    InvalidConfig,
    ContractViolation,
    TransactionAlreadyFinished,
    TransactionAborted,
    TooManyTransactions,
    Unavailable,
    Timeout,
    PrimaryReplicaMiss,
    StaleFencingToken,
    LockConflict,
    LockTimeout,
    NodeStopping,
    TableNotFound,
    PartitionNotFound,
    IndexNotFound,
    NodeNotFound,
}

impl PartTxErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            PartTxErrorCode::Encode => "encode",
            PartTxErrorCode::Decode => "decode",
            PartTxErrorCode::InvalidConfig => "invalid_config",
            PartTxErrorCode::ContractViolation => "contract_violation",
            PartTxErrorCode::TransactionAlreadyFinished => "transaction_already_finished",
            PartTxErrorCode::TransactionAborted => "transaction_aborted",
            PartTxErrorCode::TooManyTransactions => "too_many_transactions",
            PartTxErrorCode::Unavailable => "unavailable",
            PartTxErrorCode::Timeout => "timeout",
            PartTxErrorCode::PrimaryReplicaMiss => "primary_replica_miss",
            PartTxErrorCode::StaleFencingToken => "stale_fencing_token",
            PartTxErrorCode::LockConflict => "lock_conflict",
            PartTxErrorCode::LockTimeout => "lock_timeout",
            PartTxErrorCode::NodeStopping => "node_stopping",
            PartTxErrorCode::TableNotFound => "table_not_found",
            PartTxErrorCode::PartitionNotFound => "partition_not_found",
            PartTxErrorCode::IndexNotFound => "index_not_found",
            PartTxErrorCode::NodeNotFound => "node_not_found",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum PartTxError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    /// The caller broke a protocol precondition. Never retried, never corrected.
    #[error("protocol contract violation: {0}")]
    ContractViolation(String),
    #[error("transaction {tx_id} is already finished")]
    TransactionAlreadyFinished { tx_id: TransactionId },
    #[error("transaction {tx_id} was aborted by its commit partition")]
    TransactionAborted { tx_id: TransactionId },
    #[error("too many active transactions (limit {limit})")]
    TooManyTransactions { limit: usize },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
    #[error("timeout")]
    Timeout,
    #[error(
        "primary replica miss for group {group}: expected term {expected_term}, current term {current_term}"
    )]
    PrimaryReplicaMiss {
        group: TablePartitionId,
        expected_term: u64,
        current_term: u64,
    },
    #[error("stale enlistment consistency token {token} for group {group} (current {current})")]
    StaleFencingToken {
        group: TablePartitionId,
        token: u64,
        current: u64,
    },
    #[error("lock conflict: transaction {tx_id} lost the wait ordering on {key}")]
    LockConflict { tx_id: TransactionId, key: String },
    #[error("lock wait timeout: transaction {tx_id} on {key}")]
    LockTimeout { tx_id: TransactionId, key: String },
    #[error("node is stopping")]
    NodeStopping,
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
}

impl PartTxError {
    pub fn code(&self) -> PartTxErrorCode {
        match self {
            PartTxError::Encode(_) => PartTxErrorCode::Encode,
            PartTxError::Decode(_) => PartTxErrorCode::Decode,
            PartTxError::InvalidConfig { .. } => PartTxErrorCode::InvalidConfig,
            PartTxError::ContractViolation(_) => PartTxErrorCode::ContractViolation,
            PartTxError::TransactionAlreadyFinished { .. } => {
                PartTxErrorCode::TransactionAlreadyFinished
            }
            PartTxError::TransactionAborted { .. } => PartTxErrorCode::TransactionAborted,
            PartTxError::TooManyTransactions { .. } => PartTxErrorCode::TooManyTransactions,
            PartTxError::Unavailable { .. } => PartTxErrorCode::Unavailable,
            PartTxError::Timeout => PartTxErrorCode::Timeout,
            PartTxError::PrimaryReplicaMiss { .. } => PartTxErrorCode::PrimaryReplicaMiss,
            PartTxError::StaleFencingToken { .. } => PartTxErrorCode::StaleFencingToken,
            PartTxError::LockConflict { .. } => PartTxErrorCode::LockConflict,
            PartTxError::LockTimeout { .. } => PartTxErrorCode::LockTimeout,
            PartTxError::NodeStopping => PartTxErrorCode::NodeStopping,
            PartTxError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Table => PartTxErrorCode::TableNotFound,
                ResourceType::Partition => PartTxErrorCode::PartitionNotFound,
                ResourceType::Index => PartTxErrorCode::IndexNotFound,
                ResourceType::Node => PartTxErrorCode::NodeNotFound,
            },
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Transient failures: the operation may be retried with the same
    /// transaction id / batch because the receiving side applies it idempotently.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PartTxError::Timeout
                | PartTxError::Unavailable { .. }
                | PartTxError::PrimaryReplicaMiss { .. }
                | PartTxError::LockConflict { .. }
                | PartTxError::LockTimeout { .. }
        )
    }

    pub fn is_node_stopping(&self) -> bool {
        matches!(self, PartTxError::NodeStopping)
    }
}

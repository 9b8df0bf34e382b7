pub mod ids;
pub mod manager;
pub mod partition;
pub mod transaction;

pub use ids::{TransactionId, TransactionIdGenerator};
pub use manager::{FinishTarget, TxManager, TxManagerMetrics, TxState};
pub use partition::{ClusterNode, NodeAndTerm, TablePartitionId};
pub use transaction::{InternalTransaction, ReadOnlyTransaction, ReadWriteTransaction};

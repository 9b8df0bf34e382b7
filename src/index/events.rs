use crate::tx::partition::TablePartitionId;

/// Catalog event: an index was dropped from a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropIndexEvent {
    pub table_id: i32,
    pub index_id: i32,
}

/// Placement-driver event: this node's primary lease for a group expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryReplicaExpiredEvent {
    pub group_id: TablePartitionId,
    /// Term of the lease that expired.
    pub term: u64,
}

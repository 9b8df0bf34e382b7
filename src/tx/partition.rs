use serde::{Deserialize, Serialize};
use std::fmt;

/// A partition of a table; also the id of the replication group that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TablePartitionId {
    pub table_id: i32,
    pub partition_id: i32,
}

impl TablePartitionId {
    pub fn new(table_id: i32, partition_id: i32) -> Self {
        Self {
            table_id,
            partition_id,
        }
    }
}

impl fmt::Display for TablePartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_part_{}", self.table_id, self.partition_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub name: String,
}

impl ClusterNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Node whose id equals its name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
        }
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Enlistment entry: the primary replica a partition was enlisted through and
/// the term of its lease at that time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAndTerm {
    pub node: ClusterNode,
    pub term: u64,
}

impl NodeAndTerm {
    pub fn new(node: ClusterNode, term: u64) -> Self {
        Self { node, term }
    }
}

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

/// Row identifier inside one partition. Row ids are totally ordered; index
/// building walks them in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl RowId {
    pub const LOWEST: RowId = RowId(0);

    pub fn increment(self) -> Option<RowId> {
        self.0.checked_add(1).map(RowId)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage of one index within one partition.
pub trait IndexStorage: Send + Sync {
    /// Lowest row id not yet indexed, or `None` once the index is fully built.
    /// Persisted together with the index so a restart resumes from here.
    fn next_row_id_to_build(&self) -> Option<RowId>;

    fn set_next_row_id_to_build(&self, row_id: Option<RowId>);

    fn put(&self, row_id: RowId, row: Vec<u8>);

    fn get(&self, row_id: RowId) -> Option<Vec<u8>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Multi-versioned row storage of one partition, reduced to what index
/// building needs: ordered row-id scans and committed row reads.
pub trait MvPartitionStorage: Send + Sync {
    /// Up to `limit` row ids `>= start`, ascending.
    fn row_ids_from(&self, start: RowId, limit: usize) -> Vec<RowId>;

    fn read(&self, row_id: RowId) -> Option<Vec<u8>>;

    fn insert(&self, row_id: RowId, row: Vec<u8>);

    fn row_count(&self) -> usize;
}

#[derive(Debug, Default)]
struct IndexState {
    next_row_id_to_build: Option<RowId>,
    entries: BTreeMap<RowId, Vec<u8>>,
}

#[derive(Debug)]
pub struct InMemoryIndexStorage {
    state: RwLock<IndexState>,
}

impl InMemoryIndexStorage {
    /// A freshly created index that still has every row ahead of it.
    pub fn unbuilt() -> Self {
        Self::with_cursor(Some(RowId::LOWEST))
    }

    pub fn built() -> Self {
        Self::with_cursor(None)
    }

    pub fn with_cursor(next_row_id_to_build: Option<RowId>) -> Self {
        Self {
            state: RwLock::new(IndexState {
                next_row_id_to_build,
                entries: BTreeMap::new(),
            }),
        }
    }

    pub fn indexed_row_ids(&self) -> Vec<RowId> {
        self.state.read().entries.keys().copied().collect()
    }
}

impl IndexStorage for InMemoryIndexStorage {
    fn next_row_id_to_build(&self) -> Option<RowId> {
        self.state.read().next_row_id_to_build
    }

    fn set_next_row_id_to_build(&self, row_id: Option<RowId>) {
        self.state.write().next_row_id_to_build = row_id;
    }

    fn put(&self, row_id: RowId, row: Vec<u8>) {
        self.state.write().entries.insert(row_id, row);
    }

    fn get(&self, row_id: RowId) -> Option<Vec<u8>> {
        self.state.read().entries.get(&row_id).cloned()
    }

    fn len(&self) -> usize {
        self.state.read().entries.len()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPartitionStorage {
    rows: RwLock<BTreeMap<RowId, Vec<u8>>>,
}

impl InMemoryPartitionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-filled with rows `0..count`, each row being its id in big-endian bytes.
    pub fn with_rows(count: u64) -> Self {
        let rows = (0..count)
            .map(|id| (RowId(id), id.to_be_bytes().to_vec()))
            .collect();
        Self {
            rows: RwLock::new(rows),
        }
    }
}

impl MvPartitionStorage for InMemoryPartitionStorage {
    fn row_ids_from(&self, start: RowId, limit: usize) -> Vec<RowId> {
        self.rows
            .read()
            .range((Bound::Included(start), Bound::Unbounded))
            .take(limit)
            .map(|(row_id, _)| *row_id)
            .collect()
    }

    fn read(&self, row_id: RowId) -> Option<Vec<u8>> {
        self.rows.read().get(&row_id).cloned()
    }

    fn insert(&self, row_id: RowId, row: Vec<u8>) {
        self.rows.write().insert(row_id, row);
    }

    fn row_count(&self) -> usize {
        self.rows.read().len()
    }
}

//! Lease-gated index building.
//!
//! One task per (table, partition, index) streams not-yet-indexed row ids from
//! the local partition storage to the partition's primary in bounded batches.
//! Each batch carries the enlistment consistency token the caller got with its
//! lease, so a batch sent under a lost lease is rejected by the replication
//! group instead of being applied twice.

pub mod events;
mod task;
#[cfg(test)]
mod tests;

use crate::busy_lock::BusyLock;
use crate::config::PartTxConfig;
use crate::error::PartTxError;
use crate::event::ListenerList;
use crate::replica::ReplicaService;
use crate::storage::{IndexStorage, MvPartitionStorage};
use crate::tx::partition::ClusterNode;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use task::{BuildContext, IndexBuildTask, TaskEnd};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub use events::{DropIndexEvent, PrimaryReplicaExpiredEvent};

/// Row ids per build batch.
pub const BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexBuildTaskId {
    pub table_id: i32,
    pub partition_id: i32,
    pub index_id: i32,
}

impl IndexBuildTaskId {
    pub fn new(table_id: i32, partition_id: i32, index_id: i32) -> Self {
        Self {
            table_id,
            partition_id,
            index_id,
        }
    }
}

impl fmt::Display for IndexBuildTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_part_{}/idx_{}",
            self.table_id, self.partition_id, self.index_id
        )
    }
}

/// Notified when a build task ends on its own. Tasks ended by a stop call are
/// not reported.
pub trait IndexBuildCompletionListener: Send + Sync {
    fn on_build_completion(&self, _task_id: IndexBuildTaskId) {}

    fn on_build_failure(&self, _task_id: IndexBuildTaskId, _error: &PartTxError) {}
}

struct IndexBuilderInner {
    node_name: String,
    runtime: Handle,
    ctx: BuildContext,
    shutdown_grace: Duration,
    tasks: DashMap<IndexBuildTaskId, Arc<IndexBuildTask>>,
    listeners: ListenerList<dyn IndexBuildCompletionListener>,
    busy: BusyLock,
    closed: AtomicBool,
}

impl IndexBuilderInner {
    fn on_task_end(&self, task: &Arc<IndexBuildTask>, result: Result<TaskEnd, PartTxError>) {
        // A stopped task may have been replaced by a newer one under the same id.
        self.tasks
            .remove_if(&task.id, |_, registered| Arc::ptr_eq(registered, task));

        match result {
            Ok(TaskEnd::Completed) => {
                info!(node = %self.node_name, task = %task.id, "index build completed");
                for listener in self.listeners.snapshot().iter() {
                    listener.on_build_completion(task.id);
                }
            }
            Ok(TaskEnd::Stopped) => {
                debug!(node = %self.node_name, task = %task.id, "index build stopped");
            }
            Err(e) if task.is_stopped() => {
                debug!(
                    node = %self.node_name,
                    task = %task.id,
                    error = %e,
                    "stopped index build ended with error"
                );
            }
            Err(e) => {
                warn!(node = %self.node_name, task = %task.id, error = %e, "index build failed");
                for listener in self.listeners.snapshot().iter() {
                    listener.on_build_failure(task.id, &e);
                }
            }
        }
    }
}

/// Runs index build tasks on the tokio runtime it was created on. At most
/// `index_build_threads` batches are in flight at once across all tasks.
#[derive(Clone)]
pub struct IndexBuilder {
    inner: Arc<IndexBuilderInner>,
}

impl IndexBuilder {
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &PartTxConfig,
        replica: Arc<dyn ReplicaService>,
    ) -> Result<Self, PartTxError> {
        let runtime = Handle::try_current().map_err(|e| PartTxError::Unavailable {
            message: format!("index builder needs a tokio runtime: {e}"),
        })?;
        Ok(Self {
            inner: Arc::new(IndexBuilderInner {
                node_name: config.node_name.clone(),
                runtime,
                ctx: BuildContext {
                    replica,
                    batch_permits: Arc::new(Semaphore::new(config.index_build_threads)),
                    batch_size: config.index_build_batch_size.clamp(1, BATCH_SIZE),
                    batch_timeout: config.build_index_timeout(),
                },
                shutdown_grace: config.index_build_shutdown_grace(),
                tasks: DashMap::new(),
                listeners: ListenerList::new(),
                busy: BusyLock::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Starts building the index on `node`, the partition's current primary.
    ///
    /// Returns `false` without doing anything when the index has no rows left
    /// to build or a task for the same id is already running.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_build_index(
        &self,
        table_id: i32,
        partition_id: i32,
        index_id: i32,
        index_storage: Arc<dyn IndexStorage>,
        partition_storage: Arc<dyn MvPartitionStorage>,
        node: ClusterNode,
        enlistment_consistency_token: u64,
    ) -> Result<bool, PartTxError> {
        let _guard = self.inner.busy.enter().ok_or(PartTxError::NodeStopping)?;

        if index_storage.next_row_id_to_build().is_none() {
            return Ok(false);
        }

        let task_id = IndexBuildTaskId::new(table_id, partition_id, index_id);
        let task = Arc::new(IndexBuildTask::new(
            task_id,
            index_storage,
            partition_storage,
            node,
            enlistment_consistency_token,
        ));
        match self.inner.tasks.entry(task_id) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&task));
            }
        }

        info!(
            node = %self.inner.node_name,
            task = %task_id,
            token = enlistment_consistency_token,
            "index build scheduled"
        );
        let inner = Arc::clone(&self.inner);
        let running = Arc::clone(&task);
        let handle = self.inner.runtime.spawn(async move {
            let result = running.run(&inner.ctx).await;
            inner.on_task_end(&running, result);
        });
        task.set_handle(handle);
        Ok(true)
    }

    /// Stops one task. Its id can be scheduled again right away.
    pub fn stop_build_index(&self, table_id: i32, partition_id: i32, index_id: i32) {
        if self.is_closed() {
            return;
        }
        let task_id = IndexBuildTaskId::new(table_id, partition_id, index_id);
        if let Some((_, task)) = self.inner.tasks.remove(&task_id) {
            task.stop(true);
            debug!(node = %self.inner.node_name, task = %task_id, "index build stop requested");
        }
    }

    /// Stops every task of a partition, e.g. when its primary lease is lost.
    pub fn stop_building_indexes(&self, table_id: i32, partition_id: i32) {
        self.stop_matching(|id| id.table_id == table_id && id.partition_id == partition_id);
    }

    /// Stops the tasks of a dropped index across all partitions.
    pub fn stop_building_indexes_for_index(&self, index_id: i32) {
        self.stop_matching(|id| id.index_id == index_id);
    }

    /// Stops the tasks of a dropped table.
    pub fn stop_building_table_indexes(&self, table_id: i32) {
        self.stop_matching(|id| id.table_id == table_id);
    }

    fn stop_matching(&self, matches: impl Fn(&IndexBuildTaskId) -> bool) {
        if self.is_closed() {
            return;
        }
        self.inner.tasks.retain(|id, task| {
            if matches(id) {
                task.stop(true);
                false
            } else {
                true
            }
        });
    }

    pub fn is_building(&self, task_id: IndexBuildTaskId) -> bool {
        self.inner.tasks.contains_key(&task_id)
    }

    pub fn active_tasks(&self) -> Vec<IndexBuildTaskId> {
        let mut ids: Vec<IndexBuildTaskId> = self.inner.tasks.iter().map(|t| *t.key()).collect();
        ids.sort();
        ids
    }

    pub fn listen(&self, listener: Arc<dyn IndexBuildCompletionListener>) {
        self.inner.listeners.add(listener);
    }

    pub fn stop_listen(&self, listener: &Arc<dyn IndexBuildCompletionListener>) -> bool {
        self.inner.listeners.remove(listener)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Refuses new schedules, lets in-flight batches finish within the grace
    /// period and aborts whatever is still running after it. Repeated calls
    /// are no-ops.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.busy.block().await;

        let tasks: Vec<Arc<IndexBuildTask>> = self
            .inner
            .tasks
            .iter()
            .map(|t| Arc::clone(t.value()))
            .collect();
        self.inner.tasks.clear();
        for task in &tasks {
            task.stop(false);
        }

        let deadline = tokio::time::Instant::now() + self.inner.shutdown_grace;
        let mut aborted = 0usize;
        for task in &tasks {
            let Some(handle) = task.take_handle() else {
                continue;
            };
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                abort.abort();
                aborted += 1;
            }
        }
        self.inner.ctx.batch_permits.close();

        if aborted > 0 {
            warn!(
                node = %self.inner.node_name,
                aborted,
                grace_ms = self.inner.shutdown_grace.as_millis() as u64,
                "index build tasks aborted after shutdown grace period"
            );
        }
        info!(node = %self.inner.node_name, tasks = tasks.len(), "index builder closed");
    }
}

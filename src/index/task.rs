use super::IndexBuildTaskId;
use crate::error::PartTxError;
use crate::replica::ReplicaService;
use crate::replica::messages::BuildIndexRequest;
use crate::storage::{IndexStorage, MvPartitionStorage, RowId};
use crate::tx::partition::ClusterNode;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskEnd {
    /// Every row up to the end of the partition is indexed.
    Completed,
    Stopped,
}

/// Shared by every task of one builder.
pub(crate) struct BuildContext {
    pub replica: Arc<dyn ReplicaService>,
    pub batch_permits: Arc<Semaphore>,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

pub(crate) struct IndexBuildTask {
    pub id: IndexBuildTaskId,
    index_storage: Arc<dyn IndexStorage>,
    partition_storage: Arc<dyn MvPartitionStorage>,
    node: ClusterNode,
    enlistment_consistency_token: u64,
    stopped: AtomicBool,
    abandon: Notify,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IndexBuildTask {
    pub fn new(
        id: IndexBuildTaskId,
        index_storage: Arc<dyn IndexStorage>,
        partition_storage: Arc<dyn MvPartitionStorage>,
        node: ClusterNode,
        enlistment_consistency_token: u64,
    ) -> Self {
        Self {
            id,
            index_storage,
            partition_storage,
            node,
            enlistment_consistency_token,
            stopped: AtomicBool::new(false),
            abandon: Notify::new(),
            handle: Mutex::new(None),
        }
    }

    /// No batch starts after this. With `abandon` the in-flight batch is
    /// dropped as well; otherwise it is allowed to complete.
    pub fn stop(&self, abandon: bool) {
        self.stopped.store(true, Ordering::Release);
        if abandon {
            self.abandon.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn set_handle(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    pub fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().take()
    }

    /// Sends batches strictly one after another: the next batch's rows are
    /// read only after the previous batch's command was applied.
    pub async fn run(&self, ctx: &BuildContext) -> Result<TaskEnd, PartTxError> {
        let Some(mut cursor) = self.index_storage.next_row_id_to_build() else {
            return Ok(TaskEnd::Completed);
        };

        loop {
            if self.is_stopped() {
                return Ok(TaskEnd::Stopped);
            }

            let row_ids = self.partition_storage.row_ids_from(cursor, ctx.batch_size);
            let finish = row_ids.len() < ctx.batch_size;
            let next_cursor = row_ids.last().copied().and_then(RowId::increment);
            let batch_len = row_ids.len();
            let request = BuildIndexRequest {
                table_id: self.id.table_id,
                partition_id: self.id.partition_id,
                index_id: self.id.index_id,
                row_ids,
                finish,
                enlistment_consistency_token: self.enlistment_consistency_token,
            };

            let _permit = Arc::clone(&ctx.batch_permits)
                .acquire_owned()
                .await
                .map_err(|_| PartTxError::NodeStopping)?;
            if self.is_stopped() {
                return Ok(TaskEnd::Stopped);
            }
            debug!(
                task = %self.id,
                node = %self.node,
                from = %cursor,
                rows = batch_len,
                finish,
                "sending index build batch"
            );

            let send = tokio::time::timeout(
                ctx.batch_timeout,
                ctx.replica.build_index(&self.node, request),
            );
            tokio::select! {
                biased;
                _ = self.abandon.notified() => return Ok(TaskEnd::Stopped),
                sent = send => match sent {
                    Ok(result) => result?,
                    Err(_) => return Err(PartTxError::Timeout),
                },
            }

            match next_cursor {
                Some(next) if !finish => cursor = next,
                _ => return Ok(TaskEnd::Completed),
            }
        }
    }
}

use super::*;
use crate::error::PartTxErrorCode;
use crate::hlc::HybridClockImpl;
use crate::replica::messages::{BuildIndexRequest, FinishOutcome, FinishRequest};
use crate::replica::{LocalReplicaService, ReplicaGroup};
use crate::storage::{InMemoryIndexStorage, InMemoryPartitionStorage, RowId};
use crate::tx::partition::TablePartitionId;
use async_trait::async_trait;
use parking_lot::Mutex;

const TABLE: i32 = 1;
const PART: i32 = 0;
const INDEX: i32 = 10;

/// Forwards to a local replication group and keeps every batch it saw.
struct RecordingReplica {
    local: LocalReplicaService,
    batches: Mutex<Vec<BuildIndexRequest>>,
}

impl RecordingReplica {
    fn batches(&self) -> Vec<BuildIndexRequest> {
        self.batches.lock().clone()
    }
}

#[async_trait]
impl ReplicaService for RecordingReplica {
    async fn finish(
        &self,
        recipient: &ClusterNode,
        request: FinishRequest,
    ) -> Result<FinishOutcome, PartTxError> {
        self.local.finish(recipient, request).await
    }

    async fn build_index(
        &self,
        recipient: &ClusterNode,
        request: BuildIndexRequest,
    ) -> Result<(), PartTxError> {
        self.batches.lock().push(request.clone());
        self.local.build_index(recipient, request).await
    }
}

/// Holds every batch until the test hands out a permit.
struct GatedReplica {
    sent: Mutex<Vec<BuildIndexRequest>>,
    gate: Semaphore,
}

impl GatedReplica {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
        })
    }

    fn sent(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl ReplicaService for GatedReplica {
    async fn finish(
        &self,
        _recipient: &ClusterNode,
        _request: FinishRequest,
    ) -> Result<FinishOutcome, PartTxError> {
        Err(PartTxError::Unavailable {
            message: "finish not routed in this test".into(),
        })
    }

    async fn build_index(
        &self,
        _recipient: &ClusterNode,
        request: BuildIndexRequest,
    ) -> Result<(), PartTxError> {
        self.sent.lock().push(request);
        let permit = self.gate.acquire().await.map_err(|_| PartTxError::NodeStopping)?;
        permit.forget();
        Ok(())
    }
}

#[derive(Default)]
struct RecordingListener {
    completed: Mutex<Vec<IndexBuildTaskId>>,
    failed: Mutex<Vec<(IndexBuildTaskId, PartTxErrorCode)>>,
}

impl IndexBuildCompletionListener for RecordingListener {
    fn on_build_completion(&self, task_id: IndexBuildTaskId) {
        self.completed.lock().push(task_id);
    }

    fn on_build_failure(&self, task_id: IndexBuildTaskId, error: &PartTxError) {
        self.failed.lock().push((task_id, error.code()));
    }
}

struct Partition {
    replica: Arc<RecordingReplica>,
    group: Arc<ReplicaGroup>,
    index: Arc<InMemoryIndexStorage>,
    rows: Arc<InMemoryPartitionStorage>,
    primary: ClusterNode,
}

fn partition(rows: u64, term: u64) -> Partition {
    let primary = ClusterNode::named("primary");
    let rows = Arc::new(InMemoryPartitionStorage::with_rows(rows));
    let index = Arc::new(InMemoryIndexStorage::unbuilt());
    let group = Arc::new(ReplicaGroup::new(
        TablePartitionId::new(TABLE, PART),
        Arc::new(HybridClockImpl::new()),
        rows.clone(),
        term,
    ));
    group.register_index(INDEX, index.clone());
    let local = LocalReplicaService::new();
    local.add_group(&primary, Arc::clone(&group));
    Partition {
        replica: Arc::new(RecordingReplica {
            local,
            batches: Mutex::new(Vec::new()),
        }),
        group,
        index,
        rows,
        primary,
    }
}

fn builder(replica: Arc<dyn ReplicaService>) -> IndexBuilder {
    IndexBuilder::new(&PartTxConfig::development(), replica).expect("builder")
}

fn task_id() -> IndexBuildTaskId {
    IndexBuildTaskId::new(TABLE, PART, INDEX)
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn schedule(builder: &IndexBuilder, p: &Partition, token: u64) -> Result<bool, PartTxError> {
    builder.schedule_build_index(
        TABLE,
        PART,
        INDEX,
        p.index.clone(),
        p.rows.clone(),
        p.primary.clone(),
        token,
    )
}

#[tokio::test]
async fn builds_in_gap_free_batches_until_exhausted() {
    let p = partition(250, 1);
    let builder = builder(p.replica.clone());
    let listener = Arc::new(RecordingListener::default());
    builder.listen(listener.clone());

    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("completion", || !listener.completed.lock().is_empty()).await;

    let batches = p.replica.batches();
    let sizes: Vec<usize> = batches.iter().map(|b| b.row_ids.len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(
        batches.iter().map(|b| b.finish).collect::<Vec<_>>(),
        vec![false, false, true]
    );
    let all: Vec<u64> = batches
        .iter()
        .flat_map(|b| b.row_ids.iter().map(|r| r.0))
        .collect();
    assert_eq!(all, (0..250).collect::<Vec<u64>>());

    assert_eq!(p.index.next_row_id_to_build(), None);
    assert_eq!(p.index.len(), 250);
    assert_eq!(*listener.completed.lock(), vec![task_id()]);
    wait_until("task removal", || !builder.is_building(task_id())).await;
}

#[tokio::test]
async fn exact_multiple_of_batch_size_ends_with_empty_batch() {
    let p = partition(200, 1);
    let builder = builder(p.replica.clone());
    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("index built", || p.index.next_row_id_to_build().is_none()).await;

    let batches = p.replica.batches();
    assert_eq!(batches.len(), 3);
    assert!(batches[2].row_ids.is_empty());
    assert!(batches[2].finish);
}

#[tokio::test]
async fn batches_never_exceed_batch_size() {
    let p = partition(1_000, 1);
    let mut config = PartTxConfig::development();
    config.index_build_batch_size = 500;
    let builder = IndexBuilder::new(&config, p.replica.clone()).expect("builder");
    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("index built", || p.index.next_row_id_to_build().is_none()).await;

    let batches = p.replica.batches();
    assert_eq!(batches.len(), 11);
    assert!(batches.iter().all(|b| b.row_ids.len() <= BATCH_SIZE));
    assert_eq!(p.index.len(), 1_000);
}

#[tokio::test]
async fn resumes_from_persisted_cursor() {
    let p = partition(150, 1);
    p.index.set_next_row_id_to_build(Some(RowId(120)));
    let builder = builder(p.replica.clone());
    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("index built", || p.index.next_row_id_to_build().is_none()).await;

    let batches = p.replica.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].row_ids.first(), Some(&RowId(120)));
    assert_eq!(batches[0].row_ids.len(), 30);
}

#[tokio::test]
async fn rescheduling_a_built_index_is_a_no_op() {
    let p = partition(10, 1);
    let builder = builder(p.replica.clone());
    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("index built", || p.index.next_row_id_to_build().is_none()).await;
    wait_until("task removal", || builder.active_tasks().is_empty()).await;
    let sent = p.replica.batches().len();

    assert!(!schedule(&builder, &p, 1).expect("reschedule"));
    assert!(builder.active_tasks().is_empty());
    assert_eq!(p.replica.batches().len(), sent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schedules_register_one_task() {
    let p = Arc::new(partition(500, 1));
    let gated = GatedReplica::new();
    let builder = builder(gated.clone());

    let mut set = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let builder = builder.clone();
        let p = Arc::clone(&p);
        set.spawn(async move { schedule(&builder, &p, 1).expect("schedule") });
    }
    let mut scheduled = 0;
    while let Some(joined) = set.join_next().await {
        if joined.expect("join") {
            scheduled += 1;
        }
    }
    assert_eq!(scheduled, 1);
    assert_eq!(builder.active_tasks(), vec![task_id()]);

    wait_until("first batch", || gated.sent() == 1).await;
    builder.stop_build_index(TABLE, PART, INDEX);
}

#[tokio::test]
async fn stop_during_batch_prevents_further_batches() {
    let p = partition(500, 1);
    let gated = GatedReplica::new();
    let builder = builder(gated.clone());

    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("first batch in flight", || gated.sent() == 1).await;

    builder.stop_build_index(TABLE, PART, INDEX);
    assert!(!builder.is_building(task_id()));

    // Id is free again right away.
    assert!(schedule(&builder, &p, 2).expect("reschedule"));
    wait_until("replacement batch", || gated.sent() == 2).await;

    gated.gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The replacement got the permit and moved on; the stopped task sent nothing more.
    let sent = gated.sent.lock().clone();
    assert_eq!(sent.len(), 3);
    assert_eq!(
        sent.iter().filter(|b| b.enlistment_consistency_token == 1).count(),
        1
    );
    assert!(builder.is_building(task_id()));
    builder.stop_building_indexes(TABLE, PART);
    assert!(builder.active_tasks().is_empty());
}

#[tokio::test]
async fn stale_token_fails_the_task() {
    let p = partition(300, 1);
    p.group.renew_lease();
    let builder = builder(p.replica.clone());
    let listener = Arc::new(RecordingListener::default());
    builder.listen(listener.clone());

    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("failure", || !listener.failed.lock().is_empty()).await;

    assert_eq!(
        *listener.failed.lock(),
        vec![(task_id(), PartTxErrorCode::StaleFencingToken)]
    );
    assert!(listener.completed.lock().is_empty());
    assert_eq!(p.replica.batches().len(), 1);
    assert_eq!(p.index.next_row_id_to_build(), Some(RowId::LOWEST));
    wait_until("task removal", || !builder.is_building(task_id())).await;

    // A fresh schedule with the current token finishes the job.
    assert!(schedule(&builder, &p, p.group.lease_term()).expect("reschedule"));
    wait_until("completion", || !listener.completed.lock().is_empty()).await;
    assert_eq!(p.index.len(), 300);
}

#[tokio::test]
async fn stopped_tasks_are_not_reported() {
    let p = partition(500, 1);
    let gated = GatedReplica::new();
    let builder = builder(gated.clone());
    let listener = Arc::new(RecordingListener::default());
    let as_dyn: Arc<dyn IndexBuildCompletionListener> = listener.clone();
    builder.listen(Arc::clone(&as_dyn));

    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("batch", || gated.sent() == 1).await;
    builder.stop_building_table_indexes(TABLE);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(listener.completed.lock().is_empty());
    assert!(listener.failed.lock().is_empty());
    assert!(builder.stop_listen(&as_dyn));
    assert!(!builder.stop_listen(&as_dyn));
}

#[tokio::test]
async fn stop_variants_select_matching_tasks() {
    let gated = GatedReplica::new();
    let builder = builder(gated.clone());
    let rows = Arc::new(InMemoryPartitionStorage::with_rows(10));
    let node = ClusterNode::named("primary");
    for (table, part, index) in [(1, 0, 10), (1, 1, 10), (1, 0, 11), (2, 0, 20)] {
        builder
            .schedule_build_index(
                table,
                part,
                index,
                Arc::new(InMemoryIndexStorage::unbuilt()),
                rows.clone(),
                node.clone(),
                1,
            )
            .expect("schedule");
    }
    assert_eq!(builder.active_tasks().len(), 4);

    builder.stop_building_indexes_for_index(10);
    assert_eq!(
        builder.active_tasks(),
        vec![IndexBuildTaskId::new(1, 0, 11), IndexBuildTaskId::new(2, 0, 20)]
    );
    builder.stop_building_indexes(1, 0);
    assert_eq!(builder.active_tasks(), vec![IndexBuildTaskId::new(2, 0, 20)]);
    builder.stop_building_table_indexes(2);
    assert!(builder.active_tasks().is_empty());
}

#[tokio::test]
async fn close_drains_in_flight_batch_and_is_idempotent() {
    let p = partition(500, 1);
    let gated = GatedReplica::new();
    let builder = builder(gated.clone());
    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("batch", || gated.sent() == 1).await;

    let closing = {
        let builder = builder.clone();
        tokio::spawn(async move { builder.close().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!closing.is_finished());
    gated.gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(2), closing)
        .await
        .expect("close finishes after the batch")
        .expect("join");

    assert_eq!(gated.sent(), 1);
    assert!(builder.is_closed());
    let err = schedule(&builder, &p, 1).expect_err("schedule after close");
    assert!(err.is_node_stopping());
    builder.stop_build_index(TABLE, PART, INDEX);
    builder.stop_building_table_indexes(TABLE);
    builder.close().await;
}

#[tokio::test]
async fn close_aborts_batches_past_grace_period() {
    let p = partition(500, 1);
    let gated = GatedReplica::new();
    let mut config = PartTxConfig::development();
    config.index_build_shutdown_grace_ms = 30;
    let builder = IndexBuilder::new(&config, gated.clone()).expect("builder");
    assert!(schedule(&builder, &p, 1).expect("schedule"));
    wait_until("batch", || gated.sent() == 1).await;

    tokio::time::timeout(Duration::from_secs(2), builder.close())
        .await
        .expect("close bounded by grace period");
    assert!(builder.active_tasks().is_empty());
}

#[test]
fn builder_requires_a_runtime() {
    let err = IndexBuilder::new(&PartTxConfig::development(), GatedReplica::new())
        .err()
        .expect("no runtime");
    assert_eq!(err.code(), PartTxErrorCode::Unavailable);
}

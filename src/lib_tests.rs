use super::{OperationalMetrics, PartTxNode};
use crate::config::PartTxConfig;
use crate::error::PartTxErrorCode;
use crate::hlc::HybridTimestampTracker;
use crate::index::{DropIndexEvent, IndexBuildTaskId, PrimaryReplicaExpiredEvent};
use crate::replica::{LocalReplicaService, ReplicaGroup};
use crate::storage::{InMemoryIndexStorage, InMemoryPartitionStorage};
use crate::tx::{InternalTransaction, NodeAndTerm, TablePartitionId, TxState};
use std::sync::Arc;

fn node_with_group(term: u64) -> (PartTxNode, Arc<ReplicaGroup>) {
    let replica = Arc::new(LocalReplicaService::new());
    let node = PartTxNode::start(
        PartTxConfig::development().with_node_name("n1"),
        replica.clone(),
    )
    .expect("start");
    let group = Arc::new(ReplicaGroup::new(
        TablePartitionId::new(1, 0),
        Arc::clone(node.clock()),
        Arc::new(InMemoryPartitionStorage::with_rows(1_000)),
        term,
    ));
    replica.add_group(node.local_node(), Arc::clone(&group));
    (node, group)
}

#[tokio::test]
async fn start_rejects_invalid_config() {
    let mut config = PartTxConfig::development();
    config.index_build_batch_size = 0;
    let err = PartTxNode::start(config, Arc::new(LocalReplicaService::new()))
        .err()
        .expect("invalid config");
    assert_eq!(err.code(), PartTxErrorCode::InvalidConfig);
}

#[tokio::test]
async fn commit_through_local_group_records_decision() {
    let (node, group) = node_with_group(4);
    let tracker = Arc::new(HybridTimestampTracker::new());
    let tx = node.begin(Arc::clone(&tracker)).expect("begin");
    let partition = TablePartitionId::new(1, 0);
    tx.enlist(partition, NodeAndTerm::new(node.local_node().clone(), 4))
        .expect("enlist");
    assert!(tx.assign_commit_partition(partition));

    let outcome = tx.commit().await.expect("commit");
    let recorded = group.tx_state(tx.id()).expect("decision recorded");
    assert_eq!(recorded.outcome, outcome.outcome);
    assert_eq!(Some(recorded.timestamp), outcome.timestamp);
    assert_eq!(tracker.get(), outcome.timestamp);
    assert_eq!(tx.state(), TxState::Committed);

    let metrics = node.operational_metrics();
    assert_eq!(
        metrics,
        OperationalMetrics {
            transactions_started: 1,
            transactions_committed: 1,
            transactions_aborted: 0,
            finish_failures: 0,
            active_transactions: 0,
            held_lock_keys: 0,
            active_index_builds: 0,
        }
    );
}

#[tokio::test]
async fn lease_and_catalog_events_stop_builds() {
    let (node, group) = node_with_group(1);
    let schedule = |index_id: i32| {
        let index = Arc::new(InMemoryIndexStorage::unbuilt());
        group.register_index(index_id, index.clone());
        node.index_builder()
            .schedule_build_index(
                1,
                0,
                index_id,
                index,
                Arc::clone(group.partition_storage()),
                node.local_node().clone(),
                group.lease_term(),
            )
            .expect("schedule")
    };
    assert!(schedule(7));
    assert!(schedule(8));

    node.on_index_dropped(DropIndexEvent {
        table_id: 1,
        index_id: 7,
    });
    assert!(!node.index_builder().is_building(IndexBuildTaskId::new(1, 0, 7)));

    node.on_primary_replica_expired(PrimaryReplicaExpiredEvent {
        group_id: TablePartitionId::new(1, 0),
        term: 1,
    });
    assert!(node.index_builder().active_tasks().is_empty());

    node.on_table_dropped(1);
    node.shutdown().await;
    node.shutdown().await;
    let err = node
        .begin(Arc::new(HybridTimestampTracker::new()))
        .err()
        .expect("stopped");
    assert!(err.is_node_stopping());
}

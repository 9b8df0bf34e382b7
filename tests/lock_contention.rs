use parttx::PartTxNode;
use parttx::config::PartTxConfig;
use parttx::error::PartTxErrorCode;
use parttx::hlc::HybridTimestampTracker;
use parttx::lock::{LockKey, LockMode};
use parttx::replica::{LocalReplicaService, ReplicaGroup};
use parttx::storage::InMemoryPartitionStorage;
use parttx::tx::{InternalTransaction, NodeAndTerm, ReadWriteTransaction, TablePartitionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;

fn node() -> Arc<PartTxNode> {
    let service = Arc::new(LocalReplicaService::new());
    let node = PartTxNode::start(
        PartTxConfig::development().with_node_name("n1"),
        service.clone(),
    )
    .expect("start");
    let group = Arc::new(ReplicaGroup::new(
        TablePartitionId::new(1, 0),
        Arc::clone(node.clock()),
        Arc::new(InMemoryPartitionStorage::new()),
        1,
    ));
    service.add_group(node.local_node(), group);
    Arc::new(node)
}

fn begin_enlisted(node: &PartTxNode) -> ReadWriteTransaction {
    let tx = node
        .begin(Arc::new(HybridTimestampTracker::new()))
        .expect("begin");
    let partition = TablePartitionId::new(1, 0);
    tx.enlist(partition, NodeAndTerm::new(node.local_node().clone(), 1))
        .expect("enlist");
    assert!(tx.assign_commit_partition(partition));
    tx
}

fn hot_key() -> LockKey {
    LockKey::new(1, b"account-1".to_vec())
}

/// Every transaction reads the hot counter under an exclusive lock and writes
/// it back. Conflicting transactions abort and retry; no increment is lost.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hot_key_increments_are_serialized() {
    let node = node();
    let counter = Arc::new(AtomicU64::new(0));
    let mut set = JoinSet::new();

    for _ in 0..32 {
        let node = Arc::clone(&node);
        let counter = Arc::clone(&counter);
        set.spawn(async move {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                let tx = begin_enlisted(&node);
                match tx.lock(hot_key(), LockMode::Exclusive).await {
                    Ok(_) => {
                        let seen = counter.load(Ordering::Acquire);
                        tokio::task::yield_now().await;
                        counter.store(seen + 1, Ordering::Release);
                        tx.commit().await.expect("commit");
                        return attempts;
                    }
                    Err(e) => {
                        assert!(e.is_retryable(), "unexpected error {e}");
                        tx.rollback().await.expect("rollback");
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        assert!(joined.expect("join") >= 1);
    }
    assert_eq!(counter.load(Ordering::Acquire), 32);
    assert!(node.lock_manager().is_empty());
    assert_eq!(node.tx_manager().pending(), 0);
}

#[tokio::test]
async fn commit_releases_locks_for_older_waiter() {
    let node = node();
    let older = begin_enlisted(&node);
    let younger = begin_enlisted(&node);
    assert!(older.id() < younger.id());

    younger
        .lock(hot_key(), LockMode::Exclusive)
        .await
        .expect("younger takes the key first");

    let err = begin_enlisted(&node)
        .lock(hot_key(), LockMode::Shared)
        .await
        .expect_err("youngest dies");
    assert_eq!(err.code(), PartTxErrorCode::LockConflict);

    let older = Arc::new(older);
    let waiter = {
        let older = Arc::clone(&older);
        tokio::spawn(async move { older.lock(hot_key(), LockMode::Shared).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    younger.commit().await.expect("commit younger");
    let lock = waiter.await.expect("join").expect("older granted");
    assert_eq!(lock.tx_id, older.id());
    older.commit().await.expect("commit older");
    assert!(node.lock_manager().is_empty());
}

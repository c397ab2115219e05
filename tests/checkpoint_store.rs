//! Durable checkpoint store behaviour over SQLite.

mod support;

use uuid::Uuid;

use ragloom::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};

use support::harness;

fn blob(step: i64) -> String {
    serde_json::json!({ "step": step, "payload": "state" }).to_string()
}

#[tokio::test]
async fn save_load_save_is_a_fixed_point_on_the_blob() {
    let h = harness().await;
    let store = ragloom::checkpoint::SqliteCheckpointStore::new(h.pool.clone());
    let thread = format!("thread-{}", Uuid::new_v4().simple());

    store
        .save(Checkpoint::new(thread.clone(), 0, blob(0)))
        .await
        .unwrap();
    let loaded = store.load_latest(&thread).await.unwrap().unwrap();
    assert_eq!(loaded.state_blob, blob(0));

    // Re-saving the loaded blob at the next step preserves it bit-for-bit.
    store
        .save(Checkpoint::new(thread.clone(), 1, loaded.state_blob.clone()))
        .await
        .unwrap();
    let reloaded = store.load_latest(&thread).await.unwrap().unwrap();
    assert_eq!(reloaded.state_blob, blob(0));
    assert_eq!(reloaded.step, 1);
}

#[tokio::test]
async fn step_collisions_surface_concurrent_update() {
    let h = harness().await;
    let store = ragloom::checkpoint::SqliteCheckpointStore::new(h.pool.clone());
    let thread = format!("thread-{}", Uuid::new_v4().simple());

    store
        .save(Checkpoint::new(thread.clone(), 4, blob(4)))
        .await
        .unwrap();
    let err = store
        .save(Checkpoint::new(thread.clone(), 4, blob(99)))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::ConcurrentUpdate { step: 4, .. }));

    // The loser's write changed nothing.
    let latest = store.load_latest(&thread).await.unwrap().unwrap();
    assert_eq!(latest.state_blob, blob(4));
}

#[tokio::test]
async fn history_lists_in_step_order_and_truncates_for_branching() {
    let h = harness().await;
    let store = ragloom::checkpoint::SqliteCheckpointStore::new(h.pool.clone());
    let thread = format!("thread-{}", Uuid::new_v4().simple());

    for step in 0..6 {
        store
            .save(Checkpoint::new(thread.clone(), step, blob(step)))
            .await
            .unwrap();
    }

    let history = store.list(&thread).await.unwrap();
    assert_eq!(history.len(), 6);
    for (i, checkpoint) in history.iter().enumerate() {
        assert_eq!(checkpoint.step, i as i64);
    }

    let removed = store.truncate_after(&thread, 2).await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(store.load_latest(&thread).await.unwrap().unwrap().step, 2);

    // The truncated range is writable again.
    store
        .save(Checkpoint::new(thread.clone(), 3, blob(30)))
        .await
        .unwrap();
    assert_eq!(
        store.load_latest(&thread).await.unwrap().unwrap().state_blob,
        blob(30)
    );
}

#[tokio::test]
async fn threads_are_independent() {
    let h = harness().await;
    let store = ragloom::checkpoint::SqliteCheckpointStore::new(h.pool.clone());
    let thread_a = format!("thread-{}", Uuid::new_v4().simple());
    let thread_b = format!("thread-{}", Uuid::new_v4().simple());

    store
        .save(Checkpoint::new(thread_a.clone(), 0, blob(0)))
        .await
        .unwrap();
    // Same step number on another thread is not a collision.
    store
        .save(Checkpoint::new(thread_b.clone(), 0, blob(100)))
        .await
        .unwrap();

    assert_eq!(store.list(&thread_a).await.unwrap().len(), 1);
    assert_eq!(store.list(&thread_b).await.unwrap().len(), 1);
}

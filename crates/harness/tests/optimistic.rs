use std::time::Duration;

use blocksync_core::{BlockDraft, BlockId, BlockKind, Placement, Value};
use blocksync_engine::{MutationState, RemoteError, SyncError, SyncNotice};
use blocksync_harness::{init_tracing, Call, TestPeer};
use tokio::sync::broadcast;

fn drain(rx: &mut broadcast::Receiver<SyncNotice>) -> Vec<SyncNotice> {
    let mut seen = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        seen.push(notice);
    }
    seen
}

// ============================================================================
// Confirmed path
// ============================================================================

#[tokio::test]
async fn create_confirms_against_remote() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;

    let id = peer.create_text("hello").await?;

    let cached = peer.get(id).ok_or("block missing from cache")?;
    assert_eq!(cached.content, Value::Text("hello".into()));
    assert_eq!(peer.remote.block(id), Some(cached));
    assert_eq!(peer.engine.pending_count(), 0);
    assert_eq!(peer.engine.queued_count()?, 0);
    Ok(())
}

#[tokio::test]
async fn optimistic_entry_is_visible_before_remote_answers() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    peer.remote.set_latency(Some(Duration::from_millis(100)));

    let (created, remote_len_when_seen) = tokio::join!(peer.create_text("fast"), async {
        peer.wait_until(|blocks| blocks.len() == 1)
            .await
            .map(|_| peer.remote.len())
    });

    created?;
    assert_eq!(remote_len_when_seen, Some(0));
    assert_eq!(peer.remote.len(), 1);
    Ok(())
}

#[tokio::test]
async fn update_merges_patch_and_advances_updated_at() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let id = peer.create_text("draft").await?;
    let before = peer.get(id).ok_or("missing")?;

    let state = peer.set_content(id, "final").await?;
    assert_eq!(state, MutationState::Confirmed);

    let after = peer.get(id).ok_or("missing")?;
    assert_eq!(after.content, Value::Text("final".into()));
    assert!(after.updated_at > before.updated_at);
    assert_eq!(after.position, before.position);
    Ok(())
}

#[tokio::test]
async fn placement_between_neighbours() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let first = peer.create_text("one").await?;
    let third = peer.create_text("three").await?;

    let second = peer
        .engine
        .create_block(
            peer.scope,
            BlockDraft::new(BlockKind::Text).content("two"),
            Placement::After(first),
        )
        .await?;

    assert_eq!(peer.ids(), vec![first, second, third]);
    Ok(())
}

#[tokio::test]
async fn server_assigned_id_replaces_client_id() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    peer.remote.rewrite_ids(true);
    let mut notices = peer.engine.notices();

    let id = peer.create_text("renamed").await?;

    assert_eq!(peer.ids(), vec![id]);
    assert!(peer.remote.block(id).is_some());
    let redirected = drain(&mut notices)
        .into_iter()
        .any(|n| matches!(n, SyncNotice::Redirected { to, .. } if to == id));
    assert!(redirected);
    Ok(())
}

#[tokio::test]
async fn update_during_in_flight_create_follows_server_id() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    peer.remote.rewrite_ids(true);
    peer.remote.set_latency(Some(Duration::from_millis(50)));
    let mut notices = peer.engine.notices();

    let (created, edited) = tokio::join!(peer.create_text("v1"), async {
        let snapshot = peer.wait_until(|blocks| blocks.len() == 1).await?;
        let client_id = snapshot.blocks[0].id;
        Some((client_id, peer.set_content(client_id, "v2").await))
    });
    let server_id = created?;
    let (client_id, edited) = edited.ok_or("create never applied")?;

    assert_eq!(edited?, MutationState::Confirmed);
    assert_ne!(server_id, client_id);
    assert_eq!(
        peer.remote.write_calls(),
        vec![Call::Insert(client_id), Call::Update(server_id)]
    );
    let stored = peer.remote.block(server_id).ok_or("missing remotely")?;
    assert_eq!(stored.content, Value::Text("v2".into()));
    let cached = peer.get(server_id).ok_or("missing from cache")?;
    assert_eq!(cached.content, Value::Text("v2".into()));
    assert!(!drain(&mut notices)
        .iter()
        .any(|n| matches!(n, SyncNotice::NotFound { .. })));
    Ok(())
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test]
async fn rejected_create_restores_snapshot() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    peer.create_text("a").await?;
    peer.create_text("b").await?;
    let before = peer.read();
    let mut notices = peer.engine.notices();

    peer.remote.fail_next(RemoteError::Validation("title required".into()));
    let err = peer.create_text("c").await.err().ok_or("create should fail")?;

    assert!(matches!(err.remote(), Some(RemoteError::Validation(_))));
    assert_eq!(peer.read(), before);
    assert_eq!(peer.engine.status().tracked_errors, 1);
    assert!(drain(&mut notices)
        .iter()
        .any(|n| matches!(n, SyncNotice::RolledBack { .. })));
    Ok(())
}

#[tokio::test]
async fn rejected_update_restores_exact_block() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let id = peer.create_text("original").await?;
    let before = peer.read();

    peer.remote.fail_next(RemoteError::Permission("read-only page".into()));
    let err = peer.set_content(id, "vandalized").await.err().ok_or("update should fail")?;

    assert!(matches!(err.remote(), Some(RemoteError::Permission(_))));
    assert_eq!(peer.read(), before);
    let tracked = peer.engine.tracker().get(id).ok_or("error not tracked")?;
    assert_eq!(tracked.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn rollback_keeps_concurrent_create() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    peer.remote.set_latency(Some(Duration::from_millis(50)));
    peer.remote.fail_next(RemoteError::Validation("rejected".into()));

    let mut rx = peer.engine.subscribe(peer.scope)?;
    let watcher = tokio::spawn(async move {
        let mut seen: Vec<Vec<BlockId>> = Vec::new();
        while rx.changed().await.is_ok() {
            seen.push(rx.borrow_and_update().blocks.iter().map(|b| b.id).collect());
        }
        seen
    });

    let (doomed, survivor) = tokio::join!(peer.create_text("doomed"), async {
        peer.wait_until(|blocks| blocks.len() == 1).await;
        peer.create_text("survivor").await
    });
    assert!(matches!(doomed, Err(ref err) if matches!(err.remote(), Some(RemoteError::Validation(_)))));
    let survivor = survivor?;

    assert_eq!(peer.ids(), vec![survivor]);
    assert_eq!(peer.remote.len(), 1);
    assert!(peer.remote.block(survivor).is_some());

    peer.engine.close(peer.scope);
    let seen = watcher.await?;
    let first = seen
        .iter()
        .position(|ids| ids.contains(&survivor))
        .ok_or("survivor never shown")?;
    assert!(seen[first..].iter().all(|ids| ids.contains(&survivor)));
    Ok(())
}

#[tokio::test]
async fn online_network_error_rolls_back_without_queueing() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let id = peer.create_text("keep").await?;
    let before = peer.read();

    peer.remote.fail_next(RemoteError::Network("connection reset".into()));
    assert!(peer.delete(id).await.is_err());

    assert_eq!(peer.read(), before);
    assert_eq!(peer.engine.queued_count()?, 0);
    assert_eq!(peer.engine.pending_count(), 0);
    Ok(())
}

#[tokio::test]
async fn timeout_counts_as_failure() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    peer.remote.set_latency(Some(Duration::from_millis(700)));

    let err = peer.create_text("slow").await.err().ok_or("create should time out")?;

    assert!(matches!(err.remote(), Some(RemoteError::Timeout(_))));
    assert!(peer.read().is_empty());
    assert!(peer.remote.is_empty());
    Ok(())
}

#[tokio::test]
async fn retry_all_clears_tracked_errors() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let id = peer.create_text("x").await?;
    peer.remote.fail_next(RemoteError::Constraint("locked".into()));
    assert!(peer.set_content(id, "y").await.is_err());
    peer.engine.report_error(BlockId::new(), "render failed")?;
    assert_eq!(peer.engine.status().tracked_errors, 2);

    peer.engine.retry_all().await?;

    assert_eq!(peer.engine.status().tracked_errors, 0);
    assert_eq!(peer.ids(), vec![id]);
    Ok(())
}

// ============================================================================
// Not-found and idempotent delete
// ============================================================================

#[tokio::test]
async fn update_of_remotely_deleted_block_is_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let id = peer.create_text("doomed").await?;
    // Cut the feed so the cache still holds the block.
    peer.remote.disconnect_subscribers();
    peer.remote.foreign_delete(id)?;
    let mut notices = peer.engine.notices();

    let state = peer.set_content(id, "too late").await?;

    assert_eq!(state, MutationState::Confirmed);
    assert!(peer.get(id).is_none());
    assert!(peer.engine.tracker().get(id).is_none());
    let seen = drain(&mut notices);
    assert!(seen.contains(&SyncNotice::NotFound { block_id: id }));
    assert!(!seen.iter().any(|n| matches!(n, SyncNotice::RolledBack { .. })));
    Ok(())
}

#[tokio::test]
async fn delete_twice_never_fails() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let id = peer.create_text("gone").await?;

    assert_eq!(peer.delete(id).await?, MutationState::Confirmed);
    assert_eq!(peer.delete(id).await?, MutationState::Confirmed);

    assert!(peer.read().is_empty());
    assert!(peer.remote.block(id).is_none());
    Ok(())
}

#[tokio::test]
async fn delete_of_uncached_block_still_reaches_remote() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let stranger = BlockId::new();

    peer.delete(stranger).await?;

    assert!(peer.remote.write_calls().contains(&Call::Delete(stranger)));
    Ok(())
}

// ============================================================================
// Local-only kinds
// ============================================================================

#[tokio::test]
async fn placeholder_blocks_fail_fast() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;

    let result = peer
        .engine
        .create_block(peer.scope, BlockDraft::new(BlockKind::Placeholder), Placement::End)
        .await;

    assert!(matches!(result, Err(SyncError::UnsupportedKind { kind: "placeholder", .. })));
    assert!(peer.read().is_empty());
    assert!(peer.remote.write_calls().is_empty());
    Ok(())
}

use blocksync_core::{ActorId, Block, BlockId, BlockKind, BlockPatch, Scope, Value};
use blocksync_engine::{ListenerStatus, RemoteError, SyncNotice};
use blocksync_harness::{init_tracing, TestNetwork, TestPeer};

fn foreign_block(scope: Scope, position: f64, text: &str) -> Block {
    let mut block = Block::new(BlockId::new(), scope, BlockKind::Text, position, ActorId::new(), 1);
    block.content = text.into();
    block
}

// ============================================================================
// Folding remote events
// ============================================================================

#[tokio::test]
async fn other_clients_inserts_show_up() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer().await?;
    let bob = net.add_peer().await?;

    let id = net.peer(alice).create_text("from alice").await?;

    net.peer(bob)
        .wait_until(|blocks| blocks.iter().any(|b| b.id == id))
        .await
        .ok_or("bob never saw alice's block")?;
    assert_eq!(net.peer(bob).ids(), vec![id]);
    Ok(())
}

#[tokio::test]
async fn updates_and_deletes_propagate() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer().await?;
    let bob = net.add_peer().await?;
    let id = net.peer(alice).create_text("v1").await?;
    net.peer(bob)
        .wait_until(|blocks| blocks.len() == 1)
        .await
        .ok_or("insert never arrived")?;

    net.peer(alice).set_content(id, "v2").await?;
    net.peer(bob)
        .wait_until(|blocks| blocks.first().is_some_and(|b| b.content == Value::Text("v2".into())))
        .await
        .ok_or("update never arrived")?;

    net.peer(alice).delete(id).await?;
    net.peer(bob)
        .wait_until(|blocks| blocks.is_empty())
        .await
        .ok_or("delete never arrived")?;
    Ok(())
}

#[tokio::test]
async fn events_outside_scope_are_ignored() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let elsewhere = Scope::new(peer.scope.workspace_id, Some(BlockId::new()));

    let stray = peer.remote.foreign_insert(foreign_block(elsewhere, 1.0, "stray"))?;
    let marker = peer.remote.foreign_insert(foreign_block(peer.scope, 1.0, "marker"))?;

    peer.wait_until(|blocks| blocks.iter().any(|b| b.id == marker.id))
        .await
        .ok_or("marker never arrived")?;
    assert!(peer.get(stray.id).is_none());
    assert_eq!(peer.ids(), vec![marker.id]);
    Ok(())
}

#[tokio::test]
async fn block_moved_away_leaves_scope() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let id = peer.create_text("mover").await?;

    peer.remote.foreign_update(id, &BlockPatch::new().move_to(Some(BlockId::new())))?;

    peer.wait_until(|blocks| blocks.is_empty())
        .await
        .ok_or("moved block still cached")?;
    Ok(())
}

#[tokio::test]
async fn pending_local_edit_is_not_clobbered() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer().await?;
    let bob = net.add_peer().await?;
    let id = net.peer(alice).create_text("shared").await?;
    net.peer(bob)
        .wait_until(|blocks| blocks.len() == 1)
        .await
        .ok_or("insert never arrived")?;

    net.peer(alice).engine.set_online(false).await?;
    net.peer(alice).set_content(id, "alice offline").await?;
    net.peer(bob).set_content(id, "bob online").await?;
    let marker = net.peer(bob).create_text("marker").await?;

    // The marker is behind bob's update on alice's feed.
    net.peer(alice)
        .wait_until(|blocks| blocks.iter().any(|b| b.id == marker))
        .await
        .ok_or("marker never arrived")?;
    let mine = net.peer(alice).get(id).ok_or("block vanished")?;
    assert_eq!(mine.content, Value::Text("alice offline".into()));

    net.peer(alice).engine.set_online(true).await?;
    assert_eq!(
        net.remote.block(id).ok_or("missing remotely")?.content,
        Value::Text("alice offline".into())
    );
    Ok(())
}

// ============================================================================
// Convergence
// ============================================================================

#[tokio::test]
async fn peers_converge_on_authoritative_state() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut net = TestNetwork::new();
    let alice = net.add_peer().await?;
    let bob = net.add_peer().await?;

    let shared = net.peer(alice).create_text("shared").await?;
    net.peer(alice).engine.set_online(false).await?;
    net.peer(alice).create_text("alice offline").await?;
    net.peer(alice).set_content(shared, "alice edit").await?;
    net.peer(bob).create_text("bob online").await?;
    net.peer(bob).delete(shared).await?;

    net.peer(alice).engine.set_online(true).await?;
    net.peer(bob).engine.reconcile(net.scope).await?;

    let truth = net.authoritative();
    assert_eq!(net.peer(alice).read(), truth);
    assert_eq!(net.peer(bob).read(), truth);
    assert!(truth.iter().all(|b| b.id != shared));
    assert_eq!(truth.len(), 2);
    Ok(())
}

// ============================================================================
// Listener health
// ============================================================================

#[tokio::test]
async fn dropped_feed_degrades_but_mutations_still_work() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    let mut notices = peer.engine.notices();
    peer.remote.fail_subscribe(RemoteError::Network("feed down".into()));

    peer.remote.disconnect_subscribers();
    peer.wait_listener(ListenerStatus::is_degraded)
        .await
        .ok_or("listener never degraded")?;
    assert_eq!(peer.engine.status().listeners_degraded, vec![peer.scope]);

    let id = peer.create_text("still works").await?;
    assert_eq!(peer.ids(), vec![id]);

    peer.remote.heal();
    peer.engine.reconnect_listener(peer.scope)?;
    peer.wait_listener(|s| *s == ListenerStatus::Connected)
        .await
        .ok_or("listener never recovered")?;
    assert!(peer.engine.status().listeners_degraded.is_empty());

    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        seen.push(notice);
    }
    assert!(seen.iter().any(|n| matches!(n, SyncNotice::ListenerDegraded { .. })));
    assert!(seen.contains(&SyncNotice::ListenerRecovered { scope: peer.scope }));
    Ok(())
}

#[tokio::test]
async fn coming_online_reconnects_degraded_listeners() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;
    peer.engine.set_online(false).await?;
    peer.remote.disconnect_subscribers();
    peer.wait_listener(ListenerStatus::is_degraded)
        .await
        .ok_or("listener never degraded")?;

    peer.engine.set_online(true).await?;

    peer.wait_listener(|s| *s == ListenerStatus::Connected)
        .await
        .ok_or("listener never reconnected")?;
    assert_eq!(peer.remote.subscriber_count(), 1);
    Ok(())
}

#[tokio::test]
async fn closed_scope_stops_listening() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let peer = TestPeer::new().await?;

    peer.engine.close(peer.scope);

    assert_eq!(peer.engine.listener_status(peer.scope), None);
    assert!(peer.engine.subscribe(peer.scope).is_err());
    peer.remote.foreign_insert(foreign_block(peer.scope, 1.0, "unseen"))?;
    assert!(peer.read().is_empty());
    Ok(())
}

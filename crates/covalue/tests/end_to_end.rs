//! End-to-end tests: several nodes talking through in-process channels.

use std::time::Duration;

use covalue::core::{CoId, NewContent};
use covalue::perms::CoValueArena;
use covalue::sync::channel::memory::memory_channel;
use covalue::sync::{PeerId, PeerRole};
use covalue::{LocalNode, NodeConfig, NodeError, Role};
use covalue_testkit::{identity, init_tracing, TestFixture};
use serde_json::json;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Relay through a server
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reader_loads_map_and_group_through_server() -> anyhow::Result<()> {
    init_tracing();
    let server = TestFixture::with_seed([10; 32]);
    let alice = TestFixture::with_seed([11; 32]);
    let bob = TestFixture::with_seed([12; 32]);

    let _alice_link = alice.node.connect_to(&server.node)?;
    let group = alice.node.create_group()?;
    alice.node.add_member(&group, &bob.member(), Role::Reader)?;
    let map = alice.node.create_map(&group, None)?;
    alice.node.set(&map, "title", json!("hello"))?;
    alice.node.wait_for_sync(&group, WAIT).await?;
    alice.node.wait_for_sync(&map, WAIT).await?;

    let _bob_link = bob.node.connect_to(&server.node)?;
    bob.node.load(&map).await?;

    let view = bob.node.read_map(&map)?;
    assert_eq!(view.get("title"), Some(&json!("hello")));
    assert_eq!(view.skipped(), 0);
    assert_eq!(bob.node.role_of(&group, bob.agent_id())?, Some(Role::Reader));
    Ok(())
}

#[tokio::test]
async fn test_later_writes_reach_a_subscribed_reader() -> anyhow::Result<()> {
    let server = TestFixture::with_seed([13; 32]);
    let alice = TestFixture::with_seed([14; 32]);
    let bob = TestFixture::with_seed([15; 32]);

    let _alice_link = alice.node.connect_to(&server.node)?;
    let _bob_link = bob.node.connect_to(&server.node)?;
    let group = alice.node.create_group()?;
    alice.node.add_member(&group, &bob.member(), Role::Writer)?;
    let map = alice.node.create_map(&group, None)?;
    alice.node.set(&map, "n", json!(1))?;
    alice.node.wait_for_sync(&map, WAIT).await?;
    bob.node.load(&map).await?;

    bob.node.set(&map, "n", json!(2))?;
    bob.node.wait_for_sync(&map, WAIT).await?;

    let deadline = Instant::now() + WAIT;
    while alice.node.read_map(&map)?.get("n") != Some(&json!(2)) {
        assert!(Instant::now() < deadline, "write never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::test]
async fn test_non_member_load_is_unauthorized() -> anyhow::Result<()> {
    let server = TestFixture::with_seed([16; 32]);
    let alice = TestFixture::with_seed([17; 32]);
    let eve = TestFixture::with_seed([18; 32]);

    let _alice_link = alice.node.connect_to(&server.node)?;
    let group = alice.node.create_group()?;
    let map = alice.node.create_map(&group, None)?;
    alice.node.set(&map, "secret", json!("x"))?;
    alice.node.wait_for_sync(&map, WAIT).await?;

    let _eve_link = eve.node.connect_to(&server.node)?;
    let err = eve.node.load(&map).await.unwrap_err();
    assert!(matches!(err, NodeError::Unauthorized(id) if id == map));
    Ok(())
}

#[tokio::test]
async fn test_deleted_map_loads_as_deleted() -> anyhow::Result<()> {
    let server = TestFixture::with_seed([19; 32]);
    let alice = TestFixture::with_seed([20; 32]);
    let bob = TestFixture::with_seed([21; 32]);

    let _alice_link = alice.node.connect_to(&server.node)?;
    let group = alice.node.create_group()?;
    alice.node.add_member(&group, &bob.member(), Role::Reader)?;
    let map = alice.node.create_map(&group, None)?;
    alice.node.set(&map, "k", json!(true))?;
    alice.node.delete(&map)?;
    alice.node.wait_for_sync(&map, WAIT).await?;

    let _bob_link = bob.node.connect_to(&server.node)?;
    let err = bob.node.load(&map).await.unwrap_err();
    assert!(matches!(err, NodeError::Deleted(_)));
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

/// Per piece: (session, after, transaction count) of every span.
fn piece_layout(pieces: &[NewContent]) -> Vec<Vec<(String, u32, usize)>> {
    pieces
        .iter()
        .map(|piece| {
            piece
                .new
                .iter()
                .map(|(session, span)| {
                    (
                        session.as_str().to_string(),
                        span.after,
                        span.new_transactions.len(),
                    )
                })
                .collect()
        })
        .collect()
}

#[tokio::test]
async fn test_restart_replays_chunked_map_from_disk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("node.db");
    let config = NodeConfig::default().with_max_recommended_tx_size(512);
    let seed = [30; 32];

    let (map, before, known, layout) = {
        let node = LocalNode::open(identity(seed), &path, config.clone())?;
        let group = node.create_group()?;
        let map = node.create_map(&group, Some(json!({"name": "notes"})))?;
        for i in 0..20 {
            node.set(&map, &format!("k{i}"), json!("x".repeat(100)))?;
        }
        node.remove_key(&map, "k3")?;
        let before = node.read_map(&map)?;
        let known = node.sync().with_registry(|r| r.known_state(&map))?;
        let pieces = node
            .sync()
            .with_registry(|r| r.get(&map).and_then(|core| core.new_content_since(None)))?
            .unwrap_or_default();
        node.shutdown().await?;
        (map, before, known, piece_layout(&pieces))
    };
    assert!(layout.len() > 1);

    let node = LocalNode::open(identity(seed), &path, config)?;
    let nothing_loaded = |_: &CoId| false;
    let stored: Vec<NewContent> = node
        .sync()
        .storage()
        .expect("node opened with storage")
        .load_co_value(&map, &nothing_loaded)
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|piece| piece.id == map)
        .collect();
    assert_eq!(piece_layout(&stored), layout);

    node.load(&map).await?;
    let after = node.read_map(&map)?;
    assert_eq!(after.to_json(), before.to_json());
    assert_eq!(after.len(), 19);
    assert_eq!(node.sync().with_registry(|r| r.known_state(&map))?, known);

    let replayed = node
        .sync()
        .with_registry(|r| r.get(&map).and_then(|core| core.new_content_since(None)))?
        .unwrap_or_default();
    assert_eq!(piece_layout(&replayed), layout);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_silent_server_times_out_the_load() -> anyhow::Result<()> {
    let mut config = NodeConfig::default();
    config.sync.load_queue.timeout = Duration::from_secs(30);
    config.sync.load_timeout = Duration::from_secs(60);
    let fixture = TestFixture::with_config([40; 32], config);

    let (channel, _inbox) = memory_channel(true);
    fixture
        .node
        .sync()
        .add_peer(PeerId::new("silent"), PeerRole::Server, channel)?;

    let start = Instant::now();
    let missing = CoId::new_unchecked("co_zmissing");
    let err = fixture.node.load(&missing).await.unwrap_err();
    let waited = start.elapsed();

    assert!(matches!(err, NodeError::Unavailable(_)));
    assert!(waited >= Duration::from_secs(30));
    assert!(waited < Duration::from_secs(60));
    Ok(())
}

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::time::{sleep, Duration};

use super::{fast_config, wait_for, RecordingDiagnostics};
use crate::diagnostics::Diagnostic;
use crate::engine::local::LocalEngine;
use crate::exchange::{ExchangeInterface, MemoryExchange};
use crate::http::{self, HttpExchange};
use crate::poller;
use crate::relay::Relay;
use crate::session::SpaceSessionManager;

fn manager_on<Net: ExchangeInterface + 'static>(peer: &str, network: Arc<Net>) -> SpaceSessionManager {
    SpaceSessionManager::new(Arc::new(LocalEngine::new(peer, network)), fast_config())
}

fn memory_network() -> (Arc<MemoryExchange>, Arc<Relay>) {
    let exchange = Arc::new(MemoryExchange::new());
    let relay = Arc::new(Relay::new("relay-1", "test-net"));
    exchange.connect(relay.clone());
    (exchange, relay)
}

async fn serve(relay: Arc<Relay>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, http::router(relay)).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_operation_reaches_other_replica_once() {
    let (exchange, relay) = memory_network();
    let alice = manager_on("alice", exchange.clone());
    let bob = manager_on("bob", exchange.clone());

    let space = alice.create_space().await.unwrap();
    assert!(relay.descriptor(&space).is_some());
    bob.join_space(&space).await.unwrap();

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let sink = seen.clone();
    bob.register_callback(&space, Arc::new(move |p: &[u8]| sink.lock().unwrap().push(p.to_vec())))
        .unwrap();

    alice.start_listening(&space).unwrap();
    bob.start_listening(&space).unwrap();
    alice
        .submit_operation(&space, r#"{"move":4,"player":"O"}"#)
        .unwrap();

    let payload = wait_for(|| bob.retrieve_next(&space).unwrap()).await;
    assert_eq!(payload.as_deref(), Some(br#"{"move":4,"player":"O"}"#.as_slice()));

    // The writer sees its own operation too
    assert!(wait_for(|| alice.retrieve_next(&space).unwrap()).await.is_some());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(bob.retrieve_next(&space).unwrap(), None);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_both_replicas_converge() {
    let (exchange, _relay) = memory_network();
    let alice = manager_on("alice", exchange.clone());
    let bob = manager_on("bob", exchange.clone());

    let space = alice.create_space().await.unwrap();
    bob.join_space(&space).await.unwrap();
    alice.start_listening(&space).unwrap();
    bob.start_listening(&space).unwrap();

    for i in 0..3 {
        alice.submit_operation(&space, format!(r#"{{"a":{i}}}"#)).unwrap();
        bob.submit_operation(&space, format!(r#"{{"b":{i}}}"#)).unwrap();
    }

    for manager in [&alice, &bob] {
        let mut received = Vec::new();
        while received.len() < 6 {
            match wait_for(|| manager.retrieve_next(&space).unwrap()).await {
                Some(payload) => received.push(payload),
                None => panic!("only {} of 6 operations arrived", received.len()),
            }
        }
        received.sort();
        received.dedup();
        assert_eq!(received.len(), 6);
    }
}

#[tokio::test]
async fn test_status_tracks_peers_and_last_sync() {
    let (exchange, _relay) = memory_network();
    let alice = manager_on("alice", exchange.clone());
    let space = alice.create_space().await.unwrap();

    let status = alice.status().unwrap();
    assert_eq!(status.space_id, space);
    assert_eq!(status.last_sync_millis, 0);

    let handle = alice.handle(&space).unwrap();
    let settings = alice.poller_settings();
    poller::run_cycle(&handle, &settings).await;
    let synced = alice.status().unwrap();
    assert_eq!(synced.peer_count, 1);
    assert!(synced.last_sync_millis > 0);

    exchange.set_offline("relay-1", true);
    poller::run_cycle(&handle, &settings).await;
    let offline = alice.status().unwrap();
    assert_eq!(offline.peer_count, 0);
    assert_eq!(offline.last_sync_millis, synced.last_sync_millis);
}

#[tokio::test]
async fn test_failed_sync_is_reported_not_fatal() {
    let (exchange, relay) = memory_network();
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let alice = manager_on("alice", exchange.clone()).with_diagnostics(diagnostics.clone());
    let space = alice.create_space().await.unwrap();

    // A second relay that never heard of the space
    exchange.connect(Arc::new(Relay::new("relay-2", "test-net")));
    let handle = alice.handle(&space).unwrap();
    poller::run_cycle(&handle, &alice.poller_settings()).await;

    assert_eq!(
        diagnostics.count(|d| matches!(d, Diagnostic::PeerSyncFailed { peer, .. } if peer == "relay-2")),
        1
    );
    let status = alice.status().unwrap();
    assert_eq!(status.peer_count, 2);
    assert!(status.last_sync_millis > 0);
    assert!(relay.descriptor(&space).is_some());
}

#[tokio::test]
async fn test_persisted_space_reopens_offline() {
    let dir = tempfile::tempdir().unwrap();
    let (exchange, _relay) = memory_network();
    let manager = SpaceSessionManager::new(
        Arc::new(LocalEngine::with_storage("alice", exchange, dir.path())),
        fast_config(),
    );
    let space = manager.create_space().await.unwrap();
    manager.submit_operation(&space, r#"{"saved":true}"#).unwrap();
    manager.close_space(&space).unwrap();
    drop(manager);

    // No relays at all: the descriptor and log come from disk
    let offline = Arc::new(MemoryExchange::new());
    let diagnostics = RecordingDiagnostics::default();
    let manager = SpaceSessionManager::new(
        Arc::new(LocalEngine::with_storage("alice", offline, dir.path())),
        fast_config(),
    );
    manager.join_space(&space).await.unwrap();
    let handle = manager.handle(&space).unwrap();
    assert_eq!(poller::scan(&handle, &diagnostics), 1);
    assert_eq!(
        manager.retrieve_next(&space).unwrap(),
        Some(br#"{"saved":true}"#.to_vec())
    );
    assert!(diagnostics.events().is_empty());
}

#[tokio::test]
async fn test_close_releases_store_and_rejoin_reopens_it() {
    let dir = tempfile::tempdir().unwrap();
    let (exchange, _relay) = memory_network();
    let engine = Arc::new(LocalEngine::with_storage("alice", exchange, dir.path()));
    let manager = SpaceSessionManager::new(engine.clone(), fast_config());

    let mut spaces = Vec::new();
    for i in 0..3 {
        let space = manager.create_space().await.unwrap();
        manager.submit_operation(&space, format!(r#"{{"n":{i}}}"#)).unwrap();
        spaces.push(space);
    }
    assert_eq!(engine.open_spaces(), 3);

    for space in &spaces {
        manager.close_space(space).unwrap();
    }
    assert!(manager.space_ids().is_empty());
    assert_eq!(engine.open_spaces(), 0);

    // Reopened from disk by the same engine
    let diagnostics = RecordingDiagnostics::default();
    manager.join_space(&spaces[1]).await.unwrap();
    assert_eq!(engine.open_spaces(), 1);
    let handle = manager.handle(&spaces[1]).unwrap();
    assert_eq!(poller::scan(&handle, &diagnostics), 1);
    assert_eq!(
        manager.retrieve_next(&spaces[1]).unwrap(),
        Some(br#"{"n":1}"#.to_vec())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_relay_round_trip() {
    let relay = Arc::new(Relay::new("relay-http", "test-net"));
    let addr = serve(relay.clone()).await;
    let endpoint = format!("http://{addr}");

    let alice = manager_on(
        "alice",
        Arc::new(HttpExchange::new("test-net", vec![endpoint.clone()]).unwrap()),
    );
    let bob = manager_on(
        "bob",
        Arc::new(HttpExchange::new("test-net", vec![endpoint]).unwrap()),
    );

    let space = alice.create_space().await.unwrap();
    assert!(relay.descriptor(&space).is_some());
    bob.join_space(&space).await.unwrap();
    alice.start_listening(&space).unwrap();
    bob.start_listening(&space).unwrap();

    alice.submit_operation(&space, r#"{"over":"http"}"#).unwrap();
    let payload = wait_for(|| bob.retrieve_next(&space).unwrap()).await;
    assert_eq!(payload.as_deref(), Some(br#"{"over":"http"}"#.as_slice()));
    assert!(bob.status().unwrap().last_sync_millis > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_relay_on_other_network_is_ignored() {
    let relay = Arc::new(Relay::new("relay-http", "other-net"));
    let addr = serve(relay.clone()).await;

    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let exchange = HttpExchange::new("test-net", vec![format!("http://{addr}")]).unwrap();
    let manager = manager_on("alice", Arc::new(exchange)).with_diagnostics(diagnostics.clone());

    let space = manager.create_space().await.unwrap();
    assert!(relay.descriptor(&space).is_none());
    assert_eq!(
        diagnostics.count(|d| matches!(d, Diagnostic::InitialPushFailed { .. })),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_refuses_mismatched_network_header() {
    let relay = Arc::new(Relay::new("relay-http", "test-net"));
    let addr = serve(relay).await;
    let client = reqwest::Client::new();

    let refused = client
        .get(format!("http://{addr}/info"))
        .header(http::NETWORK_HEADER, "other-net")
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), reqwest::StatusCode::CONFLICT);

    let debug = client
        .get(format!("http://{addr}/debug/spaces"))
        .header(http::NETWORK_HEADER, "other-net")
        .send()
        .await
        .unwrap();
    assert_eq!(debug.status(), reqwest::StatusCode::CONFLICT);

    let missing = client
        .get(format!("http://{addr}/spaces/unknown"))
        .header(http::NETWORK_HEADER, "test-net")
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

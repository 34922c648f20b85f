use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::{sleep, Duration};

use super::{fast_config, garbled_space, wait_for, RecordingDiagnostics, GARBLED};
use crate::config::Config;
use crate::diagnostics::Diagnostic;
use crate::engine::local::LocalEngine;
use crate::engine::loopback::LoopbackEngine;
use crate::error::SpaceError;
use crate::exchange::MemoryExchange;
use crate::peer_sync::SyncPolicy;
use crate::poller;
use crate::relay::Relay;
use crate::session::SpaceSessionManager;
use crate::space::{Lifecycle, OpenedBy, Space};
use crate::store::SpaceStore;
use crate::types::PeerId;

fn loopback_manager(config: Config) -> (SpaceSessionManager, Arc<RecordingDiagnostics>) {
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let manager = SpaceSessionManager::new(Arc::new(LoopbackEngine::new("me")), config)
        .with_diagnostics(diagnostics.clone());
    (manager, diagnostics)
}

/// Run one scan of a space without a background task
fn scan(manager: &SpaceSessionManager, space_id: &str, diagnostics: &RecordingDiagnostics) -> usize {
    let space = manager.handle(space_id).unwrap();
    poller::scan(&space, diagnostics)
}

#[tokio::test]
async fn test_retrieve_next_on_empty_queue() {
    let (manager, _) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();

    assert!(space.starts_with("loopback-"));
    assert_eq!(manager.retrieve_next(&space).unwrap(), None);
    assert_eq!(manager.backlog(&space).unwrap(), 0);
}

#[tokio::test]
async fn test_submit_then_listen_delivers_exactly_once() {
    let (manager, _) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();

    manager
        .submit_operation(&space, r#"{"move":1,"player":"X"}"#)
        .unwrap();
    manager.start_listening(&space).unwrap();

    let payload = wait_for(|| manager.retrieve_next(&space).unwrap()).await;
    assert_eq!(payload.as_deref(), Some(br#"{"move":1,"player":"X"}"#.as_slice()));

    // Several more cycles bring nothing new
    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.retrieve_next(&space).unwrap(), None);
}

#[tokio::test]
async fn test_malformed_operation_leaves_store_unchanged() {
    let (manager, _) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();
    manager.submit_operation(&space, "[1, 2]").unwrap();
    let handle = manager.handle(&space).unwrap();
    let before = handle.store.value_count();

    for bad in ["{\"move\":", "not json", ""] {
        let err = manager.submit_operation(&space, bad).unwrap_err();
        assert!(matches!(err, SpaceError::MalformedOperation(_)), "{bad:?}: {err}");
    }
    assert_eq!(handle.store.value_count(), before);
}

#[tokio::test]
async fn test_retrievals_follow_insertion_order() {
    let (manager, diagnostics) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();

    for i in 0..5 {
        manager
            .submit_operation(&space, format!(r#"{{"move":{i}}}"#))
            .unwrap();
    }
    assert_eq!(scan(&manager, &space, &diagnostics), 5);
    assert_eq!(manager.backlog(&space).unwrap(), 5);

    for i in 0..5 {
        let payload = manager.retrieve_next(&space).unwrap().unwrap();
        assert_eq!(payload, format!(r#"{{"move":{i}}}"#).into_bytes());
    }
    assert_eq!(manager.retrieve_next(&space).unwrap(), None);
}

#[tokio::test]
async fn test_delivered_fingerprint_is_not_pushed_again() {
    let (manager, diagnostics) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    manager
        .register_callback(
            &space,
            Arc::new(move |_: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    manager.submit_operation(&space, r#"{"a":1}"#).unwrap();
    assert_eq!(scan(&manager, &space, &diagnostics), 1);
    assert_eq!(scan(&manager, &space, &diagnostics), 0);
    assert_eq!(scan(&manager, &space, &diagnostics), 0);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.backlog(&space).unwrap(), 1);
}

#[tokio::test]
async fn test_ledger_reset_redelivers_at_most_once() {
    let config = Config {
        ledger_ceiling: 2,
        ..fast_config()
    };
    let (manager, diagnostics) = loopback_manager(config);
    let space = manager.create_space().await.unwrap();

    for i in 0..5 {
        manager
            .submit_operation(&space, format!(r#"{{"n":{i}}}"#))
            .unwrap();
    }
    assert_eq!(scan(&manager, &space, &diagnostics), 5);
    assert_eq!(
        diagnostics.count(|d| matches!(d, Diagnostic::LedgerReset { .. })),
        1
    );

    // Every fingerprint is delivered at most once more after the reset
    let mut redelivered = 0;
    for _ in 0..3 {
        redelivered += scan(&manager, &space, &diagnostics);
    }
    assert!(redelivered <= 5, "redelivered {redelivered}");

    // New writes after the reset still arrive
    manager.submit_operation(&space, r#"{"n":"late"}"#).unwrap();
    let before = manager.backlog(&space).unwrap();
    assert_eq!(scan(&manager, &space, &diagnostics), 1);
    assert_eq!(manager.backlog(&space).unwrap(), before + 1);
}

#[tokio::test]
async fn test_undecryptable_entries_are_dropped_once() {
    let config = fast_config();
    let diagnostics = RecordingDiagnostics::default();
    let store = SpaceStore::new("garbled", "me");
    let space = Space::new(garbled_space("garbled", store.clone()), OpenedBy::Joining, &config);

    store.write().put("ops/1".to_string(), vec![GARBLED, 1]).unwrap();
    store.write().put("ops/2".to_string(), br#"{"ok":true}"#.to_vec()).unwrap();

    assert_eq!(poller::scan(&space, &diagnostics), 1);
    assert_eq!(poller::scan(&space, &diagnostics), 0);

    // Reported once, never retried
    assert_eq!(
        diagnostics.count(|d| matches!(d, Diagnostic::DecryptFailed { .. })),
        1
    );
    assert_eq!(space.retrieve_next().unwrap(), Some(br#"{"ok":true}"#.to_vec()));
    assert_eq!(space.retrieve_next().unwrap(), None);
}

#[tokio::test]
async fn test_queue_overflow_drops_oldest() {
    let config = Config {
        queue_capacity: Some(2),
        ..fast_config()
    };
    let (manager, diagnostics) = loopback_manager(config);
    let space = manager.create_space().await.unwrap();

    for i in 0..3 {
        manager
            .submit_operation(&space, format!("{i}"))
            .unwrap();
    }
    assert_eq!(scan(&manager, &space, &diagnostics), 3);

    let status = manager.space_status(&space).unwrap();
    assert_eq!(status.queue_depth, 2);
    assert_eq!(status.dropped_events, 1);
    assert_eq!(
        diagnostics.events().last(),
        Some(&Diagnostic::QueueOverflow {
            space_id: space.clone(),
            dropped_total: 1
        })
    );
    assert_eq!(manager.retrieve_next(&space).unwrap(), Some(b"1".to_vec()));
    assert_eq!(manager.retrieve_next(&space).unwrap(), Some(b"2".to_vec()));
}

#[tokio::test]
async fn test_callback_and_queue_are_independent() {
    let (manager, diagnostics) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();
    let first: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let second: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();

    let sink = first.clone();
    manager
        .register_callback(&space, Arc::new(move |p: &[u8]| sink.lock().unwrap().push(p.to_vec())))
        .unwrap();
    manager.submit_operation(&space, "1").unwrap();
    scan(&manager, &space, &diagnostics);

    // Replacing the target leaves the queue alone
    let sink = second.clone();
    manager
        .register_callback(&space, Arc::new(move |p: &[u8]| sink.lock().unwrap().push(p.to_vec())))
        .unwrap();
    manager.submit_operation(&space, "2").unwrap();
    scan(&manager, &space, &diagnostics);

    manager.clear_callback(&space).unwrap();
    manager.submit_operation(&space, "3").unwrap();
    scan(&manager, &space, &diagnostics);

    assert_eq!(*first.lock().unwrap(), vec![b"1".to_vec()]);
    assert_eq!(*second.lock().unwrap(), vec![b"2".to_vec()]);
    assert_eq!(manager.backlog(&space).unwrap(), 3);
}

#[tokio::test]
async fn test_panicking_callback_is_contained() {
    let (manager, diagnostics) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();
    manager
        .register_callback(&space, Arc::new(|_: &[u8]| panic!("host bug")))
        .unwrap();

    manager.submit_operation(&space, "1").unwrap();
    manager.submit_operation(&space, "2").unwrap();
    assert_eq!(scan(&manager, &space, &diagnostics), 2);

    assert_eq!(
        diagnostics.count(|d| matches!(d, Diagnostic::CallbackPanicked { .. })),
        2
    );
    assert_eq!(manager.backlog(&space).unwrap(), 2);
}

#[tokio::test]
async fn test_closed_space_rejects_calls_and_stops_polling() {
    let (manager, _) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();
    manager.start_listening(&space).unwrap();
    let handle = manager.handle(&space).unwrap();
    assert_eq!(handle.status().state, Lifecycle::Running);

    manager.submit_operation(&space, "1").unwrap();
    manager.close_space(&space).unwrap();

    assert!(matches!(
        manager.submit_operation(&space, "2"),
        Err(SpaceError::UnknownSpace(_))
    ));
    assert!(matches!(manager.retrieve_next(&space), Err(SpaceError::UnknownSpace(_))));
    assert!(matches!(manager.close_space(&space), Err(SpaceError::UnknownSpace(_))));
    assert!(manager.status().is_none());

    // A handle that outlived the close sees a closed space
    assert_eq!(handle.status().state, Lifecycle::Closed);
    assert!(matches!(handle.submit(b"3"), Err(SpaceError::Closed(_))));
    assert!(matches!(
        handle.start_listening(|_| unreachable!("closed spaces never poll")),
        Err(SpaceError::Closed(_))
    ));

    // Nothing is queued on a closed space
    sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status().queue_depth, 0);
}

#[tokio::test]
async fn test_start_listening_is_idempotent() {
    let (manager, _) = loopback_manager(fast_config());
    let space = manager.create_space().await.unwrap();
    assert_eq!(
        manager.space_status(&space).unwrap().state,
        Lifecycle::Open(OpenedBy::Creating)
    );

    manager.start_listening(&space).unwrap();
    manager.start_listening(&space).unwrap();
    manager.submit_operation(&space, "7").unwrap();

    assert!(wait_for(|| manager.retrieve_next(&space).unwrap()).await.is_some());
    sleep(Duration::from_millis(60)).await;
    assert_eq!(manager.retrieve_next(&space).unwrap(), None);
    assert!(matches!(
        manager.start_listening("nope"),
        Err(SpaceError::UnknownSpace(_))
    ));
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let (manager, _) = loopback_manager(fast_config());
    manager.join_space("loopback-1").await.unwrap();
    manager.join_space("loopback-1").await.unwrap();

    assert_eq!(manager.space_ids(), vec!["loopback-1".to_string()]);
    assert_eq!(
        manager.space_status("loopback-1").unwrap().state,
        Lifecycle::Open(OpenedBy::Joining)
    );
    assert_eq!(manager.status().unwrap().space_id, "loopback-1");
}

#[tokio::test]
async fn test_join_unknown_space_fails_without_registering() {
    let engine = LocalEngine::new("me", Arc::new(MemoryExchange::new()));
    let manager = SpaceSessionManager::new(Arc::new(engine), fast_config());

    let err = manager.join_space("does-not-exist").await.unwrap_err();
    assert!(matches!(err, SpaceError::Engine(_)));
    assert!(manager.space_ids().is_empty());
}

#[tokio::test]
async fn test_create_without_peers_warns_but_succeeds() {
    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let engine = LocalEngine::new("me", Arc::new(MemoryExchange::new()));
    let manager = SpaceSessionManager::new(Arc::new(engine), fast_config())
        .with_diagnostics(diagnostics.clone());

    let space = manager.create_space().await.unwrap();
    assert_eq!(manager.space_ids(), vec![space.clone()]);
    assert_eq!(
        diagnostics.count(|d| matches!(d, Diagnostic::InitialPushFailed { .. })),
        1
    );
}

#[tokio::test]
async fn test_initial_push_stops_at_first_accepting_peer() {
    let exchange = Arc::new(MemoryExchange::new());
    let first = Arc::new(Relay::new("relay-a", "test-net"));
    let second = Arc::new(Relay::new("relay-b", "test-net"));
    exchange.connect(first.clone());
    exchange.connect(second.clone());

    let diagnostics = Arc::new(RecordingDiagnostics::default());
    let engine = LocalEngine::new("me", exchange);
    let manager = SpaceSessionManager::new(Arc::new(engine), fast_config())
        .with_diagnostics(diagnostics.clone());
    let space = manager.create_space().await.unwrap();

    assert!(first.descriptor(&space).is_some());
    assert!(second.descriptor(&space).is_none());
    assert!(diagnostics.events().is_empty());
}

/// Refuses every peer and remembers what it was told
#[derive(Default)]
struct RefuseAll {
    outcomes: Mutex<Vec<bool>>,
}

impl SyncPolicy for RefuseAll {
    fn should_attempt(&self, _space_id: &str, _peer: &PeerId) -> bool {
        false
    }

    fn record_outcome(&self, _space_id: &str, _peer: &PeerId, succeeded: bool) {
        self.outcomes.lock().unwrap().push(succeeded);
    }
}

#[tokio::test]
async fn test_sync_policy_gates_attempts() {
    let exchange = Arc::new(MemoryExchange::new());
    exchange.connect(Arc::new(Relay::new("relay", "test-net")));
    let policy = Arc::new(RefuseAll::default());
    let engine = LocalEngine::new("me", exchange);
    let manager =
        SpaceSessionManager::new(Arc::new(engine), fast_config()).with_policy(policy.clone());

    let space = manager.create_space().await.unwrap();
    let handle = manager.handle(&space).unwrap();
    poller::run_cycle(&handle, &manager.poller_settings()).await;

    let status = handle.status();
    assert_eq!(status.peer_count, 1);
    assert_eq!(status.last_sync_millis, 0);
    assert!(policy.outcomes.lock().unwrap().is_empty());
}

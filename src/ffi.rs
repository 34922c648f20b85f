//! C call surface for host applications.
//!
//! One process-wide bridge holds the Tokio runtime and the session manager.
//! Strings returned to the host must be released with
//! [`spacesync_free_string`]. No panic crosses this boundary.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::crypto::derive_peer_id;
use crate::engine::local::LocalEngine;
use crate::engine::loopback::LoopbackEngine;
use crate::engine::SyncEngine;
use crate::http::HttpExchange;
use crate::session::SpaceSessionManager;

/// Host callback: `(user_data, payload)`. The payload pointer is only valid
/// for the duration of the call.
pub type HostCallback = extern "C" fn(*mut c_void, *const c_char);

struct Bridge {
    runtime: Runtime,
    manager: SpaceSessionManager,
    node_host: String,
    node_port: u16,
    network_id: String,
}

static BRIDGE: OnceCell<Bridge> = OnceCell::new();

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct BridgeStatus {
    space_id: String,
    peer_count: usize,
    last_sync_millis: i64,
    node_host: String,
    node_port: u16,
    network_id: String,
    connected: bool,
    queue_depth: usize,
    dropped_events: u64,
}

fn guarded<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("Panic caught at the FFI boundary");
        fallback
    })
}

/// Borrow a host string. Null and invalid UTF-8 yield `None`.
unsafe fn host_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn into_host_string(value: impl Into<Vec<u8>>) -> *mut c_char {
    match CString::new(value) {
        Ok(s) => s.into_raw(),
        Err(_) => {
            warn!("Returned string contains an interior NUL, dropping it");
            ptr::null_mut()
        }
    }
}

fn bridge() -> Option<&'static Bridge> {
    let bridge = BRIDGE.get();
    if bridge.is_none() {
        warn!("spacesync is not initialized");
    }
    bridge
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_ansi(false))
        .try_init();
}

fn build_bridge(node_host: &str, node_port: u16, network_id: &str) -> Result<Bridge> {
    let config = Config::from_env()?;
    let peer_id = derive_peer_id(config.identity_seed.as_deref(), config.peer_index);
    let runtime = Runtime::new().context("Failed to create Tokio runtime")?;

    let engine: Arc<dyn SyncEngine> = if config.loopback {
        info!("Using loopback engine");
        Arc::new(LoopbackEngine::new(peer_id))
    } else {
        let endpoint = format!("http://{node_host}:{node_port}");
        let network = Arc::new(HttpExchange::new(network_id, vec![endpoint])?);
        match &config.data_dir {
            Some(root) => Arc::new(LocalEngine::with_storage(peer_id, network, root)),
            None => Arc::new(LocalEngine::new(peer_id, network)),
        }
    };

    Ok(Bridge {
        runtime,
        manager: SpaceSessionManager::new(engine, config),
        node_host: node_host.to_string(),
        node_port,
        network_id: network_id.to_string(),
    })
}

/// Set up the runtime and the session manager. Calling it again after a
/// successful initialization is a no-op returning `true`.
#[no_mangle]
pub extern "C" fn spacesync_initialize(
    node_host: *const c_char,
    node_port: c_int,
    network_id: *const c_char,
) -> bool {
    guarded(false, || {
        init_tracing();
        if BRIDGE.get().is_some() {
            info!("spacesync already initialized");
            return true;
        }
        let (Some(host), Some(network_id)) =
            (unsafe { host_str(node_host) }, unsafe { host_str(network_id) })
        else {
            error!("initialize: host and network id are required");
            return false;
        };
        let Ok(port) = u16::try_from(node_port) else {
            error!("initialize: invalid port {node_port}");
            return false;
        };

        match BRIDGE.get_or_try_init(|| build_bridge(host, port, network_id)) {
            Ok(bridge) => {
                info!(
                    "spacesync initialized as {} against {host}:{port}",
                    bridge.manager.peer_id()
                );
                true
            }
            Err(err) => {
                error!("initialize failed: {err:#}");
                false
            }
        }
    })
}

/// Returns a new space id, or an empty string on failure.
#[no_mangle]
pub extern "C" fn spacesync_create_space() -> *mut c_char {
    let id = guarded(String::new(), || match bridge() {
        Some(bridge) => bridge
            .runtime
            .block_on(bridge.manager.create_space())
            .unwrap_or_else(|err| {
                error!("create space failed: {err}");
                String::new()
            }),
        None => String::new(),
    });
    into_host_string(id)
}

#[no_mangle]
pub extern "C" fn spacesync_join_space(space_id: *const c_char) -> bool {
    guarded(false, || {
        let (Some(bridge), Some(space_id)) = (bridge(), unsafe { host_str(space_id) }) else {
            return false;
        };
        match bridge.runtime.block_on(bridge.manager.join_space(space_id)) {
            Ok(()) => true,
            Err(err) => {
                error!("join {space_id} failed: {err}");
                false
            }
        }
    })
}

/// `false` when the payload is not well-formed JSON or the space is not open.
#[no_mangle]
pub extern "C" fn spacesync_submit_operation(space_id: *const c_char, payload: *const c_char) -> bool {
    guarded(false, || {
        let (Some(bridge), Some(space_id)) = (bridge(), unsafe { host_str(space_id) }) else {
            return false;
        };
        if payload.is_null() {
            return false;
        }
        let payload = unsafe { CStr::from_ptr(payload) }.to_bytes();
        match bridge.manager.submit_operation(space_id, payload) {
            Ok(()) => true,
            Err(err) => {
                warn!("submit to {space_id} rejected: {err}");
                false
            }
        }
    })
}

/// Install a push target for a space; a null callback removes it.
#[no_mangle]
pub extern "C" fn spacesync_set_operation_callback(
    space_id: *const c_char,
    callback: Option<HostCallback>,
    callback_data: *mut c_void,
) {
    guarded((), || {
        let (Some(bridge), Some(space_id)) = (bridge(), unsafe { host_str(space_id) }) else {
            return;
        };
        let result = match callback {
            Some(callback) => {
                // Pointers are not Send; the host guarantees the data outlives the registration
                let data = callback_data as usize;
                bridge.manager.register_callback(
                    space_id,
                    Arc::new(move |payload: &[u8]| {
                        if let Ok(payload) = CString::new(payload) {
                            callback(data as *mut c_void, payload.as_ptr());
                        }
                    }),
                )
            }
            None => bridge.manager.clear_callback(space_id),
        };
        if let Err(err) = result {
            warn!("callback for {space_id} not changed: {err}");
        }
    })
}

#[no_mangle]
pub extern "C" fn spacesync_start_listening(space_id: *const c_char) -> bool {
    guarded(false, || {
        let (Some(bridge), Some(space_id)) = (bridge(), unsafe { host_str(space_id) }) else {
            return false;
        };
        let _runtime = bridge.runtime.enter();
        match bridge.manager.start_listening(space_id) {
            Ok(()) => true,
            Err(err) => {
                warn!("start listening on {space_id} failed: {err}");
                false
            }
        }
    })
}

/// Oldest pending operation, or null when there is none.
#[no_mangle]
pub extern "C" fn spacesync_poll_operation(space_id: *const c_char) -> *mut c_char {
    guarded(ptr::null_mut(), || {
        let (Some(bridge), Some(space_id)) = (bridge(), unsafe { host_str(space_id) }) else {
            return ptr::null_mut();
        };
        match bridge.manager.retrieve_next(space_id) {
            Ok(Some(payload)) => into_host_string(payload),
            Ok(None) => ptr::null_mut(),
            Err(err) => {
                warn!("poll on {space_id} failed: {err}");
                ptr::null_mut()
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn spacesync_close_space(space_id: *const c_char) -> bool {
    guarded(false, || {
        let (Some(bridge), Some(space_id)) = (bridge(), unsafe { host_str(space_id) }) else {
            return false;
        };
        match bridge.manager.close_space(space_id) {
            Ok(()) => true,
            Err(err) => {
                warn!("close {space_id} failed: {err}");
                false
            }
        }
    })
}

/// Status JSON of the most recently opened space.
#[no_mangle]
pub extern "C" fn spacesync_get_status() -> *mut c_char {
    guarded(ptr::null_mut(), || {
        let mut status = BridgeStatus::default();
        if let Some(bridge) = BRIDGE.get() {
            status.node_host = bridge.node_host.clone();
            status.node_port = bridge.node_port;
            status.network_id = bridge.network_id.clone();
            status.connected = true;
            if let Some(space) = bridge.manager.status() {
                status.space_id = space.space_id;
                status.peer_count = space.peer_count;
                status.last_sync_millis = space.last_sync_millis;
                status.queue_depth = space.queue_depth;
                status.dropped_events = space.dropped_events;
            }
        }
        match serde_json::to_string(&status) {
            Ok(json) => into_host_string(json),
            Err(err) => {
                error!("status serialization failed: {err}");
                ptr::null_mut()
            }
        }
    })
}

/// Release a string returned by any `spacesync_*` function. Null is ignored.
#[no_mangle]
pub extern "C" fn spacesync_free_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    guarded((), || unsafe {
        drop(CString::from_raw(ptr));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn take_string(ptr: *mut c_char) -> Option<String> {
        if ptr.is_null() {
            return None;
        }
        let value = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
        spacesync_free_string(ptr);
        Some(value)
    }

    #[test]
    fn test_loopback_bridge_round_trip() {
        std::env::set_var(crate::config::ENV_LOOPBACK, "1");
        std::env::set_var(crate::config::ENV_POLL_INTERVAL_MS, "10");

        let host = CString::new("127.0.0.1").unwrap();
        let network = CString::new("test-net").unwrap();
        assert!(spacesync_initialize(host.as_ptr(), 1004, network.as_ptr()));
        // Second initialization is harmless
        assert!(spacesync_initialize(host.as_ptr(), 1004, network.as_ptr()));

        let space_id = take_string(spacesync_create_space()).unwrap();
        assert!(space_id.starts_with("loopback-"));
        let space = CString::new(space_id.clone()).unwrap();

        let bad = CString::new("{not json").unwrap();
        assert!(!spacesync_submit_operation(space.as_ptr(), bad.as_ptr()));

        let op = CString::new(r#"{"move":1,"player":"X"}"#).unwrap();
        assert!(spacesync_submit_operation(space.as_ptr(), op.as_ptr()));
        assert!(spacesync_start_listening(space.as_ptr()));

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            received = take_string(spacesync_poll_operation(space.as_ptr()));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(received.as_deref(), Some(r#"{"move":1,"player":"X"}"#));
        std::thread::sleep(Duration::from_millis(50));
        assert!(take_string(spacesync_poll_operation(space.as_ptr())).is_none());

        let status: serde_json::Value =
            serde_json::from_str(&take_string(spacesync_get_status()).unwrap()).unwrap();
        assert_eq!(status["spaceId"], space_id.as_str());
        assert_eq!(status["connected"], true);
        assert_eq!(status["lastSyncMillis"], 0);
        assert_eq!(status["networkId"], "test-net");

        assert!(spacesync_close_space(space.as_ptr()));
        assert!(!spacesync_close_space(space.as_ptr()));
        assert!(!spacesync_submit_operation(space.as_ptr(), op.as_ptr()));
    }

    #[test]
    fn test_caught_panic_yields_empty_space_id() {
        let id = guarded(String::new(), || -> String { panic!("engine bug") });
        assert_eq!(take_string(into_host_string(id)).as_deref(), Some(""));
    }

    #[test]
    fn test_null_arguments_are_rejected() {
        assert!(!spacesync_join_space(ptr::null()));
        assert!(spacesync_poll_operation(ptr::null()).is_null());
        spacesync_free_string(ptr::null_mut());
    }
}

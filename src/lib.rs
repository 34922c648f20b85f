//! spacesync - replicated key-value spaces embedded behind a narrow call surface
//!
//! A host application creates or joins *spaces*, submits opaque JSON
//! operations into them and receives every operation written by any replica
//! exactly once per delivery channel, through a per-space queue and/or a
//! callback. Change detection is polling only: one background task per
//! listening space scans the store, deduplicates writes by fingerprint,
//! decrypts them and fans them out, then opportunistically syncs with peers.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use spacesync::{engine::loopback::LoopbackEngine, Config, SpaceSessionManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), spacesync::SpaceError> {
//! let manager = SpaceSessionManager::new(Arc::new(LoopbackEngine::new("me")), Config::default());
//! let space = manager.create_space().await?;
//! manager.submit_operation(&space, r#"{"move":1,"player":"X"}"#)?;
//! manager.start_listening(&space)?;
//! assert_eq!(manager.retrieve_next(&space)?, None); // nothing polled yet
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! The session core ([`session`], [`space`], the change poller, [`ledger`],
//! [`delivery`], [`peer_sync`]) only talks to the traits in [`engine`].
//! Two engines ship with the crate:
//!
//! - [`engine::local::LocalEngine`] keeps each space in a log-driven,
//!   last-write-wins [`store::SpaceStore`] (WAL + snapshots) and replicates
//!   it by log exchange with [`relay::Relay`] nodes over an
//!   [`exchange::ExchangeInterface`] ([`http::HttpExchange`] or the in-process
//!   [`exchange::MemoryExchange`]).
//! - [`engine::loopback::LoopbackEngine`] echoes writes back without peers.
//!
//! [`ffi`] exposes the manager to C hosts; `spacesync-node` runs a relay.
//!
//! # Non-goals
//!
//! - Conflict resolution beyond last-write-wins per (key, writer)
//! - Encryption scheme or transport negotiation design
//! - A stable persistence format

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod descriptor;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod ffi;
pub mod http;
pub mod ledger;
pub mod ops;
pub mod peer_sync;
mod poller;
pub mod relay;
pub mod session;
pub mod space;
pub mod store;
pub mod types;
pub mod wal;

pub use config::Config;
pub use error::{SpaceError, SpaceResult};
pub use session::SpaceSessionManager;
pub use space::{Lifecycle, SpaceStatus};

#[cfg(test)]
mod tests;

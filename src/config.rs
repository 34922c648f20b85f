use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::delivery::DEFAULT_QUEUE_CAPACITY;
use crate::ledger::DEFAULT_LEDGER_CEILING;

pub const ENV_LOOPBACK: &str = "SPACESYNC_LOOPBACK";
pub const ENV_SEED: &str = "SPACESYNC_SEED";
pub const ENV_PEER_INDEX: &str = "SPACESYNC_PEER_INDEX";
pub const ENV_DATA_DIR: &str = "SPACESYNC_DATA_DIR";
pub const ENV_POLL_INTERVAL_MS: &str = "SPACESYNC_POLL_INTERVAL_MS";
pub const ENV_QUEUE_CAPACITY: &str = "SPACESYNC_QUEUE_CAPACITY";
pub const ENV_LEDGER_CEILING: &str = "SPACESYNC_LEDGER_CEILING";

const DEFAULT_POLL_INTERVAL_MS: u64 = 300;

/// Session tuning and engine selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub poll_interval_ms: u64,
    pub ledger_ceiling: usize,
    /// `None` leaves event queues unbounded
    pub queue_capacity: Option<usize>,
    /// Storage root for space stores; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Use the in-process echo engine instead of relay replication
    pub loopback: bool,
    pub identity_seed: Option<String>,
    pub peer_index: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ledger_ceiling: DEFAULT_LEDGER_CEILING,
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            data_dir: None,
            loopback: false,
            identity_seed: None,
            peer_index: 0,
        }
    }
}

impl Config {
    /// Defaults overridden by `SPACESYNC_*` variables. The data dir
    /// defaults to `$HOME/.spacesync/spaces`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            data_dir: Some(default_data_dir()),
            ..Self::default()
        };

        if let Some(flag) = var(ENV_LOOPBACK) {
            config.loopback = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        config.identity_seed = var(ENV_SEED);
        if let Some(index) = parsed(ENV_PEER_INDEX)? {
            config.peer_index = index;
        }
        if let Some(dir) = var(ENV_DATA_DIR) {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = parsed(ENV_POLL_INTERVAL_MS)? {
            config.poll_interval_ms = ms;
        }
        if let Some(capacity) = parsed::<usize>(ENV_QUEUE_CAPACITY)? {
            // 0 means unbounded
            config.queue_capacity = (capacity > 0).then_some(capacity);
        }
        if let Some(ceiling) = parsed(ENV_LEDGER_CEILING)? {
            config.ledger_ceiling = ceiling;
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("invalid {name}: {value:?}"))
        })
        .transpose()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".spacesync"))
        .or_else(|| dirs::cache_dir().map(|cache| cache.join("spacesync")))
        .map(|root| root.join("spaces"))
        .unwrap_or_else(|| PathBuf::from("spaces"))
}

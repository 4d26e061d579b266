//! Process-wide runtime configuration.
//!
//! Built once at start-up and handed to every component by `Arc`. There is
//! no global state anywhere else in the crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POOL_SIZE: usize = 5;
pub const DEFAULT_QUEUE_SIZE: usize = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Currency code, used to pick our entry out of an info-endpoint object.
    pub currency_code: String,

    /// Built-in server list used when no server cache exists yet.
    pub default_servers: Vec<String>,

    /// Endpoint returning the master server list. `None` disables refresh.
    pub info_server: Option<String>,

    /// Directory holding `headers.json`, `servers.json` and `engine.json`.
    pub data_dir: PathBuf,

    /// Target number of simultaneous server connections per engine.
    pub pool_size: usize,

    /// Maximum in-flight requests per connection.
    pub queue_size: usize,

    pub request_timeout_secs: u64,
    pub keepalive_secs: u64,

    /// How long a server that just closed is skipped by refill.
    pub reconnect_cooldown_secs: u64,

    /// How often dirty caches are flushed to disk.
    pub save_interval_secs: u64,

    /// How often the info endpoint is polled.
    pub server_refresh_secs: u64,

    /// Substrings; any server URI containing one is never used.
    pub ignored_servers: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            currency_code: "BTC".to_string(),
            default_servers: vec![
                "electrums://electrum.blockstream.info:50002".to_string(),
                "electrums://electrum.emzy.de:50002".to_string(),
                "electrums://electrum.bitaroo.net:50002".to_string(),
                "electrum://electrum.blockstream.info:50001".to_string(),
            ],
            info_server: None,
            data_dir: PathBuf::from("stratum_data"),
            pool_size: DEFAULT_POOL_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            reconnect_cooldown_secs: 30,
            save_interval_secs: 5,
            server_refresh_secs: 600,
            ignored_servers: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_slice(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.reconnect_cooldown_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn server_refresh(&self) -> Duration {
        Duration::from_secs(self.server_refresh_secs)
    }

    pub fn headers_path(&self) -> PathBuf {
        self.data_dir.join("headers.json")
    }

    pub fn servers_path(&self) -> PathBuf {
        self.data_dir.join("servers.json")
    }

    /// Address and transaction cache of the wallet engine.
    pub fn engine_path(&self) -> PathBuf {
        self.data_dir.join("engine.json")
    }
}

//! Process-wide cache shared by every wallet engine.
//!
//! Holds the [`ServerCache`] and the block-header cache, loads both from
//! disk at start and writes them back on [`ConnectionCache::flush`]. Writes
//! are held back while any registered engine is still syncing so engines
//! never fight over the files mid-sync.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::persistence::{read_json_or, write_json};
use crate::streaming::cache::server_cache::{
    ServerCache, ServerInfo, DEFAULT_DOWN_DELTA, DEFAULT_UP_DELTA,
};

pub type SharedConnectionCache = Arc<Mutex<ConnectionCache>>;

/// Handle identifying one engine's progress slot.
pub type EngineId = u64;

/// Locks the shared cache, recovering the data from a poisoned lock.
pub fn lock(cache: &SharedConnectionCache) -> MutexGuard<'_, ConnectionCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub timestamp: u32,
}

/// On-disk shape of `headers.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderCache {
    pub height: u32,
    pub headers: BTreeMap<u32, HeaderEntry>,
}

#[derive(Debug)]
pub struct ConnectionCache {
    headers_path: PathBuf,
    servers_path: PathBuf,

    headers: HeaderCache,
    servers: ServerCache,

    headers_dirty: bool,
    servers_dirty: bool,

    /// Sync progress per registered engine, in `[0, 1]`.
    engines: BTreeMap<EngineId, f64>,
    next_engine_id: EngineId,
}

impl ConnectionCache {
    /// Reads both cache files. Anything missing or corrupt is replaced by an
    /// empty header cache or the built-in server list.
    pub fn load(config: &RuntimeConfig) -> Self {
        let headers_path = config.headers_path();
        let servers_path = config.servers_path();

        let headers: HeaderCache = read_json_or(&headers_path, HeaderCache::default);
        let stored: BTreeMap<String, ServerInfo> = read_json_or(&servers_path, BTreeMap::new);

        let mut cache = Self {
            headers_path,
            servers_path,
            headers,
            servers: ServerCache::from_map(stored),
            headers_dirty: false,
            servers_dirty: false,
            engines: BTreeMap::new(),
            next_engine_id: 0,
        };

        if cache.servers.is_empty() {
            log::info!(
                "[CACHE] no stored servers, seeding {} defaults",
                config.default_servers.len()
            );
            for uri in &config.default_servers {
                cache.add_server(uri);
            }
        }

        log::info!(
            "[CACHE] loaded {} servers, {} headers (height {})",
            cache.servers.len(),
            cache.headers.headers.len(),
            cache.headers.height
        );
        cache
    }

    pub fn into_shared(self) -> SharedConnectionCache {
        Arc::new(Mutex::new(self))
    }

    // ------------------------------------------------------------------
    // Servers
    // ------------------------------------------------------------------

    pub fn servers(&self) -> &ServerCache {
        &self.servers
    }

    pub fn add_server(&mut self, uri: &str) -> bool {
        let added = self.servers.insert(uri);
        if added {
            self.mark_servers_dirty();
        }
        added
    }

    /// Up to `n` servers to open, never one listed in `exclude`.
    pub fn get_servers(&self, n: usize, ignore_patterns: &[String], exclude: &HashSet<&str>) -> Vec<String> {
        self.servers.get_servers_excluding(n, ignore_patterns, exclude)
    }

    pub fn server_score_up(&mut self, uri: &str, response_time_ms: f64, now: Instant) {
        self.servers
            .server_score_up(uri, response_time_ms, DEFAULT_UP_DELTA, now);
        self.mark_servers_dirty();
    }

    pub fn server_score_down(&mut self, uri: &str, now: Instant) {
        self.servers.server_score_down(uri, DEFAULT_DOWN_DELTA, now);
        self.mark_servers_dirty();
    }

    /// Applies a freshly fetched master list: unseen URIs are added, known
    /// URIs missing from the list are demoted. Returns how many were added.
    pub fn merge_server_list(&mut self, uris: &[String]) -> usize {
        let fresh: BTreeSet<&str> = uris.iter().map(String::as_str).collect();

        let absent: Vec<String> = self
            .servers
            .as_map()
            .keys()
            .filter(|uri| !fresh.contains(uri.as_str()))
            .cloned()
            .collect();
        for uri in &absent {
            self.servers.demote(uri);
        }

        let added = fresh.iter().filter(|uri| self.servers.insert(uri)).count();

        if added > 0 || !absent.is_empty() {
            self.mark_servers_dirty();
        }
        log::info!(
            "[CACHE] server list merged: {} new, {} demoted, {} total",
            added,
            absent.len(),
            self.servers.len()
        );
        added
    }

    // ------------------------------------------------------------------
    // Headers
    // ------------------------------------------------------------------

    pub fn height(&self) -> u32 {
        self.headers.height
    }

    /// Raises the cached chain tip. Lower heights are ignored.
    pub fn update_height(&mut self, height: u32) {
        if height > self.headers.height {
            self.headers.height = height;
            self.mark_headers_dirty();
        }
    }

    pub fn header_timestamp(&self, height: u32) -> Option<u32> {
        self.headers.headers.get(&height).map(|h| h.timestamp)
    }

    pub fn insert_header(&mut self, height: u32, timestamp: u32) {
        let entry = HeaderEntry { timestamp };
        if self.headers.headers.insert(height, entry) != Some(entry) {
            self.mark_headers_dirty();
        }
    }

    // ------------------------------------------------------------------
    // Engine progress and debounced saving
    // ------------------------------------------------------------------

    pub fn register_engine(&mut self) -> EngineId {
        let id = self.next_engine_id;
        self.next_engine_id += 1;
        self.engines.insert(id, 0.0);
        id
    }

    pub fn unregister_engine(&mut self, id: EngineId) {
        self.engines.remove(&id);
    }

    pub fn report_progress(&mut self, id: EngineId, ratio: f64) {
        if let Some(progress) = self.engines.get_mut(&id) {
            *progress = ratio.clamp(0.0, 1.0);
        }
    }

    /// True when no registered engine is mid-sync.
    pub fn all_engines_idle(&self) -> bool {
        self.engines.values().all(|p| *p >= 1.0)
    }

    pub fn mark_servers_dirty(&mut self) {
        self.servers_dirty = true;
    }

    pub fn mark_headers_dirty(&mut self) {
        self.headers_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.servers_dirty || self.headers_dirty
    }

    /// Writes whatever is dirty, unless an engine is still syncing. Write
    /// failures are logged and the dirty flag stays set for the next try.
    pub fn flush(&mut self) {
        if !self.is_dirty() {
            return;
        }
        if !self.all_engines_idle() {
            log::trace!("[CACHE] flush postponed, engines still syncing");
            return;
        }

        if self.headers_dirty {
            match write_json(&self.headers_path, &self.headers) {
                Ok(()) => self.headers_dirty = false,
                Err(e) => log::warn!("[CACHE] saving headers failed: {}", e),
            }
        }
        if self.servers_dirty {
            match write_json(&self.servers_path, self.servers.as_map()) {
                Ok(()) => self.servers_dirty = false,
                Err(e) => log::warn!("[CACHE] saving servers failed: {}", e),
            }
        }
    }
}

/// Extracts server URIs from an info-endpoint body.
///
/// Accepts a bare array, or an object whose `currency_code` entry is an
/// array. Anything else means "no update".
pub fn parse_server_list(body: &Value, currency_code: &str) -> Option<Vec<String>> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(map) => map.get(currency_code)?,
        _ => return None,
    };
    let uris: Vec<String> = list
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::to_owned)
        .collect();
    Some(uris)
}

/// Pulls the master server list and merges it into the shared cache.
///
/// Network failures, bad status codes and unexpected bodies leave the cache
/// untouched. Returns the number of new servers, if the list was usable.
pub async fn fetch_stratum_servers(
    cache: &SharedConnectionCache,
    client: &reqwest::Client,
    url: &str,
    currency_code: &str,
) -> Option<usize> {
    log::debug!("[CACHE] fetching server list from {}", url);

    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => {
            log::warn!("[CACHE] server list request failed: {}", e);
            return None;
        }
    };
    if !response.status().is_success() {
        log::warn!("[CACHE] server list request returned {}", response.status());
        return None;
    }
    let body: Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            log::warn!("[CACHE] server list body is not json: {}", e);
            return None;
        }
    };

    let Some(uris) = parse_server_list(&body, currency_code) else {
        log::warn!("[CACHE] server list has an unexpected shape, keeping current list");
        return None;
    };
    if uris.is_empty() {
        log::warn!("[CACHE] server list is empty, keeping current list");
        return None;
    }

    let mut guard = lock(cache);
    let added = guard.merge_server_list(&uris);
    guard.flush();
    Some(added)
}

#[cfg(test)]
mod tests;

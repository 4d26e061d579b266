//! Server reliability ledger.
//!
//! Pure data plus the scoring rules; persistence lives in
//! [`ConnectionCache`](super::connection_cache::ConnectionCache).

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const MAX_SCORE: i32 = 500;
pub const MIN_SCORE: i32 = -100;
pub const DEFAULT_UP_DELTA: i32 = 1;
pub const DEFAULT_DOWN_DELTA: i32 = 10;

/// Response time of a server that has never answered.
pub const RESPONSE_TIME_UNINITIALIZED: f64 = 999_999_999.0;

/// Down-votes only count if some server was up-voted this recently.
pub const NETWORK_ALIVE_WINDOW: Duration = Duration::from_secs(60);

const SELECTION_SCORE_SPREAD: i32 = 100;
const SELECTION_MIN_SCORE: i32 = 5;
const DEMOTE_DELTA: i32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub score: i32,
    /// Exponential moving average, in milliseconds.
    pub response_time_ms: f64,
    pub sample_count: u32,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            score: 0,
            response_time_ms: RESPONSE_TIME_UNINITIALIZED,
            sample_count: 0,
        }
    }
}

impl ServerInfo {
    pub fn has_response_time(&self) -> bool {
        self.response_time_ms != RESPONSE_TIME_UNINITIALIZED
    }

    pub fn never_tried(&self) -> bool {
        self.sample_count == 0 && !self.has_response_time()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerCache {
    servers: BTreeMap<String, ServerInfo>,
    last_score_up: Option<Instant>,
}

impl ServerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(servers: BTreeMap<String, ServerInfo>) -> Self {
        let mut cache = Self {
            servers,
            last_score_up: None,
        };
        for info in cache.servers.values_mut() {
            info.score = info.score.clamp(MIN_SCORE, MAX_SCORE);
        }
        cache
    }

    pub fn as_map(&self) -> &BTreeMap<String, ServerInfo> {
        &self.servers
    }

    pub fn get(&self, uri: &str) -> Option<&ServerInfo> {
        self.servers.get(uri)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Adds `uri` with a neutral score. Returns `true` if it was new.
    pub fn insert(&mut self, uri: &str) -> bool {
        if self.servers.contains_key(uri) {
            return false;
        }
        log::debug!("[CACHE] new server {}", uri);
        self.servers.insert(uri.to_string(), ServerInfo::default());
        true
    }

    pub fn server_score_up(&mut self, uri: &str, response_time_ms: f64, delta: i32, now: Instant) {
        let info = self.servers.entry(uri.to_string()).or_default();
        info.score = info.score.saturating_add(delta).clamp(MIN_SCORE, MAX_SCORE);

        info.sample_count = info.sample_count.saturating_add(1);
        if !info.has_response_time() {
            info.response_time_ms = response_time_ms;
        } else if info.sample_count % 10 == 0 {
            info.response_time_ms = 0.2 * info.response_time_ms + 0.8 * response_time_ms;
        } else {
            info.response_time_ms = 0.5 * info.response_time_ms + 0.5 * response_time_ms;
        }

        self.last_score_up = Some(now);
        log::trace!(
            "[CACHE] score up {} -> {} ({:.0}ms)",
            uri,
            info.score,
            info.response_time_ms
        );
    }

    /// Lowers a score, unless nobody has succeeded lately: then the network
    /// itself is presumed down and no server is blamed.
    pub fn server_score_down(&mut self, uri: &str, delta: i32, now: Instant) {
        let network_alive = self
            .last_score_up
            .is_some_and(|t| now.saturating_duration_since(t) <= NETWORK_ALIVE_WINDOW);
        if !network_alive {
            log::debug!("[CACHE] not blaming {}: no recent successes anywhere", uri);
            return;
        }

        let info = self.servers.entry(uri.to_string()).or_default();
        info.score = info.score.saturating_sub(delta).clamp(MIN_SCORE, MAX_SCORE);
        log::debug!("[CACHE] score down {} -> {}", uri, info.score);
    }

    /// Demotes a server that vanished from the master list. Not subject to
    /// the network-alive check.
    pub fn demote(&mut self, uri: &str) {
        if let Some(info) = self.servers.get_mut(uri) {
            info.score = info.score.saturating_sub(DEMOTE_DELTA).max(MIN_SCORE);
            log::debug!("[CACHE] demoted {} -> {}", uri, info.score);
        }
    }

    /// Picks up to `n` servers, best first.
    ///
    /// The top of the score ranking (within 100 of the best, score at least
    /// 5, with a known response time, at most half the population) is
    /// re-ordered fastest-first; the rest follow by score. If nothing in the
    /// result has ever been tried, the best untried server is swapped in.
    pub fn get_servers(&self, n: usize, ignore_patterns: &[String]) -> Vec<String> {
        self.get_servers_excluding(n, ignore_patterns, &HashSet::new())
    }

    /// Like [`Self::get_servers`], but `exclude` (servers already open or
    /// cooling down) is removed before ranking, so the untried slot always
    /// survives.
    pub fn get_servers_excluding(
        &self,
        n: usize,
        ignore_patterns: &[String],
        exclude: &HashSet<&str>,
    ) -> Vec<String> {
        if n == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(&String, &ServerInfo)> = self
            .servers
            .iter()
            .filter(|(uri, _)| !exclude.contains(uri.as_str()))
            .filter(|(uri, _)| !ignore_patterns.iter().any(|p| uri.contains(p.as_str())))
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        candidates.sort_by(|a, b| b.1.score.cmp(&a.1.score).then_with(|| a.0.cmp(b.0)));

        let best = candidates[0].1.score;
        let window_cap = candidates.len() / 2;
        let window_len = candidates
            .iter()
            .take(window_cap)
            .take_while(|(_, info)| {
                info.score >= best - SELECTION_SCORE_SPREAD
                    && info.score >= SELECTION_MIN_SCORE
                    && info.has_response_time()
            })
            .count();

        candidates[..window_len].sort_by(|a, b| {
            a.1.response_time_ms
                .total_cmp(&b.1.response_time_ms)
                .then_with(|| a.0.cmp(b.0))
        });

        let mut picked: Vec<String> = candidates.iter().take(n).map(|(uri, _)| (*uri).clone()).collect();

        let has_untried = picked
            .iter()
            .any(|uri| self.servers.get(uri).is_some_and(ServerInfo::never_tried));
        if !has_untried {
            let untried = candidates
                .iter()
                .skip(picked.len())
                .find(|(_, info)| info.never_tried());
            if let Some((uri, _)) = untried {
                log::trace!("[CACHE] forcing untried server {} into selection", uri);
                picked.pop();
                picked.push((*uri).clone());
            }
        }

        picked
    }
}

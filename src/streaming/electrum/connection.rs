//! One Stratum connection, as a pure state machine.
//!
//! The socket lives elsewhere (see `socket.rs`). This type only sees bytes
//! in, lines out and the current time, which keeps framing, request
//! correlation, back-pressure, keepalive and timeouts fully deterministic.
//!
//! Lifecycle: `Idle -> Connecting -> Open -> Closed`, and `Closed` may be
//! reopened.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::error::StratumError;
use crate::streaming::electrum::protocol::{
    decode_message, encode_request, parse_notification, Incoming, Notification, StratumTask,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `electrum://`
    Plain,
    /// `electrums://`
    Tls,
}

/// Where to dial, parsed from a server URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self, StratumError> {
        let invalid = || StratumError::InvalidUri(uri.to_string());

        let uri = uri.trim();
        let (scheme, rest) = if let Some(rest) = uri.strip_prefix("electrums://") {
            (Scheme::Tls, rest)
        } else if let Some(rest) = uri.strip_prefix("electrum://") {
            (Scheme::Plain, rest)
        } else {
            return Err(invalid());
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

/// Longest line a server may send before the connection is failed.
pub const MAX_LINE_LEN: usize = 16 * 1024 * 1024;

/// Tunables for a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub queue_size: usize,
    pub timeout: Duration,
    pub keepalive: Duration,
    pub max_line_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for ConnectionConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            queue_size: config.queue_size.max(1),
            timeout: config.request_timeout(),
            keepalive: config.keepalive(),
            max_line_len: MAX_LINE_LEN,
        }
    }
}

/// Aggregated per-session numbers reported when a connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConnectionStats {
    pub bad_messages: u32,
    pub good_messages: u32,
    /// 1 when the connection dropped on its own, 0 for a requested close.
    pub disconnects: u32,
    pub average_latency: Option<Duration>,
}

/// A reply (or failure) for one request, handed back to the owner.
#[derive(Debug)]
pub struct Completed {
    pub task: StratumTask,
    pub result: Result<Value, StratumError>,
    pub latency: Duration,
}

/// Callbacks a connection makes into whoever owns it.
///
/// Returning `Err` from `on_reply` or `on_notification` marks the message
/// as bad and fails the whole connection.
pub trait StratumOwner {
    /// Asked whenever the queue has room. `None` means "nothing to do".
    fn on_queue_space(&mut self, uri: &str, now: Instant) -> Option<StratumTask>;

    fn on_reply(&mut self, uri: &str, done: Completed, now: Instant) -> Result<(), StratumError>;

    fn on_notification(
        &mut self,
        uri: &str,
        notification: Notification,
        now: Instant,
    ) -> Result<(), StratumError>;

    fn on_close(&mut self, uri: &str, stats: ConnectionStats, error: Option<&StratumError>, now: Instant);
}

#[derive(Debug)]
struct PendingRequest {
    task: StratumTask,
    started: Instant,
}

#[derive(Debug)]
pub struct StratumConnection {
    uri: String,
    config: ConnectionConfig,
    state: ConnectionState,

    next_id: u64,
    /// Sent and awaiting a reply.
    pending: BTreeMap<u64, PendingRequest>,
    /// Submitted while not open; sent on the next successful connect.
    deferred: VecDeque<StratumTask>,
    /// Encoded lines waiting for the socket writer.
    outbound: Vec<String>,
    /// Bytes read but not yet terminated by `\n`.
    inbound: BytesMut,
    /// Prefix of `inbound` already known to hold no `\n`.
    scanned: usize,

    last_keepalive: Option<Instant>,
    good_messages: u32,
    bad_messages: u32,
    total_latency: Duration,
}

impl StratumConnection {
    pub fn new(uri: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            uri: uri.into(),
            config,
            state: ConnectionState::Idle,
            next_id: 0,
            pending: BTreeMap::new(),
            deferred: VecDeque::new(),
            outbound: Vec::new(),
            inbound: BytesMut::new(),
            scanned: 0,
            last_keepalive: None,
            good_messages: 0,
            bad_messages: 0,
            total_latency: Duration::ZERO,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    /// Validates the URI and moves to `Connecting`. The caller dials the
    /// returned endpoint and reports back through [`Self::on_connect`].
    pub fn open(&mut self) -> Result<Endpoint, StratumError> {
        if matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            return Err(StratumError::protocol("connection already open"));
        }
        let endpoint = Endpoint::parse(&self.uri)?;
        log::debug!("[STRATUM] {} connecting to {}:{}", self.uri, endpoint.host, endpoint.port);
        self.state = ConnectionState::Connecting;
        self.inbound.clear();
        self.scanned = 0;
        self.outbound.clear();
        Ok(endpoint)
    }

    /// The socket is up: reset counters, handshake, replay deferred
    /// requests and start pulling work.
    pub fn on_connect<O: StratumOwner>(&mut self, now: Instant, owner: &mut O) {
        if self.state != ConnectionState::Connecting {
            log::warn!("[STRATUM] {} on_connect in state {:?}", self.uri, self.state);
            return;
        }
        log::info!("[STRATUM] {} connected", self.uri);

        self.state = ConnectionState::Open;
        self.good_messages = 0;
        self.bad_messages = 0;
        self.total_latency = Duration::ZERO;

        self.send(StratumTask::Version, now);
        self.last_keepalive = Some(now);

        while let Some(task) = self.deferred.pop_front() {
            self.send(task, now);
        }

        self.wakeup(now, owner);
    }

    /// Queues a request. Sent immediately when open, otherwise kept until
    /// the next connect.
    pub fn submit(&mut self, task: StratumTask, now: Instant) {
        if self.state == ConnectionState::Open {
            self.send(task, now);
        } else {
            log::trace!("[STRATUM] {} deferring {}", self.uri, task.method());
            self.deferred.push_back(task);
        }
    }

    /// Fills the queue from the owner until it is full or the owner runs
    /// out of work.
    pub fn wakeup<O: StratumOwner>(&mut self, now: Instant, owner: &mut O) {
        while self.state == ConnectionState::Open && self.pending.len() < self.config.queue_size {
            match owner.on_queue_space(&self.uri, now) {
                Some(task) => self.send(task, now),
                None => break,
            }
        }
    }

    fn send(&mut self, task: StratumTask, now: Instant) {
        self.next_id += 1;
        let id = self.next_id;

        match encode_request(id, &task) {
            Ok(line) => {
                log::trace!("[STRATUM] {} >>> {}", self.uri, line.trim_end());
                self.outbound.push(line);
                self.pending.insert(id, PendingRequest { task, started: now });
            }
            Err(e) => log::error!("[STRATUM] {} cannot encode {}: {}", self.uri, task.method(), e),
        }
    }

    /// Lines ready for the socket writer.
    pub fn take_outbound(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbound)
    }

    /// Feeds raw socket bytes. An `Err` means the connection must be closed
    /// with that error.
    pub fn on_data<O: StratumOwner>(
        &mut self,
        data: &[u8],
        now: Instant,
        owner: &mut O,
    ) -> Result<(), StratumError> {
        if self.state != ConnectionState::Open {
            return Ok(());
        }
        self.inbound.extend_from_slice(data);

        loop {
            let Some(offset) = self.inbound[self.scanned..].iter().position(|b| *b == b'\n') else {
                self.scanned = self.inbound.len();
                break;
            };
            let pos = self.scanned + offset;
            self.scanned = 0;
            let line = self.inbound.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            log::trace!("[STRATUM] {} <<< {}", self.uri, line);

            if let Err(e) = self.handle_line(line, now, owner) {
                self.bad_messages += 1;
                log::warn!("[STRATUM] {} bad message: {}", self.uri, e);
                return Err(e);
            }
        }

        if self.inbound.len() > self.config.max_line_len {
            self.bad_messages += 1;
            log::warn!(
                "[STRATUM] {} sent {} bytes without a line break",
                self.uri,
                self.inbound.len()
            );
            return Err(StratumError::protocol(format!(
                "line exceeds {} bytes",
                self.config.max_line_len
            )));
        }

        self.wakeup(now, owner);
        Ok(())
    }

    fn handle_line<O: StratumOwner>(
        &mut self,
        line: &str,
        now: Instant,
        owner: &mut O,
    ) -> Result<(), StratumError> {
        match decode_message(line)? {
            Incoming::Reply { id, result } => {
                let request = self.pending.remove(&id).ok_or(StratumError::UnknownId(id))?;
                let latency = now.saturating_duration_since(request.started);

                self.good_messages += 1;
                self.total_latency += latency;

                owner.on_reply(
                    &self.uri,
                    Completed {
                        task: request.task,
                        result,
                        latency,
                    },
                    now,
                )
            }
            Incoming::Notification { method, params } => {
                match parse_notification(&method, params)? {
                    Some(notification) => {
                        self.good_messages += 1;
                        owner.on_notification(&self.uri, notification, now)
                    }
                    None => Ok(()),
                }
            }
        }
    }

    /// Earliest instant at which [`Self::on_timer`] has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != ConnectionState::Open {
            return None;
        }
        let keepalive = self.last_keepalive.map(|t| t + self.config.keepalive);
        let timeout = self
            .pending
            .values()
            .map(|p| p.started + self.config.timeout)
            .min();

        match (keepalive, timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Sends a keepalive when due and fails requests older than the
    /// timeout. Timeouts fail the request, never the connection.
    pub fn on_timer<O: StratumOwner>(&mut self, now: Instant, owner: &mut O) -> Result<(), StratumError> {
        if self.state != ConnectionState::Open {
            return Ok(());
        }

        let due = self
            .last_keepalive
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.keepalive);
        if due {
            log::trace!("[STRATUM] {} keepalive", self.uri);
            self.send(StratumTask::Version, now);
            self.last_keepalive = Some(now);
        }

        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started) >= self.config.timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(request) = self.pending.remove(&id) {
                log::debug!("[STRATUM] {} request {} ({}) timed out", self.uri, id, request.task.method());
                owner.on_reply(
                    &self.uri,
                    Completed {
                        task: request.task,
                        result: Err(StratumError::Timeout(self.config.timeout)),
                        latency: now.saturating_duration_since(request.started),
                    },
                    now,
                )?;
            }
        }

        self.wakeup(now, owner);
        Ok(())
    }

    /// Tears the connection down. Every in-flight request fails with
    /// [`StratumError::Closed`]; deferred requests survive for a reopen.
    /// `error` is `None` for a requested close.
    pub fn close<O: StratumOwner>(&mut self, error: Option<StratumError>, now: Instant, owner: &mut O) {
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) {
            return;
        }
        match &error {
            Some(e) => log::info!("[STRATUM] {} closed: {}", self.uri, e),
            None => log::info!("[STRATUM] {} closed", self.uri),
        }
        self.state = ConnectionState::Closed;
        self.inbound.clear();
        self.scanned = 0;
        self.outbound.clear();
        self.last_keepalive = None;

        let pending = std::mem::take(&mut self.pending);
        for (_, request) in pending {
            let done = Completed {
                latency: now.saturating_duration_since(request.started),
                task: request.task,
                result: Err(StratumError::Closed),
            };
            if let Err(e) = owner.on_reply(&self.uri, done, now) {
                log::debug!("[STRATUM] {} ignoring error while closing: {}", self.uri, e);
            }
        }

        let average_latency = if self.good_messages > 0 {
            Some(self.total_latency / self.good_messages)
        } else {
            None
        };
        let stats = ConnectionStats {
            bad_messages: self.bad_messages,
            good_messages: self.good_messages,
            disconnects: u32::from(error.is_some()),
            average_latency,
        };
        owner.on_close(&self.uri, stats, error.as_ref(), now);
    }
}

#[cfg(test)]
mod tests;

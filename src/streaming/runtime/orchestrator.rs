use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::RuntimeConfig;
use crate::error::StratumError;
use crate::persistence::write_json;
use crate::streaming::cache::connection_cache::lock;
use crate::streaming::cache::SharedConnectionCache;
use crate::streaming::electrum::connection::{ConnectionConfig, ConnectionStats, StratumConnection, StratumOwner};
use crate::streaming::electrum::socket::{ConnId, Connector, SocketEvent};
use crate::streaming::engine::EngineState;
use crate::streaming::types::DerivedAddress;

/// Requests from the application to a running orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    AddAddress(DerivedAddress),
    Broadcast(String),
    Disconnect,
}

/// Cloneable handle for talking to a running [`SyncOrchestrator`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    /// Returns `false` once the orchestrator has stopped.
    pub fn add_address(&self, address: DerivedAddress) -> bool {
        self.tx.send(EngineCommand::AddAddress(address)).is_ok()
    }

    pub fn broadcast(&self, raw_tx_hex: String) -> bool {
        self.tx.send(EngineCommand::Broadcast(raw_tx_hex)).is_ok()
    }

    pub fn disconnect(&self) -> bool {
        self.tx.send(EngineCommand::Disconnect).is_ok()
    }
}

/// One live connection: the protocol state machine plus its socket task.
struct Slot {
    conn: StratumConnection,
    conn_id: ConnId,
    /// Dropping this tells the socket task to shut down.
    writer: UnboundedSender<String>,
}

/// **SyncOrchestrator**
///
/// The imperative shell around [`EngineState`]. It has three jobs:
/// 1. Turn engine decisions into sockets (open, write, close).
/// 2. Feed socket bytes and timer ticks into each [`StratumConnection`],
///    which in turn calls back into the engine.
/// 3. Run housekeeping: pool refill, cache flushes, engine snapshots.
///
/// Everything runs on the one task that calls [`Self::run`], so the engine
/// and the connections are never touched concurrently.
pub struct SyncOrchestrator<C> {
    config: Arc<RuntimeConfig>,
    cache: SharedConnectionCache,
    engine: EngineState,
    connector: C,

    slots: HashMap<String, Slot>,
    next_conn_id: ConnId,

    events_tx: UnboundedSender<SocketEvent>,
    events_rx: UnboundedReceiver<SocketEvent>,
    commands_rx: UnboundedReceiver<EngineCommand>,
    commands_open: bool,

    next_housekeeping: Instant,
    /// Start time for logging relative timestamps.
    t0: Instant,
}

impl<C: Connector> SyncOrchestrator<C> {
    pub fn new(
        config: Arc<RuntimeConfig>,
        cache: SharedConnectionCache,
        engine: EngineState,
        connector: C,
    ) -> (Self, EngineHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let orchestrator = Self {
            config,
            cache,
            engine,
            connector,
            slots: HashMap::new(),
            next_conn_id: 0,
            events_tx,
            events_rx,
            commands_rx,
            commands_open: true,
            next_housekeeping: now,
            t0: now,
        };
        (orchestrator, EngineHandle { tx: commands_tx })
    }

    pub fn engine(&self) -> &EngineState {
        &self.engine
    }

    /// Connects the engine and drives it until a disconnect has closed every
    /// connection. Returns the engine so the caller can inspect or reuse it.
    pub async fn run(mut self) -> EngineState {
        self.info("starting");
        let now = Instant::now();
        let uris = self.engine.connect(now);
        self.open_servers(uris, now);
        self.after_event(now);

        while self.engine.is_active() || !self.slots.is_empty() {
            let deadline = tokio::time::Instant::from_std(self.next_deadline());

            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_socket_event(event),
                command = self.commands_rx.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.commands_open = false;
                        self.debug("all handles dropped, disconnecting");
                        self.disconnect(Instant::now());
                    }
                },
                _ = tokio::time::sleep_until(deadline) => self.handle_timer(),
            }
        }

        self.housekeeping(Instant::now());
        self.info("stopped");
        self.engine
    }

    fn handle_command(&mut self, command: EngineCommand) {
        let now = Instant::now();
        self.trace(&format!("command: {:?}", command));
        match command {
            EngineCommand::AddAddress(address) => {
                self.engine.add_address(address);
            }
            EngineCommand::Broadcast(raw) => self.engine.broadcast(raw),
            EngineCommand::Disconnect => {
                self.disconnect(now);
                return;
            }
        }
        self.after_event(now);
    }

    fn disconnect(&mut self, now: Instant) {
        for uri in self.engine.disconnect() {
            self.close_slot(&uri, None, now);
        }
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        let now = Instant::now();
        let Some(uri) = self.uri_for(event.conn_id()) else {
            self.trace(&format!("dropping stale event for conn {}", event.conn_id()));
            return;
        };

        match event {
            SocketEvent::Connected { .. } => {
                if let Some(slot) = self.slots.get_mut(&uri) {
                    slot.conn.on_connect(now, &mut self.engine);
                }
            }
            SocketEvent::Data { data, .. } => {
                let result = match self.slots.get_mut(&uri) {
                    Some(slot) => slot.conn.on_data(&data, now, &mut self.engine),
                    None => Ok(()),
                };
                if let Err(e) = result {
                    self.close_slot(&uri, Some(e), now);
                }
            }
            SocketEvent::Closed { error, .. } => {
                self.close_slot(&uri, Some(error.unwrap_or(StratumError::Closed)), now);
            }
        }
        self.after_event(now);
    }

    fn handle_timer(&mut self) {
        let now = Instant::now();

        let due: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.conn.next_deadline().is_some_and(|d| d <= now))
            .map(|(uri, _)| uri.clone())
            .collect();
        for uri in due {
            let result = match self.slots.get_mut(&uri) {
                Some(slot) => slot.conn.on_timer(now, &mut self.engine),
                None => Ok(()),
            };
            if let Err(e) = result {
                self.close_slot(&uri, Some(e), now);
            }
        }

        if now >= self.next_housekeeping {
            self.housekeeping(now);
            self.next_housekeeping = now + self.config.save_interval().max(Duration::from_millis(100));
        }
        self.after_event(now);
    }

    /// Pool refill, cache flush and engine snapshot.
    fn housekeeping(&mut self, now: Instant) {
        self.refill(now);
        lock(&self.cache).flush();

        if self.engine.is_dirty() {
            let snapshot = self.engine.take_snapshot();
            let path = self.config.engine_path();
            match write_json(&path, &snapshot) {
                Ok(()) => self.trace(&format!("saved {}", path.display())),
                Err(e) => log::warn!("[RUNTIME] saving {} failed: {}", path.display(), e),
            }
        }
    }

    /// Runs after every input: new work may exist for any connection.
    fn after_event(&mut self, now: Instant) {
        self.refill(now);
        for slot in self.slots.values_mut() {
            slot.conn.wakeup(now, &mut self.engine);
        }
        self.flush_outbound();
    }

    fn refill(&mut self, now: Instant) {
        loop {
            let picked = self.engine.refill_servers(now);
            if picked.is_empty() {
                break;
            }
            self.open_servers(picked, now);
        }
    }

    fn open_servers(&mut self, uris: Vec<String>, now: Instant) {
        for uri in uris {
            let mut conn = StratumConnection::new(uri.clone(), ConnectionConfig::from(&*self.config));
            match conn.open() {
                Ok(endpoint) => {
                    self.next_conn_id += 1;
                    let conn_id = self.next_conn_id;
                    self.debug(&format!("opening {} as conn {}", uri, conn_id));
                    let writer = self.connector.connect(conn_id, endpoint, self.events_tx.clone());
                    self.slots.insert(uri, Slot { conn, conn_id, writer });
                }
                Err(e) => {
                    log::warn!("[RUNTIME] cannot open {}: {}", uri, e);
                    self.engine.on_close(&uri, ConnectionStats::default(), Some(&e), now);
                }
            }
        }
    }

    fn close_slot(&mut self, uri: &str, error: Option<StratumError>, now: Instant) {
        if let Some(mut slot) = self.slots.remove(uri) {
            self.debug(&format!("closing {} (conn {})", uri, slot.conn_id));
            slot.conn.close(error, now, &mut self.engine);
        }
    }

    fn flush_outbound(&mut self) {
        for (uri, slot) in self.slots.iter_mut() {
            for line in slot.conn.take_outbound() {
                if slot.writer.send(line).is_err() {
                    log::trace!("[RUNTIME] {} writer gone, close pending", uri);
                    break;
                }
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        self.slots
            .values()
            .filter_map(|slot| slot.conn.next_deadline())
            .fold(self.next_housekeeping, Instant::min)
    }

    fn uri_for(&self, conn_id: ConnId) -> Option<String> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.conn_id == conn_id)
            .map(|(uri, _)| uri.clone())
    }

    fn t(&self) -> u128 {
        self.t0.elapsed().as_micros()
    }

    fn info(&self, msg: &str) {
        log::info!("[RUNTIME] {:>8}us: {}", self.t(), msg);
    }

    fn debug(&self, msg: &str) {
        log::debug!("[RUNTIME] {:>8}us: {}", self.t(), msg);
    }

    fn trace(&self, msg: &str) {
        log::trace!("[RUNTIME] {:>8}us: {}", self.t(), msg);
    }
}

//! Wallet sync engine.
//!
//! [`EngineState`] is the functional core of the sync: it owns the address
//! and transaction caches, decides which server connection does what, and
//! folds replies back into the caches. It never touches a socket. Every
//! timing decision uses the `Instant` the runtime passes in.
//!
//! Connections talk to it through [`StratumOwner`]. When several
//! connections watch the same address, only the one that most recently
//! reported a status for it (its *owner*) issues follow-up fetches.

mod logic;
pub mod state;
pub mod types;


use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bitcoin::Txid;

use crate::config::RuntimeConfig;
use crate::error::StratumError;
use crate::streaming::cache::connection_cache::lock;
use crate::streaming::cache::SharedConnectionCache;
use crate::streaming::electrum::connection::{Completed, ConnectionStats, StratumOwner};
use crate::streaming::electrum::protocol::{Notification, StratumTask};
use crate::streaming::types::{DerivedAddress, ScriptHash};

pub use state::{AddressEntry, EngineSnapshot, EngineState, TransactionEntry};
pub use types::{AddressSource, EngineCallbacks};

impl EngineState {
    pub fn new(
        config: Arc<RuntimeConfig>,
        cache: SharedConnectionCache,
        mut source: Box<dyn AddressSource>,
        callbacks: Box<dyn EngineCallbacks>,
    ) -> Self {
        let engine_id = lock(&cache).register_engine();
        let initial = source.initial_addresses();

        let mut engine = Self {
            config,
            cache,
            engine_id,
            source,
            callbacks,
            active: false,
            height: 0,
            address_order: Vec::new(),
            addresses: HashMap::new(),
            transactions: HashMap::new(),
            tx_heights: HashMap::new(),
            missing_txs: BTreeMap::new(),
            missing_headers: BTreeMap::new(),
            servers: HashMap::new(),
            owners: HashMap::new(),
            cooling: HashMap::new(),
            pending_broadcasts: VecDeque::new(),
            last_progress: None,
            dirty: false,
        };
        for address in initial {
            engine.add_address(address);
        }
        log::info!("[ENGINE] created with {} addresses", engine.addresses.len());
        engine
    }

    /// Starts syncing. Returns the server URIs the runtime should open.
    pub fn connect(&mut self, now: Instant) -> Vec<String> {
        log::info!("[ENGINE] connect");
        self.active = true;
        self.report_progress();
        self.refill_servers(now)
    }

    /// Stops syncing. Returns the URIs of every connection to close; their
    /// close callbacks tidy up the per-server state.
    pub fn disconnect(&mut self) -> Vec<String> {
        log::info!("[ENGINE] disconnect ({} connections)", self.servers.len());
        self.active = false;
        self.last_progress = None;
        self.report_progress();
        self.servers.keys().cloned().collect()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Picks servers to bring the pool back up to size. Each returned URI
    /// is registered as a connection the runtime must now open.
    pub fn refill_servers(&mut self, now: Instant) -> Vec<String> {
        if !self.active {
            return Vec::new();
        }
        let cooldown = self.config.reconnect_cooldown();
        self.cooling
            .retain(|_, closed| now.saturating_duration_since(*closed) < cooldown);

        let need = self.config.pool_size.saturating_sub(self.servers.len());
        if need == 0 {
            return Vec::new();
        }

        let excluded: HashSet<&str> = self
            .servers
            .keys()
            .chain(self.cooling.keys())
            .map(String::as_str)
            .collect();
        let picked = lock(&self.cache).get_servers(need, &self.config.ignored_servers, &excluded);

        for uri in &picked {
            log::debug!("[ENGINE] adding server {}", uri);
            self.servers.insert(uri.clone(), Default::default());
        }
        if !picked.is_empty() {
            log::info!(
                "[ENGINE] pool {}/{} after refill",
                self.servers.len(),
                self.config.pool_size
            );
        }
        picked
    }

    /// Starts tracking an address. Returns `false` if it was already known.
    pub fn add_address(&mut self, address: DerivedAddress) -> bool {
        if self.addresses.contains_key(&address.script_hash) {
            return false;
        }
        log::trace!(
            "[ENGINE] tracking {} ({})",
            address.display_address,
            address.derivation_path
        );
        self.address_order.push(address.script_hash);
        self.addresses.insert(
            address.script_hash,
            AddressEntry {
                display_address: address.display_address,
                derivation_path: address.derivation_path,
                ..Default::default()
            },
        );
        self.dirty = true;
        true
    }

    /// Queues a raw transaction (hex) for the next connection with room.
    pub fn broadcast(&mut self, raw_tx_hex: String) {
        log::info!("[ENGINE] queueing broadcast ({} bytes)", raw_tx_hex.len() / 2);
        self.pending_broadcasts.push_back(raw_tx_hex);
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn address(&self, script_hash: &ScriptHash) -> Option<&AddressEntry> {
        self.addresses.get(script_hash)
    }

    pub fn addresses(&self) -> impl Iterator<Item = (&ScriptHash, &AddressEntry)> {
        self.address_order
            .iter()
            .filter_map(|h| self.addresses.get(h).map(|entry| (h, entry)))
    }

    pub fn transaction(&self, txid: &Txid) -> Option<&TransactionEntry> {
        self.transactions.get(txid)
    }

    pub fn balance(&self) -> u64 {
        self.addresses.values().map(AddressEntry::balance).sum()
    }

    pub fn owner_of(&self, script_hash: &ScriptHash) -> Option<&str> {
        self.owners.get(script_hash).map(String::as_str)
    }

    pub fn server_uris(&self) -> impl Iterator<Item = &String> {
        self.servers.keys()
    }

    pub fn missing_txids(&self) -> impl Iterator<Item = &Txid> {
        self.missing_txs.keys()
    }

    /// True if the caches changed since the last [`Self::take_snapshot`].
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Copies the caches out for saving and clears the dirty flag.
    pub fn take_snapshot(&mut self) -> EngineSnapshot {
        self.dirty = false;
        EngineSnapshot {
            height: self.height,
            addresses: self
                .address_order
                .iter()
                .filter_map(|h| self.addresses.get(h).map(|entry| (*h, entry.clone())))
                .collect(),
            transactions: self
                .transactions
                .iter()
                .map(|(txid, tx)| (*txid, tx.clone()))
                .collect(),
        }
    }

    /// Loads previously saved caches. Used addresses are reported to the
    /// address source again so the gap window covers them.
    pub fn restore(&mut self, snapshot: EngineSnapshot) {
        log::info!(
            "[ENGINE] restoring {} addresses, {} transactions",
            snapshot.addresses.len(),
            snapshot.transactions.len()
        );
        self.height = self.height.max(snapshot.height);

        for (txid, tx) in snapshot.transactions {
            if let Some(height) = tx.height {
                self.tx_heights.insert(txid, height);
            }
            self.transactions.insert(txid, tx);
        }

        let mut used = Vec::new();
        for (hash, entry) in snapshot.addresses {
            if entry.used {
                used.push(hash);
            }
            if !self.addresses.contains_key(&hash) {
                self.address_order.push(hash);
            }
            self.addresses.insert(hash, entry);
        }

        for hash in used {
            for address in self.source.mark_address_used(&hash) {
                self.add_address(address);
            }
        }

        let missing: Vec<Txid> = self
            .addresses
            .values()
            .flat_map(|entry| entry.txids.iter())
            .filter(|txid| !self.transactions.contains_key(*txid))
            .copied()
            .collect();
        for txid in missing {
            self.missing_txs.entry(txid).or_default();
        }

        self.dirty = false;
        self.last_progress = None;
    }
}

impl StratumOwner for EngineState {
    fn on_queue_space(&mut self, uri: &str, now: Instant) -> Option<StratumTask> {
        self.pick_task(uri, now)
    }

    fn on_reply(&mut self, uri: &str, done: Completed, now: Instant) -> Result<(), StratumError> {
        self.handle_reply(uri, done, now)
    }

    fn on_notification(
        &mut self,
        uri: &str,
        notification: Notification,
        now: Instant,
    ) -> Result<(), StratumError> {
        match notification {
            Notification::Header(header) => self.on_header(uri, header),
            Notification::ScriptHashStatus {
                script_hash,
                status,
            } => {
                self.on_status(uri, script_hash, status, now);
                Ok(())
            }
        }
    }

    fn on_close(&mut self, uri: &str, stats: ConnectionStats, error: Option<&StratumError>, now: Instant) {
        self.handle_close(uri, stats, error, now);
    }
}

impl Drop for EngineState {
    fn drop(&mut self) {
        lock(&self.cache).unregister_engine(self.engine_id);
    }
}

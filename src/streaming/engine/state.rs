use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::streaming::cache::{EngineId, SharedConnectionCache};
use crate::streaming::electrum::protocol::StatusHash;
use crate::streaming::engine::types::{AddressSource, EngineCallbacks};
use crate::streaming::types::{ScriptHash, Utxo};

/// Everything the engine knows about one wallet address.
///
/// The stratum hashes record which server status the cached `txids` and
/// `utxos` correspond to. `None` matches a server status of `null`, i.e.
/// an address with no history, so fresh addresses need no fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AddressEntry {
    pub txids: BTreeSet<Txid>,
    pub txid_stratum_hash: StatusHash,
    pub utxos: BTreeSet<Utxo>,
    pub utxo_stratum_hash: StatusHash,
    /// Only ever goes from `false` to `true`.
    pub used: bool,
    pub display_address: String,
    pub derivation_path: String,
}

impl AddressEntry {
    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|u| u.value).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEntry {
    #[serde(with = "hex::serde")]
    pub raw: Vec<u8>,
    /// Unix seconds.
    pub first_seen: u64,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Subscribe sent, no answer yet.
    Requested,
    Known(StatusHash),
}

/// One address as seen through one connection.
#[derive(Debug, Clone)]
pub struct AddressSubscription {
    pub status: SubscriptionStatus,
    /// Set while a history fetch is in flight, holding the status it was
    /// issued for.
    pub fetching_txids: Option<StatusHash>,
    pub fetching_utxos: Option<StatusHash>,
    pub last_update: Instant,
}

impl AddressSubscription {
    pub fn requested(now: Instant) -> Self {
        Self {
            status: SubscriptionStatus::Requested,
            fetching_txids: None,
            fetching_utxos: None,
            last_update: now,
        }
    }

    pub fn known_status(&self) -> Option<&StatusHash> {
        match &self.status {
            SubscriptionStatus::Known(status) => Some(status),
            SubscriptionStatus::Requested => None,
        }
    }
}

/// Per-connection view, created when a connection is picked and dropped
/// when it closes.
#[derive(Debug, Clone, Default)]
pub struct ServerConnectionState {
    pub height: Option<u32>,
    pub headers_subscribed: bool,
    pub addresses: HashMap<ScriptHash, AddressSubscription>,
    /// Txids this server has mentioned in a history reply.
    pub known_txids: HashSet<Txid>,
    /// Position in the engine's address list up to which subscribe
    /// requests were issued.
    pub subscribe_cursor: usize,
    /// Addresses whose subscribe failed and must be sent again.
    pub resubscribe: VecDeque<ScriptHash>,
    /// Lookups this server already refused; asked elsewhere instead.
    pub failed_txids: HashSet<Txid>,
    pub failed_headers: HashSet<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingFetch {
    pub fetching: bool,
}

/// Persisted form of the address and transaction caches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub height: u32,
    pub addresses: Vec<(ScriptHash, AddressEntry)>,
    pub transactions: BTreeMap<Txid, TransactionEntry>,
}

pub struct EngineState {
    pub(super) config: Arc<RuntimeConfig>,
    pub(super) cache: SharedConnectionCache,
    pub(super) engine_id: EngineId,
    pub(super) source: Box<dyn AddressSource>,
    pub(super) callbacks: Box<dyn EngineCallbacks>,

    pub(super) active: bool,
    pub(super) height: u32,

    /// Append-only; connections walk it with their subscribe cursor.
    pub(super) address_order: Vec<ScriptHash>,
    pub(super) addresses: HashMap<ScriptHash, AddressEntry>,
    pub(super) transactions: HashMap<Txid, TransactionEntry>,
    /// Confirmation heights learned from history replies.
    pub(super) tx_heights: HashMap<Txid, u32>,
    pub(super) missing_txs: BTreeMap<Txid, PendingFetch>,
    pub(super) missing_headers: BTreeMap<u32, PendingFetch>,

    pub(super) servers: HashMap<String, ServerConnectionState>,
    /// Which connection may issue follow-up fetches for an address.
    pub(super) owners: HashMap<ScriptHash, String>,
    /// Servers closed recently, with the close time.
    pub(super) cooling: HashMap<String, Instant>,

    pub(super) pending_broadcasts: VecDeque<String>,
    pub(super) last_progress: Option<f64>,
    pub(super) dirty: bool,
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("active", &self.active)
            .field("height", &self.height)
            .field("addresses", &self.addresses.len())
            .field("transactions", &self.transactions.len())
            .field("servers", &self.servers.keys().collect::<Vec<_>>())
            .finish()
    }
}

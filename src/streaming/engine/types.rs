use bitcoin::Txid;

use crate::error::StratumError;
use crate::streaming::types::{DerivedAddress, ScriptHash};

/// The key-derivation side of the wallet.
///
/// The engine never derives keys itself. It asks for the starting window of
/// addresses once, then reports every address whose history turns out to
/// be non-empty so the source can extend its gap window.
pub trait AddressSource: Send {
    fn initial_addresses(&mut self) -> Vec<DerivedAddress>;

    /// Returns whatever new addresses the gap limit now requires.
    fn mark_address_used(&mut self, script_hash: &ScriptHash) -> Vec<DerivedAddress>;
}

/// Events the engine raises for its caller.
pub trait EngineCallbacks: Send {
    /// Total confirmed + unconfirmed balance across every address, in sats.
    fn on_balance_changed(&mut self, balance: u64);

    fn on_height_changed(&mut self, height: u32);

    /// Transactions that were fetched or had their confirmation height set.
    fn on_transactions_changed(&mut self, txids: &[Txid]);

    /// Fraction of addresses fully synced, in `[0, 1]`.
    fn on_addresses_checked(&mut self, ratio: f64);

    fn on_broadcast(&mut self, result: Result<Txid, StratumError>) {
        match result {
            Ok(txid) => log::info!("[ENGINE] broadcast accepted: {}", txid),
            Err(e) => log::warn!("[ENGINE] broadcast failed: {}", e),
        }
    }
}

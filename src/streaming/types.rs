use bitcoin::hashes::{sha256, Hash};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::error::StratumError;

/// sha256 of an output script; the key for every per-address structure.
pub type ScriptHash = sha256::Hash;

/// Hashes a script the way Electrum servers index it.
pub fn script_hash(script: &[u8]) -> ScriptHash {
    sha256::Hash::hash(script)
}

/// Convert a script hash to electrum scripthash hex (little endian).
pub fn to_electrum_hex(hash: &ScriptHash) -> String {
    let mut bytes = hash.to_byte_array();
    bytes.reverse();
    hex::encode(bytes)
}

/// Inverse of [`to_electrum_hex`].
pub fn from_electrum_hex(s: &str) -> Result<ScriptHash, StratumError> {
    let mut bytes = hex::decode(s).map_err(StratumError::protocol)?;
    bytes.reverse();
    sha256::Hash::from_slice(&bytes).map_err(StratumError::protocol)
}

/// An address handed to the engine by the key-derivation collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    pub script_hash: ScriptHash,
    pub display_address: String,
    pub derivation_path: String,
}

/// One unspent output as reported by `blockchain.scripthash.listunspent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: u64,
}

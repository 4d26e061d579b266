//! Stratum (Electrum) wire format.
//!
//! One JSON object per line. Requests carry `{id, method, params}`, replies
//! carry the same `id` plus `result` (or `error`), notifications carry
//! `method` and `params` but no `id`.

use bitcoin::consensus::{deserialize, Decodable};
use bitcoin::{block, Transaction, Txid};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::StratumError;
use crate::streaming::types::{from_electrum_hex, to_electrum_hex, ScriptHash, Utxo};

pub const CLIENT_NAME: &str = "stratum-sync";
pub const PROTOCOL_VERSION: &str = "1.4";

/// Status hash of a script's history. `None` means the script has no history.
pub type StatusHash = Option<String>;

/// Everything the engine can ask a server for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumTask {
    /// Handshake and keepalive ping.
    Version,
    SubscribeHeaders,
    SubscribeScriptHash(ScriptHash),
    GetHistory(ScriptHash),
    ListUnspent(ScriptHash),
    GetTransaction(Txid),
    GetHeader(u32),
    /// Raw transaction hex.
    Broadcast(String),
}

impl StratumTask {
    pub fn method(&self) -> &'static str {
        match self {
            StratumTask::Version => "server.version",
            StratumTask::SubscribeHeaders => "blockchain.headers.subscribe",
            StratumTask::SubscribeScriptHash(_) => "blockchain.scripthash.subscribe",
            StratumTask::GetHistory(_) => "blockchain.scripthash.get_history",
            StratumTask::ListUnspent(_) => "blockchain.scripthash.listunspent",
            StratumTask::GetTransaction(_) => "blockchain.transaction.get",
            StratumTask::GetHeader(_) => "blockchain.block.get_header",
            StratumTask::Broadcast(_) => "blockchain.transaction.broadcast",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            StratumTask::Version => json!([CLIENT_NAME, PROTOCOL_VERSION]),
            StratumTask::SubscribeHeaders => json!([]),
            StratumTask::SubscribeScriptHash(hash)
            | StratumTask::GetHistory(hash)
            | StratumTask::ListUnspent(hash) => json!([to_electrum_hex(hash)]),
            StratumTask::GetTransaction(txid) => json!([txid.to_string()]),
            StratumTask::GetHeader(height) => json!([height]),
            StratumTask::Broadcast(raw) => json!([raw]),
        }
    }
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

/// Serializes one request as a newline-terminated line.
pub fn encode_request(id: u64, task: &StratumTask) -> Result<String, StratumError> {
    let mut line = serde_json::to_string(&Request {
        id,
        method: task.method(),
        params: task.params(),
    })?;
    line.push('\n');
    Ok(line)
}

/// A decoded inbound line.
#[derive(Debug)]
pub enum Incoming {
    Reply {
        id: u64,
        result: Result<Value, StratumError>,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

pub fn decode_message(line: &str) -> Result<Incoming, StratumError> {
    let mut msg: Value = serde_json::from_str(line)?;
    let obj = msg
        .as_object_mut()
        .ok_or_else(|| StratumError::protocol("message is not an object"))?;

    let id = match obj.get("id") {
        Some(Value::Null) | None => None,
        Some(id) => Some(
            id.as_u64()
                .ok_or_else(|| StratumError::protocol("reply id is not numeric"))?,
        ),
    };

    if let Some(id) = id {
        if let Some(error) = obj.get("error").filter(|e| !e.is_null()) {
            return Ok(Incoming::Reply {
                id,
                result: Err(StratumError::Server(error.to_string())),
            });
        }

        let result = obj
            .remove("result")
            .ok_or_else(|| StratumError::protocol("reply without result"))?;
        return Ok(Incoming::Reply { id, result: Ok(result) });
    }

    let method = obj
        .get("method")
        .and_then(|m| m.as_str())
        .ok_or_else(|| StratumError::protocol("message has neither id nor method"))?
        .to_string();

    let params = match obj.remove("params") {
        Some(Value::Array(params)) => params,
        _ => Vec::new(),
    };

    Ok(Incoming::Notification { method, params })
}

// =====================================================================
// Notifications
// =====================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeaderInfo {
    pub height: u32,
    pub hex: String,
}

impl HeaderInfo {
    /// Block time taken from the raw 80-byte header.
    pub fn timestamp(&self) -> Result<u32, StratumError> {
        header_time_from_hex(&self.hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Header(HeaderInfo),
    ScriptHashStatus {
        script_hash: ScriptHash,
        status: StatusHash,
    },
}

/// Interprets an unsolicited message. Only `*.subscribe` methods mean
/// anything to us; everything else yields `Ok(None)`.
pub fn parse_notification(
    method: &str,
    params: Vec<Value>,
) -> Result<Option<Notification>, StratumError> {
    match method {
        "blockchain.headers.subscribe" => {
            let header = params
                .into_iter()
                .next()
                .ok_or_else(|| StratumError::protocol("header notification without params"))?;
            Ok(Some(Notification::Header(parse_header_info(header)?)))
        }
        "blockchain.scripthash.subscribe" => {
            let mut params = params.into_iter();
            let hash = params
                .next()
                .and_then(|v| v.as_str().map(str::to_owned))
                .ok_or_else(|| StratumError::protocol("scripthash notification without hash"))?;
            let status = parse_status(params.next().unwrap_or(Value::Null))?;
            Ok(Some(Notification::ScriptHashStatus {
                script_hash: from_electrum_hex(&hash)?,
                status,
            }))
        }
        other => {
            log::trace!("[STRATUM] ignoring notification {}", other);
            Ok(None)
        }
    }
}

// =====================================================================
// Reply parsers
// =====================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HistoryItem {
    pub tx_hash: Txid,
    /// `<= 0` means unconfirmed.
    pub height: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnspentItem {
    pub tx_hash: Txid,
    pub tx_pos: u32,
    pub height: i64,
    pub value: u64,
}

impl From<UnspentItem> for Utxo {
    fn from(item: UnspentItem) -> Self {
        Utxo {
            txid: item.tx_hash,
            vout: item.tx_pos,
            value: item.value,
        }
    }
}

pub fn parse_status(value: Value) -> Result<StatusHash, StratumError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(StratumError::protocol(format!("bad status hash {}", other))),
    }
}

pub fn parse_header_info(value: Value) -> Result<HeaderInfo, StratumError> {
    serde_json::from_value(value).map_err(StratumError::protocol)
}

pub fn parse_history(value: Value) -> Result<Vec<HistoryItem>, StratumError> {
    serde_json::from_value(value).map_err(StratumError::protocol)
}

pub fn parse_unspent(value: Value) -> Result<Vec<UnspentItem>, StratumError> {
    serde_json::from_value(value).map_err(StratumError::protocol)
}

/// Decodes a raw transaction and checks it really is `expected`.
pub fn parse_transaction(value: Value, expected: &Txid) -> Result<Vec<u8>, StratumError> {
    let hex_str = value
        .as_str()
        .ok_or_else(|| StratumError::protocol("tx result is not a string"))?;
    let raw = hex::decode(hex_str).map_err(StratumError::protocol)?;
    let tx: Transaction = deserialize(&raw).map_err(StratumError::protocol)?;

    let txid = tx.compute_txid();
    if &txid != expected {
        return Err(StratumError::Dishonest(format!(
            "asked for {} but got {}",
            expected, txid
        )));
    }
    Ok(raw)
}

/// `blockchain.block.get_header` answers either with a header object
/// carrying `timestamp` or with the raw header hex.
pub fn parse_header_timestamp(value: Value) -> Result<u32, StratumError> {
    match value {
        Value::String(hex_str) => header_time_from_hex(&hex_str),
        Value::Object(obj) => obj
            .get("timestamp")
            .and_then(|t| t.as_u64())
            .and_then(|t| u32::try_from(t).ok())
            .ok_or_else(|| StratumError::protocol("header without timestamp")),
        other => Err(StratumError::protocol(format!("bad header {}", other))),
    }
}

pub fn parse_broadcast(value: Value) -> Result<Txid, StratumError> {
    let s = value
        .as_str()
        .ok_or_else(|| StratumError::protocol("broadcast result is not a string"))?;
    s.parse().map_err(StratumError::protocol)
}

fn header_time_from_hex(hex_str: &str) -> Result<u32, StratumError> {
    let bytes = hex::decode(hex_str).map_err(StratumError::protocol)?;
    let header =
        block::Header::consensus_decode(&mut &bytes[..]).map_err(StratumError::protocol)?;
    Ok(header.time)
}

#[cfg(test)]
mod tests;

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Witness,
};
use serde_json::json;

use super::*;
use crate::streaming::types::script_hash;

fn fake_tx(value: u64) -> Transaction {
    Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

fn header_hex(time: u32) -> String {
    let header = Header {
        version: BlockVersion::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: TxMerkleNode::all_zeros(),
        time,
        bits: CompactTarget::from_consensus(0x1d00ffff),
        nonce: 0,
    };
    hex::encode(bitcoin::consensus::serialize(&header))
}

#[test]
fn request_is_one_json_line() {
    let hash = script_hash(b"script");
    let line = encode_request(7, &StratumTask::GetHistory(hash)).unwrap();

    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1);

    let v: Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(v["id"], 7);
    assert_eq!(v["method"], "blockchain.scripthash.get_history");
    assert_eq!(v["params"][0], to_electrum_hex(&hash));
}

#[test]
fn reply_with_result_and_null_result() {
    match decode_message(r#"{"id":3,"result":"abc"}"#).unwrap() {
        Incoming::Reply { id, result } => {
            assert_eq!(id, 3);
            assert_eq!(result.unwrap(), json!("abc"));
        }
        other => panic!("unexpected {:?}", other),
    }

    match decode_message(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap() {
        Incoming::Reply { result, .. } => assert_eq!(result.unwrap(), Value::Null),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn reply_with_error_object() {
    match decode_message(r#"{"id":5,"error":{"code":1,"message":"nope"}}"#).unwrap() {
        Incoming::Reply { id, result } => {
            assert_eq!(id, 5);
            assert!(matches!(result, Err(StratumError::Server(_))));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn malformed_lines_are_protocol_errors() {
    assert!(decode_message("not json").is_err());
    assert!(decode_message("[1,2]").is_err());
    assert!(decode_message(r#"{"id":"x","result":1}"#).is_err());
    assert!(decode_message(r#"{"id":1}"#).is_err());
    assert!(decode_message(r#"{"params":[]}"#).is_err());
}

#[test]
fn scripthash_notification_round_trips_hash() {
    let hash = script_hash(b"watched");
    let msg = format!(
        r#"{{"method":"blockchain.scripthash.subscribe","params":["{}","deadbeef"]}}"#,
        to_electrum_hex(&hash)
    );

    let Incoming::Notification { method, params } = decode_message(&msg).unwrap() else {
        panic!("expected notification");
    };
    let parsed = parse_notification(&method, params).unwrap();
    assert_eq!(
        parsed,
        Some(Notification::ScriptHashStatus {
            script_hash: hash,
            status: Some("deadbeef".to_string()),
        })
    );
}

#[test]
fn header_notification_and_timestamp() {
    let params = vec![json!({"height": 812_000, "hex": header_hex(1_700_000_000)})];
    let Some(Notification::Header(info)) =
        parse_notification("blockchain.headers.subscribe", params).unwrap()
    else {
        panic!("expected header");
    };
    assert_eq!(info.height, 812_000);
    assert_eq!(info.timestamp().unwrap(), 1_700_000_000);
}

#[test]
fn unrelated_notifications_are_ignored() {
    assert_eq!(parse_notification("server.peers.subscribe", vec![]).unwrap(), None);
    assert_eq!(parse_notification("blockchain.relayfee", vec![]).unwrap(), None);
}

#[test]
fn transaction_bytes_are_cross_checked() {
    let tx = fake_tx(1000);
    let raw = bitcoin::consensus::serialize(&tx);
    let txid = tx.compute_txid();

    let bytes = parse_transaction(json!(hex::encode(&raw)), &txid).unwrap();
    assert_eq!(bytes, raw);

    let other = fake_tx(2000).compute_txid();
    assert!(matches!(
        parse_transaction(json!(hex::encode(&raw)), &other),
        Err(StratumError::Dishonest(_))
    ));
}

#[test]
fn history_and_unspent_parse() {
    let txid = fake_tx(1).compute_txid();
    let history = parse_history(json!([{"tx_hash": txid.to_string(), "height": 100}])).unwrap();
    assert_eq!(history, vec![HistoryItem { tx_hash: txid, height: 100 }]);

    let unspent = parse_unspent(json!([
        {"tx_hash": txid.to_string(), "tx_pos": 1, "height": 0, "value": 5000}
    ]))
    .unwrap();
    let utxo: Utxo = unspent[0].clone().into();
    assert_eq!(utxo, Utxo { txid, vout: 1, value: 5000 });

    assert!(parse_history(json!({"tx_hash": 1})).is_err());
}

#[test]
fn header_timestamp_accepts_object_or_hex() {
    assert_eq!(parse_header_timestamp(json!({"timestamp": 1234})).unwrap(), 1234);
    assert_eq!(parse_header_timestamp(json!(header_hex(99))).unwrap(), 99);
    assert!(parse_header_timestamp(json!(5)).is_err());
}

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::*;
use crate::streaming::types::{script_hash, to_electrum_hex};

// =========================================================================
// Helpers
// =========================================================================

#[derive(Default)]
struct MockOwner {
    tasks: VecDeque<StratumTask>,
    replies: Vec<(StratumTask, Result<Value, String>)>,
    notifications: Vec<Notification>,
    closes: Vec<(ConnectionStats, Option<String>)>,
    reject_replies: bool,
}

impl StratumOwner for MockOwner {
    fn on_queue_space(&mut self, _uri: &str, _now: Instant) -> Option<StratumTask> {
        self.tasks.pop_front()
    }

    fn on_reply(&mut self, _uri: &str, done: Completed, _now: Instant) -> Result<(), StratumError> {
        self.replies
            .push((done.task, done.result.map_err(|e| e.to_string())));
        if self.reject_replies {
            return Err(StratumError::protocol("rejected"));
        }
        Ok(())
    }

    fn on_notification(
        &mut self,
        _uri: &str,
        notification: Notification,
        _now: Instant,
    ) -> Result<(), StratumError> {
        self.notifications.push(notification);
        Ok(())
    }

    fn on_close(&mut self, _uri: &str, stats: ConnectionStats, error: Option<&StratumError>, _now: Instant) {
        self.closes.push((stats, error.map(|e| e.to_string())));
    }
}

fn config(queue_size: usize) -> ConnectionConfig {
    ConnectionConfig {
        queue_size,
        timeout: Duration::from_secs(30),
        keepalive: Duration::from_secs(60),
        max_line_len: MAX_LINE_LEN,
    }
}

fn sent(conn: &mut StratumConnection) -> Vec<(u64, String)> {
    conn.take_outbound()
        .iter()
        .map(|line| {
            let v: Value = serde_json::from_str(line.trim_end()).unwrap();
            (v["id"].as_u64().unwrap(), v["method"].as_str().unwrap().to_string())
        })
        .collect()
}

fn open_conn(queue_size: usize, owner: &mut MockOwner, now: Instant) -> StratumConnection {
    let mut conn = StratumConnection::new("electrum://example.com:50001", config(queue_size));
    conn.open().unwrap();
    conn.on_connect(now, owner);
    conn
}

// =========================================================================
// Tests
// =========================================================================

#[test]
fn endpoint_parsing() {
    let tls = Endpoint::parse("electrums://host.example:50002").unwrap();
    assert_eq!(tls.scheme, Scheme::Tls);
    assert_eq!(tls.host, "host.example");
    assert_eq!(tls.port, 50002);

    let plain = Endpoint::parse("electrum://10.0.0.1:50001/").unwrap();
    assert_eq!(plain.scheme, Scheme::Plain);

    for bad in [
        "tcp://host:1",
        "electrum://host",
        "electrum://:50001",
        "electrum://host:notaport",
        "electrum://host:0",
    ] {
        assert!(matches!(Endpoint::parse(bad), Err(StratumError::InvalidUri(_))), "{}", bad);
    }
}

#[test]
fn open_rejects_bad_uri_and_stays_idle() {
    let mut conn = StratumConnection::new("ssl://host:1", config(10));
    assert!(conn.open().is_err());
    assert_eq!(conn.state(), ConnectionState::Idle);
}

#[test]
fn connect_handshakes_then_fills_queue() {
    let now = Instant::now();
    let mut owner = MockOwner::default();
    owner.tasks.extend((1..=5).map(StratumTask::GetHeader));

    let mut conn = open_conn(3, &mut owner, now);
    assert_eq!(conn.state(), ConnectionState::Open);

    let lines = sent(&mut conn);
    assert_eq!(lines[0], (1, "server.version".to_string()));
    assert_eq!(lines.len(), 3, "queue limit caps in-flight requests");
    assert_eq!(owner.tasks.len(), 3);

    // A reply frees one slot, which is refilled straight away.
    conn.on_data(b"{\"id\":1,\"result\":[\"x\",\"1.4\"]}\n", now, &mut owner)
        .unwrap();
    assert_eq!(sent(&mut conn), vec![(4, "blockchain.block.get_header".to_string())]);
    assert_eq!(owner.tasks.len(), 2);
}

#[test]
fn partial_lines_are_buffered() {
    let now = Instant::now();
    let mut owner = MockOwner::default();
    let mut conn = open_conn(10, &mut owner, now);
    sent(&mut conn);

    conn.on_data(b"{\"id\":1,\"res", now, &mut owner).unwrap();
    assert!(owner.replies.is_empty());
    assert_eq!(conn.pending_len(), 1);

    conn.on_data(b"ult\":null}\n\n", now, &mut owner).unwrap();
    assert_eq!(owner.replies.len(), 1);
    assert_eq!(owner.replies[0].0, StratumTask::Version);
    assert_eq!(conn.pending_len(), 0);
}

#[test]
fn long_reply_in_small_chunks_is_decoded() {
    let now = Instant::now();
    let mut owner = MockOwner::default();
    owner.tasks.push_back(StratumTask::GetHeader(7));
    let mut conn = open_conn(10, &mut owner, now);
    sent(&mut conn);

    let big = "ab".repeat(50_000);
    let stream = format!(
        "{{\"id\":1,\"result\":null}}\n{{\"id\":2,\"result\":\"{}\"}}\n",
        big
    );
    for chunk in stream.as_bytes().chunks(7) {
        conn.on_data(chunk, now, &mut owner).unwrap();
    }

    assert_eq!(owner.replies.len(), 2);
    assert_eq!(owner.replies[1], (StratumTask::GetHeader(7), Ok(Value::from(big))));
    assert_eq!(conn.pending_len(), 0);
}

#[test]
fn overlong_line_fails_the_connection() {
    let now = Instant::now();
    let mut owner = MockOwner::default();
    let mut conn = StratumConnection::new(
        "electrum://example.com:50001",
        ConnectionConfig {
            max_line_len: 64,
            ..config(10)
        },
    );
    conn.open().unwrap();
    conn.on_connect(now, &mut owner);

    conn.on_data(&[b'x'; 40], now, &mut owner).unwrap();
    let err = conn.on_data(&[b'x'; 40], now, &mut owner).unwrap_err();
    assert!(matches!(err, StratumError::Protocol(_)));

    conn.close(Some(err), now, &mut owner);
    assert_eq!(owner.closes[0].0.bad_messages, 1);
}

#[test]
fn replies_match_by_id_in_any_order() {
    let now = Instant::now();
    let mut owner = MockOwner::default();
    owner.tasks.extend([StratumTask::GetHeader(10), StratumTask::GetHeader(20)]);
    let mut conn = open_conn(10, &mut owner, now);
    sent(&mut conn);

    conn.on_data(b"{\"id\":3,\"result\":\"b\"}\n{\"id\":2,\"result\":\"a\"}\n", now, &mut owner)
        .unwrap();

    assert_eq!(owner.replies[0], (StratumTask::GetHeader(20), Ok(Value::from("b"))));
    assert_eq!(owner.replies[1], (StratumTask::GetHeader(10), Ok(Value::from("a"))));
}

#[test]
fn unknown_id_fails_the_connection() {
    let now = Instant::now();
    let mut owner = MockOwner::default();
    let mut conn = open_conn(10, &mut owner, now);

    let err = conn
        .on_data(b"{\"id\":99,\"result\":1}\n", now, &mut owner)
        .unwrap_err();
    assert!(matches!(err, StratumError::UnknownId(99)));

    conn.close(Some(err), now, &mut owner);
    let (stats, error) = &owner.closes[0];
    assert_eq!(stats.bad_messages, 1);
    assert_eq!(stats.disconnects, 1);
    assert!(error.is_some());
}

#[test]
fn notifications_bypass_the_request_table() {
    let now = Instant::now();
    let mut owner = MockOwner::default();
    let mut conn = open_conn(10, &mut owner, now);

    let hash = script_hash(b"addr");
    let line = format!(
        "{{\"method\":\"blockchain.scripthash.subscribe\",\"params\":[\"{}\",null]}}\n",
        to_electrum_hex(&hash)
    );
    conn.on_data(line.as_bytes(), now, &mut owner).unwrap();

    assert_eq!(
        owner.notifications,
        vec![Notification::ScriptHashStatus { script_hash: hash, status: None }]
    );
    assert_eq!(conn.pending_len(), 1, "version request still pending");
}

#[test]
fn owner_rejection_fails_the_connection() {
    let now = Instant::now();
    let mut owner = MockOwner {
        reject_replies: true,
        ..Default::default()
    };
    let mut conn = open_conn(10, &mut owner, now);
    assert!(conn.on_data(b"{\"id\":1,\"result\":1}\n", now, &mut owner).is_err());
}

#[test]
fn timed_out_request_fails_without_closing() {
    let t0 = Instant::now();
    let mut owner = MockOwner::default();
    owner.tasks.extend((1..=6).map(StratumTask::GetHeader));

    let mut conn = open_conn(10, &mut owner, t0);
    assert_eq!(conn.pending_ids(), vec![1, 2, 3, 4, 5, 6, 7]);
    sent(&mut conn);

    conn.on_timer(t0 + Duration::from_secs(29), &mut owner).unwrap();
    assert!(owner.replies.is_empty());

    conn.on_timer(t0 + Duration::from_millis(30_500), &mut owner).unwrap();

    assert_eq!(conn.state(), ConnectionState::Open);
    assert!(conn.pending_ids().is_empty());
    let (task, result) = owner.replies.last().unwrap();
    assert_eq!(*task, StratumTask::GetHeader(6));
    assert!(result.as_ref().unwrap_err().contains("timed out"));
    assert!(owner.closes.is_empty());
}

#[test]
fn keepalive_after_sixty_seconds() {
    let t0 = Instant::now();
    let mut owner = MockOwner::default();
    let mut conn = open_conn(10, &mut owner, t0);
    conn.on_data(b"{\"id\":1,\"result\":null}\n", t0, &mut owner).unwrap();
    sent(&mut conn);

    assert_eq!(conn.next_deadline(), Some(t0 + Duration::from_secs(60)));

    conn.on_timer(t0 + Duration::from_secs(59), &mut owner).unwrap();
    assert!(sent(&mut conn).is_empty());

    conn.on_timer(t0 + Duration::from_secs(60), &mut owner).unwrap();
    assert_eq!(sent(&mut conn), vec![(2, "server.version".to_string())]);
}

#[test]
fn deadline_tracks_earliest_pending_timeout() {
    let t0 = Instant::now();
    let mut owner = MockOwner::default();
    let conn = open_conn(10, &mut owner, t0);
    assert_eq!(conn.next_deadline(), Some(t0 + Duration::from_secs(30)));

    let idle = StratumConnection::new("electrum://a:1", config(10));
    assert_eq!(idle.next_deadline(), None);
}

#[test]
fn close_fails_in_flight_and_reports_stats() {
    let t0 = Instant::now();
    let mut owner = MockOwner::default();
    owner.tasks.push_back(StratumTask::GetHeader(1));
    let mut conn = open_conn(10, &mut owner, t0);

    conn.on_data(
        b"{\"id\":1,\"result\":null}\n",
        t0 + Duration::from_millis(200),
        &mut owner,
    )
    .unwrap();
    conn.close(None, t0 + Duration::from_secs(1), &mut owner);

    assert_eq!(conn.state(), ConnectionState::Closed);
    let (task, result) = owner.replies.last().unwrap();
    assert_eq!(*task, StratumTask::GetHeader(1));
    assert_eq!(result.as_ref().unwrap_err(), "connection closed");

    let (stats, error) = &owner.closes[0];
    assert_eq!(stats.good_messages, 1);
    assert_eq!(stats.disconnects, 0);
    assert_eq!(stats.average_latency, Some(Duration::from_millis(200)));
    assert!(error.is_none());

    // A second close is a no-op.
    conn.close(None, t0, &mut owner);
    assert_eq!(owner.closes.len(), 1);
}

#[test]
fn deferred_requests_replay_after_reopen() {
    let t0 = Instant::now();
    let mut owner = MockOwner::default();
    let mut conn = open_conn(10, &mut owner, t0);
    conn.close(Some(StratumError::Closed), t0, &mut owner);

    conn.submit(StratumTask::Broadcast("00".to_string()), t0);
    assert!(conn.take_outbound().is_empty());

    conn.open().unwrap();
    conn.on_connect(t0, &mut owner);

    let methods: Vec<String> = sent(&mut conn).into_iter().map(|(_, m)| m).collect();
    assert_eq!(methods, vec!["server.version", "blockchain.transaction.broadcast"]);
}

#[test]
fn ids_keep_increasing_across_reopen() {
    let t0 = Instant::now();
    let mut owner = MockOwner::default();
    let mut conn = open_conn(10, &mut owner, t0);
    conn.close(None, t0, &mut owner);
    conn.open().unwrap();
    conn.on_connect(t0, &mut owner);

    let lines = sent(&mut conn);
    assert_eq!(lines.last().unwrap().0, 2);
}

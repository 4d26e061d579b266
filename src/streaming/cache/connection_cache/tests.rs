use std::path::Path;
use std::time::Instant;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use super::*;
use crate::persistence::read_json;

fn config_in(dir: &Path) -> RuntimeConfig {
    RuntimeConfig {
        data_dir: dir.to_path_buf(),
        default_servers: vec![
            "electrum://one.example:50001".to_string(),
            "electrums://two.example:50002".to_string(),
        ],
        ..RuntimeConfig::default()
    }
}

/// Serves exactly one HTTP response and returns the URL to hit.
async fn serve_once(status: &'static str, body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = stream.read(&mut buf).await;
        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        let _ = stream.shutdown().await;
    });
    format!("http://{}/servers", addr)
}

#[test]
fn missing_files_fall_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ConnectionCache::load(&config_in(dir.path()));

    assert_eq!(cache.servers().len(), 2);
    assert!(cache.servers().get("electrum://one.example:50001").unwrap().never_tried());
    assert_eq!(cache.height(), 0);
    assert!(cache.is_dirty());
}

#[test]
fn corrupt_files_fall_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(config.headers_path(), b"[1,2").unwrap();
    std::fs::write(config.servers_path(), b"\"nope\"").unwrap();

    let cache = ConnectionCache::load(&config);
    assert_eq!(cache.servers().len(), 2);
    assert_eq!(cache.height(), 0);
}

#[test]
fn flush_waits_for_every_engine() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let mut cache = ConnectionCache::load(&config);

    let a = cache.register_engine();
    let b = cache.register_engine();
    cache.report_progress(a, 1.0);
    cache.report_progress(b, 0.5);

    cache.flush();
    assert!(!config.servers_path().exists());
    assert!(cache.is_dirty());

    cache.report_progress(b, 1.0);
    cache.flush();
    assert!(config.servers_path().exists());
    assert!(!cache.is_dirty());

    // An engine that went away no longer blocks saving.
    let c = cache.register_engine();
    cache.update_height(10);
    cache.flush();
    assert!(cache.is_dirty());
    cache.unregister_engine(c);
    cache.flush();
    assert!(!cache.is_dirty());
}

#[test]
fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let now = Instant::now();

    let mut cache = ConnectionCache::load(&config);
    cache.server_score_up("electrum://one.example:50001", 42.0, now);
    cache.update_height(800_000);
    cache.update_height(799_999);
    cache.insert_header(799_990, 1_700_000_000);
    cache.flush();

    let headers: HeaderCache = read_json(&config.headers_path()).unwrap();
    assert_eq!(headers.height, 800_000);

    let reloaded = ConnectionCache::load(&config);
    assert_eq!(reloaded.height(), 800_000);
    assert_eq!(reloaded.header_timestamp(799_990), Some(1_700_000_000));
    let info = reloaded.servers().get("electrum://one.example:50001").unwrap();
    assert_eq!(info.score, 1);
    assert_eq!(info.response_time_ms, 42.0);
    assert!(!reloaded.is_dirty());
}

#[test]
fn merge_adds_new_and_demotes_absent() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = ConnectionCache::load(&config_in(dir.path()));

    let added = cache.merge_server_list(&[
        "electrum://one.example:50001".to_string(),
        "electrum://three.example:50001".to_string(),
    ]);
    assert_eq!(added, 1);
    assert_eq!(cache.servers().len(), 3);
    assert_eq!(cache.servers().get("electrum://one.example:50001").unwrap().score, 0);
    assert_eq!(
        cache.servers().get("electrums://two.example:50002").unwrap().score,
        -100,
        "absent servers are demoted, never deleted"
    );
}

#[test]
fn server_list_shapes() {
    let list = json!(["electrum://a:1", "electrum://b:1", 7]);
    assert_eq!(
        parse_server_list(&list, "BTC"),
        Some(vec!["electrum://a:1".to_string(), "electrum://b:1".to_string()])
    );

    let keyed = json!({ "BTC": ["electrum://a:1"], "LTC": ["electrum://l:1"] });
    assert_eq!(
        parse_server_list(&keyed, "LTC"),
        Some(vec!["electrum://l:1".to_string()])
    );
    assert_eq!(parse_server_list(&keyed, "DOGE"), None);
    assert_eq!(parse_server_list(&json!({ "BTC": "x" }), "BTC"), None);
    assert_eq!(parse_server_list(&json!("electrum://a:1"), "BTC"), None);
}

#[tokio::test]
async fn fetch_merges_a_good_list() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let cache = ConnectionCache::load(&config).into_shared();

    let body = json!(["electrum://one.example:50001", "electrum://new.example:50001"]).to_string();
    let url = serve_once("200 OK", body).await;

    let added = fetch_stratum_servers(&cache, &reqwest::Client::new(), &url, "BTC").await;
    assert_eq!(added, Some(1));
    assert!(lock(&cache).servers().get("electrum://new.example:50001").is_some());
    assert!(config.servers_path().exists(), "merged list is persisted");
}

#[tokio::test]
async fn fetch_keeps_list_on_bad_status() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ConnectionCache::load(&config_in(dir.path())).into_shared();

    let url = serve_once("500 Internal Server Error", "[]".to_string()).await;
    let added = fetch_stratum_servers(&cache, &reqwest::Client::new(), &url, "BTC").await;

    assert_eq!(added, None);
    let guard = lock(&cache);
    assert_eq!(guard.servers().len(), 2);
    assert_eq!(guard.servers().get("electrums://two.example:50002").unwrap().score, 0);
}

#[tokio::test]
async fn fetch_keeps_list_on_unexpected_body() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ConnectionCache::load(&config_in(dir.path())).into_shared();

    let url = serve_once("200 OK", "{\"servers\":42}".to_string()).await;
    let added = fetch_stratum_servers(&cache, &reqwest::Client::new(), &url, "BTC").await;

    assert_eq!(added, None);
    assert_eq!(lock(&cache).servers().len(), 2);
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bdk_wallet::bitcoin::{Network, Txid};
use clap::Parser;

use stratum_sync::config::RuntimeConfig;
use stratum_sync::persistence::{read_json, read_json_or};
use stratum_sync::streaming::cache::connection_cache::{fetch_stratum_servers, lock};
use stratum_sync::streaming::cache::{ConnectionCache, SharedConnectionCache};
use stratum_sync::streaming::domain::{DerivedSpkTracker, RawKeys};
use stratum_sync::streaming::electrum::TcpConnector;
use stratum_sync::streaming::engine::{EngineCallbacks, EngineSnapshot, EngineState};
use stratum_sync::streaming::runtime::SyncOrchestrator;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "bitcoin")]
    network: Network,

    /// JSON runtime config; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON file with any of `seed`, `xprv`, `xpub`.
    #[arg(long)]
    keys: Option<PathBuf>,

    #[arg(long)]
    seed: Option<String>,

    #[arg(long)]
    xprv: Option<String>,

    #[arg(long)]
    xpub: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Server URI (`electrum://host:port` or `electrums://host:port`).
    /// Repeat for several.
    #[arg(long = "server")]
    servers: Vec<String>,

    #[arg(long)]
    info_server: Option<String>,

    #[arg(long)]
    pool_size: Option<usize>,

    #[arg(long, default_value_t = 20)]
    gap_limit: u32,
}

/// Logs everything the engine reports and notes when the first full sync
/// completes.
struct LogCallbacks {
    t0: Instant,
    synced: bool,
}

impl EngineCallbacks for LogCallbacks {
    fn on_balance_changed(&mut self, balance: u64) {
        log::info!("[MAIN] balance: {} sats", balance);
    }

    fn on_height_changed(&mut self, height: u32) {
        log::info!("[MAIN] height: {}", height);
    }

    fn on_transactions_changed(&mut self, txids: &[Txid]) {
        for txid in txids {
            log::info!("[MAIN] transaction: {}", txid);
        }
    }

    fn on_addresses_checked(&mut self, ratio: f64) {
        log::debug!("[MAIN] addresses checked: {:.0}%", ratio * 100.0);
        if ratio >= 1.0 && !self.synced {
            self.synced = true;
            log::info!("[MAIN] initial sync completed in {:?}", self.t0.elapsed());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Arc::new(build_config(&args)?);
    log::info!(
        "[MAIN] {} on {:?}, data in {}",
        config.currency_code,
        args.network,
        config.data_dir.display()
    );

    let cache = ConnectionCache::load(&config).into_shared();
    let refresher = spawn_server_refresh(config.clone(), cache.clone());

    let keys = load_keys(&args)?.to_wallet_keys()?;
    let (external, internal) = keys.descriptors(args.network)?;
    if !keys.can_sign() {
        log::info!("[MAIN] watch-only wallet");
    }

    let mut tracker = DerivedSpkTracker::<u32>::new(args.gap_limit, args.network);
    tracker.insert_descriptor(0, external, 0);
    tracker.insert_descriptor(1, internal, 0);

    let callbacks = LogCallbacks {
        t0: Instant::now(),
        synced: false,
    };
    let mut engine = EngineState::new(config.clone(), cache.clone(), Box::new(tracker), Box::new(callbacks));
    let snapshot: EngineSnapshot = read_json_or(&config.engine_path(), EngineSnapshot::default);
    engine.restore(snapshot);

    let (orchestrator, handle) = SyncOrchestrator::new(
        config.clone(),
        cache.clone(),
        engine,
        TcpConnector::new(CONNECT_TIMEOUT),
    );
    let mut run = tokio::spawn(orchestrator.run());

    let finished = tokio::select! {
        result = &mut run => Some(result?),
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            None
        }
    };
    let engine = match finished {
        Some(engine) => engine,
        None => {
            log::info!("[MAIN] ctrl-c, disconnecting");
            handle.disconnect();
            run.await?
        }
    };

    if let Some(refresher) = refresher {
        refresher.abort();
    }
    lock(&cache).flush();

    println!("-----------------------------------");
    println!("Height:           {}", engine.height());
    println!("Addresses:        {}", engine.addresses().count());
    println!("Total Balance:    {} sats", engine.balance());
    println!("-----------------------------------");
    Ok(())
}

/// Config file (if any) first, then command-line overrides.
fn build_config(args: &Args) -> Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if !args.servers.is_empty() {
        config.default_servers = args.servers.clone();
    }
    if let Some(url) = &args.info_server {
        config.info_server = Some(url.clone());
    }
    if let Some(size) = args.pool_size {
        config.pool_size = size;
    }
    Ok(config)
}

/// Keys from the keys file, with any key typed on the command line taking
/// precedence.
fn load_keys(args: &Args) -> Result<RawKeys> {
    let stored = match &args.keys {
        Some(path) => read_json::<RawKeys>(path)
            .with_context(|| format!("reading keys {}", path.display()))?,
        None => RawKeys::default(),
    };
    Ok(stored.merge(RawKeys {
        seed: args.seed.clone(),
        xprv: args.xprv.clone(),
        xpub: args.xpub.clone(),
    }))
}

/// Polls the info endpoint at start-up and then periodically.
fn spawn_server_refresh(
    config: Arc<RuntimeConfig>,
    cache: SharedConnectionCache,
) -> Option<tokio::task::JoinHandle<()>> {
    let url = config.info_server.clone()?;
    Some(tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut interval = tokio::time::interval(config.server_refresh().max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            match fetch_stratum_servers(&cache, &client, &url, &config.currency_code).await {
                Some(added) => log::info!("[MAIN] server list refreshed, {} new", added),
                None => log::debug!("[MAIN] server list unchanged"),
            }
        }
    }))
}

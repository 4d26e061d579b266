//! Task picking and reply handling for [`EngineState`].

use std::collections::BTreeSet;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bitcoin::Txid;

use crate::error::StratumError;
use crate::streaming::cache::connection_cache::lock;
use crate::streaming::electrum::connection::{Completed, ConnectionStats};
use crate::streaming::electrum::protocol::{
    parse_broadcast, parse_header_info, parse_header_timestamp, parse_history, parse_status,
    parse_transaction, parse_unspent, HeaderInfo, HistoryItem, StatusHash, StratumTask,
    UnspentItem,
};
use crate::streaming::engine::state::{
    AddressSubscription, EngineState, SubscriptionStatus, TransactionEntry,
};
use crate::streaming::types::{ScriptHash, Utxo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    History,
    Unspent,
}

/// Failures worth retrying on the same connection.
fn is_transient(e: &StratumError) -> bool {
    matches!(e, StratumError::Timeout(_) | StratumError::Closed)
}

impl EngineState {
    // =====================================================================
    // Task picking
    // =====================================================================

    /// Next request for connection `uri`, in priority order: broadcasts,
    /// header subscription, address subscriptions, owner fetches, missing
    /// transactions, missing headers.
    pub(super) fn pick_task(&mut self, uri: &str, now: Instant) -> Option<StratumTask> {
        if !self.active || !self.servers.contains_key(uri) {
            return None;
        }

        if let Some(raw) = self.pending_broadcasts.pop_front() {
            return Some(StratumTask::Broadcast(raw));
        }

        let conn = self.servers.get_mut(uri)?;
        if !conn.headers_subscribed {
            conn.headers_subscribed = true;
            return Some(StratumTask::SubscribeHeaders);
        }

        self.next_subscription(uri, now)
            .or_else(|| self.next_address_fetch(uri))
            .or_else(|| self.next_missing_tx(uri))
            .or_else(|| self.next_missing_header(uri))
    }

    fn next_subscription(&mut self, uri: &str, now: Instant) -> Option<StratumTask> {
        let conn = self.servers.get_mut(uri)?;
        let hash = match conn.resubscribe.pop_front() {
            Some(hash) => hash,
            None => {
                let hash = *self.address_order.get(conn.subscribe_cursor)?;
                conn.subscribe_cursor += 1;
                hash
            }
        };
        conn.addresses
            .insert(hash, AddressSubscription::requested(now));
        Some(StratumTask::SubscribeScriptHash(hash))
    }

    /// A history or unspent fetch for an address this connection owns whose
    /// reported status differs from what the cache holds.
    fn next_address_fetch(&mut self, uri: &str) -> Option<StratumTask> {
        let conn = self.servers.get(uri)?;

        let mut choice = None;
        for hash in &self.address_order {
            if self.owners.get(hash).map(String::as_str) != Some(uri) {
                continue;
            }
            let (Some(sub), Some(entry)) = (conn.addresses.get(hash), self.addresses.get(hash)) else {
                continue;
            };
            let Some(status) = sub.known_status() else {
                continue;
            };

            if *status != entry.txid_stratum_hash
                && sub.fetching_txids.is_none()
                && !self.fetching_elsewhere(uri, hash, FetchKind::History)
            {
                choice = Some((*hash, FetchKind::History, status.clone()));
                break;
            }
            if *status != entry.utxo_stratum_hash
                && sub.fetching_utxos.is_none()
                && !self.fetching_elsewhere(uri, hash, FetchKind::Unspent)
            {
                choice = Some((*hash, FetchKind::Unspent, status.clone()));
                break;
            }
        }

        let (hash, kind, status) = choice?;
        let sub = self.servers.get_mut(uri)?.addresses.get_mut(&hash)?;
        log::trace!("[ENGINE] {} fetching {:?} for {}", uri, kind, hash);
        match kind {
            FetchKind::History => {
                sub.fetching_txids = Some(status);
                Some(StratumTask::GetHistory(hash))
            }
            FetchKind::Unspent => {
                sub.fetching_utxos = Some(status);
                Some(StratumTask::ListUnspent(hash))
            }
        }
    }

    /// Whether a connection other than `uri` already has this fetch in
    /// flight. Ownership can move while a fetch is running.
    fn fetching_elsewhere(&self, uri: &str, hash: &ScriptHash, kind: FetchKind) -> bool {
        self.servers
            .iter()
            .filter(|(other, _)| other.as_str() != uri)
            .filter_map(|(_, conn)| conn.addresses.get(hash))
            .any(|sub| match kind {
                FetchKind::History => sub.fetching_txids.is_some(),
                FetchKind::Unspent => sub.fetching_utxos.is_some(),
            })
    }

    /// A missing transaction nobody is fetching. Servers that mentioned the
    /// txid are preferred; when no live server did, anyone may try.
    fn next_missing_tx(&mut self, uri: &str) -> Option<StratumTask> {
        let conn = self.servers.get(uri)?;
        let txid = self
            .missing_txs
            .iter()
            .filter(|(txid, pending)| !pending.fetching && !conn.failed_txids.contains(*txid))
            .map(|(txid, _)| *txid)
            .find(|txid| {
                conn.known_txids.contains(txid)
                    || !self.servers.values().any(|c| c.known_txids.contains(txid))
            })?;

        self.missing_txs.get_mut(&txid)?.fetching = true;
        Some(StratumTask::GetTransaction(txid))
    }

    fn next_missing_header(&mut self, uri: &str) -> Option<StratumTask> {
        let conn = self.servers.get(uri)?;
        let height = self
            .missing_headers
            .iter()
            .find(|(height, pending)| !pending.fetching && !conn.failed_headers.contains(*height))
            .map(|(height, _)| *height)?;

        self.missing_headers.get_mut(&height)?.fetching = true;
        Some(StratumTask::GetHeader(height))
    }

    // =====================================================================
    // Replies
    // =====================================================================

    /// Folds one reply (or request failure) into the caches. An `Err`
    /// return fails the connection.
    pub(super) fn handle_reply(
        &mut self,
        uri: &str,
        done: Completed,
        now: Instant,
    ) -> Result<(), StratumError> {
        let Completed {
            task,
            result,
            latency,
        } = done;

        if result.is_ok() {
            lock(&self.cache).server_score_up(uri, latency.as_secs_f64() * 1000.0, now);
        }

        match task {
            StratumTask::Version => {
                if let Err(e) = result {
                    log::debug!("[ENGINE] {} version query failed: {}", uri, e);
                }
                Ok(())
            }

            StratumTask::SubscribeHeaders => match result {
                Ok(value) => self.on_header(uri, parse_header_info(value)?),
                Err(e) if is_transient(&e) => {
                    if let Some(conn) = self.servers.get_mut(uri) {
                        conn.headers_subscribed = false;
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },

            StratumTask::SubscribeScriptHash(hash) => match result {
                Ok(value) => {
                    let status = parse_status(value)?;
                    self.on_status(uri, hash, status, now);
                    Ok(())
                }
                Err(e) if is_transient(&e) => {
                    if let Some(conn) = self.servers.get_mut(uri) {
                        conn.addresses.remove(&hash);
                        conn.resubscribe.push_back(hash);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },

            StratumTask::GetHistory(hash) => {
                let requested = self.take_fetch_flag(uri, &hash, FetchKind::History);
                match result {
                    Ok(value) => self.on_history(uri, hash, requested, parse_history(value)?),
                    Err(e) if is_transient(&e) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            StratumTask::ListUnspent(hash) => {
                let requested = self.take_fetch_flag(uri, &hash, FetchKind::Unspent);
                match result {
                    Ok(value) => {
                        self.on_unspent(hash, requested, parse_unspent(value)?);
                        Ok(())
                    }
                    Err(e) if is_transient(&e) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            StratumTask::GetTransaction(txid) => {
                if let Some(pending) = self.missing_txs.get_mut(&txid) {
                    pending.fetching = false;
                }
                match result {
                    Ok(value) => {
                        let raw = parse_transaction(value, &txid)?;
                        self.on_transaction(txid, raw);
                        Ok(())
                    }
                    Err(e) => {
                        log::debug!("[ENGINE] {} could not fetch {}: {}", uri, txid, e);
                        if !is_transient(&e) {
                            if let Some(conn) = self.servers.get_mut(uri) {
                                conn.known_txids.remove(&txid);
                                conn.failed_txids.insert(txid);
                            }
                        }
                        Ok(())
                    }
                }
            }

            StratumTask::GetHeader(height) => {
                if let Some(pending) = self.missing_headers.get_mut(&height) {
                    pending.fetching = false;
                }
                match result {
                    Ok(value) => {
                        let timestamp = parse_header_timestamp(value)?;
                        lock(&self.cache).insert_header(height, timestamp);
                        self.missing_headers.remove(&height);
                        Ok(())
                    }
                    Err(e) => {
                        log::debug!("[ENGINE] {} could not fetch header {}: {}", uri, height, e);
                        if !is_transient(&e) {
                            if let Some(conn) = self.servers.get_mut(uri) {
                                conn.failed_headers.insert(height);
                            }
                        }
                        Ok(())
                    }
                }
            }

            StratumTask::Broadcast(raw) => {
                match result {
                    Ok(value) => self.callbacks.on_broadcast(parse_broadcast(value)),
                    Err(StratumError::Closed) => {
                        log::debug!("[ENGINE] {} closed before broadcast completed, requeueing", uri);
                        self.pending_broadcasts.push_front(raw);
                    }
                    Err(e) => self.callbacks.on_broadcast(Err(e)),
                }
                Ok(())
            }
        }
    }

    fn take_fetch_flag(&mut self, uri: &str, hash: &ScriptHash, kind: FetchKind) -> Option<StatusHash> {
        let sub = self.servers.get_mut(uri)?.addresses.get_mut(hash)?;
        match kind {
            FetchKind::History => sub.fetching_txids.take(),
            FetchKind::Unspent => sub.fetching_utxos.take(),
        }
    }

    /// A status from a subscribe reply or notification. This is the only
    /// place ownership changes hands: the reporting connection takes over
    /// when nobody owns the address or its report is strictly newer than
    /// the owner's. The incumbent keeps ties.
    pub(super) fn on_status(&mut self, uri: &str, hash: ScriptHash, status: StatusHash, now: Instant) {
        if !self.addresses.contains_key(&hash) {
            log::debug!("[ENGINE] {} reported unknown script hash {}", uri, hash);
            return;
        }
        let Some(conn) = self.servers.get_mut(uri) else {
            return;
        };

        let sub = conn
            .addresses
            .entry(hash)
            .or_insert_with(|| AddressSubscription::requested(now));
        // A repeat of the status this connection already reported is not news.
        if sub.known_status() != Some(&status) {
            sub.last_update = now;
        }
        sub.status = SubscriptionStatus::Known(status);
        let reported = sub.last_update;

        let take_over = match self.owners.get(&hash) {
            None => true,
            Some(owner) if owner == uri => false,
            Some(owner) => match self.servers.get(owner).and_then(|c| c.addresses.get(&hash)) {
                Some(theirs) if theirs.known_status().is_some() => reported > theirs.last_update,
                _ => true,
            },
        };
        if take_over {
            match self.owners.insert(hash, uri.to_string()) {
                Some(previous) => log::debug!("[ENGINE] {} ownership {} -> {}", hash, previous, uri),
                None => log::trace!("[ENGINE] {} owned by {}", hash, uri),
            }
        }

        self.report_progress();
    }

    pub(super) fn on_header(&mut self, uri: &str, header: HeaderInfo) -> Result<(), StratumError> {
        let timestamp = header.timestamp()?;
        let height = header.height;

        if let Some(conn) = self.servers.get_mut(uri) {
            conn.height = Some(height);
        }
        {
            let mut cache = lock(&self.cache);
            cache.update_height(height);
            cache.insert_header(height, timestamp);
        }
        self.missing_headers.remove(&height);

        if height > self.height {
            log::info!("[ENGINE] height {} -> {} (from {})", self.height, height, uri);
            self.height = height;
            self.dirty = true;
            self.callbacks.on_height_changed(height);
        }
        Ok(())
    }

    fn on_history(
        &mut self,
        uri: &str,
        hash: ScriptHash,
        requested: Option<StatusHash>,
        items: Vec<HistoryItem>,
    ) -> Result<(), StratumError> {
        if let Some(conn) = self.servers.get_mut(uri) {
            conn.known_txids.extend(items.iter().map(|item| item.tx_hash));
        }

        let mut confirmed = Vec::new();
        {
            let cache = lock(&self.cache);
            for item in &items {
                let txid = item.tx_hash;
                if let Ok(height) = u32::try_from(item.height) {
                    if height > 0 && self.tx_heights.insert(txid, height) != Some(height) {
                        if let Some(tx) = self.transactions.get_mut(&txid) {
                            tx.height = Some(height);
                            confirmed.push(txid);
                        }
                        if cache.header_timestamp(height).is_none() {
                            self.missing_headers.entry(height).or_default();
                        }
                    }
                }
                if !self.transactions.contains_key(&txid) {
                    self.missing_txs.entry(txid).or_default();
                }
            }
        }

        let Some(entry) = self.addresses.get_mut(&hash) else {
            return Ok(());
        };
        entry.txids.extend(items.iter().map(|item| item.tx_hash));
        if let Some(status) = requested {
            entry.txid_stratum_hash = status;
        }
        self.dirty = true;

        if !items.is_empty() && !entry.used {
            entry.used = true;
            log::debug!("[ENGINE] {} is now used", entry.display_address);
            for address in self.source.mark_address_used(&hash) {
                self.add_address(address);
            }
        }

        if !confirmed.is_empty() {
            self.callbacks.on_transactions_changed(&confirmed);
        }
        self.report_progress();
        Ok(())
    }

    fn on_unspent(&mut self, hash: ScriptHash, requested: Option<StatusHash>, items: Vec<UnspentItem>) {
        let utxos: BTreeSet<Utxo> = items.into_iter().map(Utxo::from).collect();

        let Some(entry) = self.addresses.get_mut(&hash) else {
            return;
        };
        if let Some(status) = requested {
            entry.utxo_stratum_hash = status;
            self.dirty = true;
        }
        if entry.utxos != utxos {
            log::debug!(
                "[ENGINE] {} utxos changed ({} -> {})",
                entry.display_address,
                entry.utxos.len(),
                utxos.len()
            );
            entry.utxos = utxos;
            self.dirty = true;
            let balance = self.balance();
            self.callbacks.on_balance_changed(balance);
        }
        self.report_progress();
    }

    fn on_transaction(&mut self, txid: Txid, raw: Vec<u8>) {
        self.missing_txs.remove(&txid);
        if self.transactions.contains_key(&txid) {
            return;
        }

        let first_seen = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.transactions.insert(
            txid,
            TransactionEntry {
                raw,
                first_seen,
                height: self.tx_heights.get(&txid).copied(),
            },
        );
        self.dirty = true;
        log::debug!("[ENGINE] stored transaction {}", txid);

        self.callbacks.on_transactions_changed(&[txid]);
        self.report_progress();
    }

    // =====================================================================
    // Close & progress
    // =====================================================================

    pub(super) fn handle_close(
        &mut self,
        uri: &str,
        stats: ConnectionStats,
        error: Option<&StratumError>,
        now: Instant,
    ) {
        if self.servers.remove(uri).is_none() {
            return;
        }
        log::info!(
            "[ENGINE] lost {} (good {}, bad {}, latency {:?})",
            uri,
            stats.good_messages,
            stats.bad_messages,
            stats.average_latency
        );

        if error.is_some() || stats.bad_messages > 0 {
            lock(&self.cache).server_score_down(uri, now);
        }
        self.cooling.insert(uri.to_string(), now);

        let orphaned: Vec<ScriptHash> = self
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == uri)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in orphaned {
            self.owners.remove(&hash);
            let successor = self
                .servers
                .iter()
                .filter_map(|(other, conn)| {
                    let sub = conn.addresses.get(&hash)?;
                    sub.known_status().map(|_| (sub.last_update, other))
                })
                .max_by_key(|(last_update, _)| *last_update)
                .map(|(_, other)| other.clone());
            if let Some(successor) = successor {
                log::debug!("[ENGINE] {} ownership {} -> {}", hash, uri, successor);
                self.owners.insert(hash, successor);
            }
        }

        self.report_progress();
    }

    /// Fraction of addresses whose owner's status matches both cached
    /// hashes and whose transactions are all present.
    pub fn progress(&self) -> f64 {
        if self.addresses.is_empty() {
            return 1.0;
        }
        let synced = self
            .address_order
            .iter()
            .filter(|hash| self.is_synced(hash))
            .count();
        synced as f64 / self.addresses.len() as f64
    }

    fn is_synced(&self, hash: &ScriptHash) -> bool {
        let (Some(owner), Some(entry)) = (self.owners.get(hash), self.addresses.get(hash)) else {
            return false;
        };
        let Some(status) = self
            .servers
            .get(owner)
            .and_then(|conn| conn.addresses.get(hash))
            .and_then(AddressSubscription::known_status)
        else {
            return false;
        };
        *status == entry.txid_stratum_hash
            && *status == entry.utxo_stratum_hash
            && entry.txids.iter().all(|txid| self.transactions.contains_key(txid))
    }

    /// Pushes the progress ratio to the caller and the shared cache when it
    /// changed. An inactive engine counts as finished for the cache so it
    /// never holds back saving.
    pub(super) fn report_progress(&mut self) {
        let ratio = self.progress();
        if self.last_progress == Some(ratio) {
            return;
        }
        self.last_progress = Some(ratio);

        let cache_ratio = if self.active { ratio } else { 1.0 };
        lock(&self.cache).report_progress(self.engine_id, cache_ratio);
        self.callbacks.on_addresses_checked(ratio);
    }
}

// Gap limit + derivation tracker

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use bdk_wallet::miniscript::{Descriptor, DescriptorPublicKey};
use bitcoin::{Address, Network, ScriptBuf};

use crate::streaming::engine::AddressSource;
use crate::streaming::types::{script_hash, DerivedAddress, ScriptHash};

/// One derived output script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedSpk {
    pub script_hash: ScriptHash,
    pub script: ScriptBuf,
    /// Human readable address, or the script hex for scripts without one.
    pub address: String,
    /// `keychain/index`.
    pub path: String,
}

impl DerivedSpk {
    pub fn to_derived_address(&self) -> DerivedAddress {
        DerivedAddress {
            script_hash: self.script_hash,
            display_address: self.address.clone(),
            derivation_path: self.path.clone(),
        }
    }
}

/// Tracks derived ScriptPubKeys (SPKs) for a set of descriptors.
///
/// This struct is responsible for the "Gap Limit" logic in the wallet. It ensures that
/// we always track a window of unused addresses (the "lookahead") beyond the last known
/// used index.
///
/// Each keychain keeps its scripts in an ordered sequence where position equals
/// derivation index. Two dictionaries sit beside it:
/// - ScriptHash -> (Keychain, Index), for incoming notifications
/// - path string -> ScriptHash, for lookups by `keychain/index`
#[derive(Debug, Clone)]
pub struct DerivedSpkTracker<K> {
    /// The number of unused addresses to track ahead of the highest used index.
    lookahead: u32,
    network: Network,

    descriptors: BTreeMap<K, Descriptor<DescriptorPublicKey>>,
    branches: BTreeMap<K, Vec<DerivedSpk>>,
    by_hash: HashMap<ScriptHash, (K, u32)>,
    by_path: HashMap<String, ScriptHash>,
}

impl<K: Ord + Clone + Display> DerivedSpkTracker<K> {
    /// Creates a new tracker with the specified lookahead (gap limit) size.
    ///
    /// Common lookahead values are 20 (standard) or higher for services.
    pub fn new(lookahead: u32, network: Network) -> Self {
        Self {
            lookahead,
            network,
            descriptors: BTreeMap::new(),
            branches: BTreeMap::new(),
            by_hash: HashMap::new(),
            by_path: HashMap::new(),
        }
    }

    /// Every tracked script, keychain by keychain, in index order.
    pub fn all_spks(&self) -> impl Iterator<Item = &DerivedSpk> {
        self.branches.values().flat_map(|branch| branch.iter())
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Reverse lookup: Finds the Keychain ID and Index for a given script hash.
    pub fn index_of_spk_hash(&self, hash: &ScriptHash) -> Option<(K, u32)> {
        self.by_hash.get(hash).cloned()
    }

    pub fn spk_at(&self, keychain: &K, index: u32) -> Option<&DerivedSpk> {
        self.branches.get(keychain)?.get(index as usize)
    }

    pub fn lookup_path(&self, path: &str) -> Option<&DerivedSpk> {
        let hash = self.by_path.get(path)?;
        let (keychain, index) = self.by_hash.get(hash)?;
        self.spk_at(keychain, *index)
    }

    /// Registers or updates a descriptor for a keychain (e.g., "external").
    ///
    /// Derives the initial range of scripts from index `0` up to
    /// `next_index + lookahead` and returns the ones that are new.
    pub fn insert_descriptor(
        &mut self,
        keychain: K,
        descriptor: Descriptor<DescriptorPublicKey>,
        next_index: u32,
    ) -> Vec<DerivedSpk> {
        log::debug!("[TRACKER] keychain {} from {}: {}", keychain, next_index, descriptor);
        if let Some(old) = self.descriptors.insert(keychain.clone(), descriptor.clone()) {
            if old == descriptor {
                return vec![];
            }
            self.clear_keychain(&keychain);
        }

        self.derive_through(&keychain, next_index.saturating_add(self.lookahead))
    }

    /// Notifies the tracker that the address at `index` has been used.
    ///
    /// Extends the keychain so that `lookahead` unused scripts follow the
    /// next index, and returns the scripts derived to get there.
    pub fn mark_used_and_derive_new(&mut self, keychain: &K, index: u32) -> Vec<DerivedSpk> {
        let last = index.saturating_add(1).saturating_add(self.lookahead);
        self.derive_through(keychain, last)
    }

    /// Derives every missing index of `keychain` up to and including `last`.
    fn derive_through(&mut self, keychain: &K, last: u32) -> Vec<DerivedSpk> {
        let Some(descriptor) = self.descriptors.get(keychain) else {
            log::warn!("[TRACKER] no descriptor for keychain {}", keychain);
            return vec![];
        };

        let mut newly_derived = Vec::new();
        let start = self.branches.get(keychain).map_or(0, |b| b.len() as u32);
        for index in start..=last {
            let spk = match descriptor.at_derivation_index(index) {
                Ok(definite) => definite.script_pubkey(),
                Err(e) => {
                    log::error!("[TRACKER] cannot derive {}/{}: {}", keychain, index, e);
                    break;
                }
            };
            let address = match Address::from_script(&spk, self.network) {
                Ok(address) => address.to_string(),
                Err(_) => hex::encode(spk.as_bytes()),
            };
            newly_derived.push(DerivedSpk {
                script_hash: script_hash(spk.as_bytes()),
                script: spk,
                address,
                path: format!("{}/{}", keychain, index),
            });
        }

        let branch = self.branches.entry(keychain.clone()).or_default();
        for (offset, spk) in newly_derived.iter().enumerate() {
            let index = start + offset as u32;
            self.by_hash.insert(spk.script_hash, (keychain.clone(), index));
            self.by_path.insert(spk.path.clone(), spk.script_hash);
            branch.push(spk.clone());
        }
        if !newly_derived.is_empty() {
            log::debug!(
                "[TRACKER] keychain {} now tracks {} scripts",
                keychain,
                branch.len()
            );
        }
        newly_derived
    }

    /// Removes all tracking data for a keychain whose descriptor was replaced.
    fn clear_keychain(&mut self, keychain: &K) {
        for spk in self.branches.remove(keychain).unwrap_or_default() {
            self.by_hash.remove(&spk.script_hash);
            self.by_path.remove(&spk.path);
        }
    }
}

impl<K> AddressSource for DerivedSpkTracker<K>
where
    K: Ord + Clone + Display + Send,
{
    fn initial_addresses(&mut self) -> Vec<DerivedAddress> {
        self.all_spks().map(DerivedSpk::to_derived_address).collect()
    }

    fn mark_address_used(&mut self, hash: &ScriptHash) -> Vec<DerivedAddress> {
        let Some((keychain, index)) = self.index_of_spk_hash(hash) else {
            return vec![];
        };
        self.mark_used_and_derive_new(&keychain, index)
            .iter()
            .map(DerivedSpk::to_derived_address)
            .collect()
    }
}

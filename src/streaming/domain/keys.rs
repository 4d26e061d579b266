//! Wallet key material.
//!
//! Keys arrive as loose strings from several places (a keys file, the
//! command line). [`RawKeys`] collects them, [`RawKeys::merge`] combines
//! two sources, and [`RawKeys::to_wallet_keys`] picks the strongest key
//! present.

use std::str::FromStr;

use bdk_wallet::miniscript::{Descriptor, DescriptorPublicKey};
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// BIP84 purpose.
const PURPOSE: u32 = 84;

/// Key strings as stored or typed. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawKeys {
    /// BIP32 seed, hex.
    pub seed: Option<String>,
    /// Master extended private key.
    pub xprv: Option<String>,
    /// Account-level extended public key.
    pub xpub: Option<String>,
}

impl RawKeys {
    /// Fills in fields from `other`. Where both sides carry a field,
    /// `other` wins.
    pub fn merge(self, other: RawKeys) -> RawKeys {
        RawKeys {
            seed: other.seed.or(self.seed),
            xprv: other.xprv.or(self.xprv),
            xpub: other.xpub.or(self.xpub),
        }
    }

    /// Parses the strongest key present: seed, then xprv, then xpub.
    pub fn to_wallet_keys(&self) -> Result<WalletKeys, KeyError> {
        if let Some(seed) = &self.seed {
            return Ok(WalletKeys::Seed(hex::decode(seed.trim())?));
        }
        if let Some(xprv) = &self.xprv {
            return Ok(WalletKeys::ExtendedPrivate(Xpriv::from_str(xprv.trim())?));
        }
        if let Some(xpub) = &self.xpub {
            return Ok(WalletKeys::ExtendedPublic(Xpub::from_str(xpub.trim())?));
        }
        Err(KeyError::Missing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletKeys {
    Seed(Vec<u8>),
    ExtendedPrivate(Xpriv),
    ExtendedPublic(Xpub),
}

impl WalletKeys {
    /// Receive (`/0/*`) and change (`/1/*`) wpkh descriptors for account 0.
    pub fn descriptors(
        &self,
        network: Network,
    ) -> Result<(Descriptor<DescriptorPublicKey>, Descriptor<DescriptorPublicKey>), KeyError> {
        let account_key = match self {
            WalletKeys::Seed(seed) => account_key(&Xpriv::new_master(network, seed)?, network)?,
            WalletKeys::ExtendedPrivate(master) => account_key(master, network)?,
            WalletKeys::ExtendedPublic(xpub) => xpub.to_string(),
        };

        let external = parse_descriptor(&format!("wpkh({}/0/*)", account_key))?;
        let internal = parse_descriptor(&format!("wpkh({}/1/*)", account_key))?;
        Ok((external, internal))
    }

    pub fn can_sign(&self) -> bool {
        !matches!(self, WalletKeys::ExtendedPublic(_))
    }
}

/// `[fingerprint/84h/coinh/0h]xpub` for the first BIP84 account.
fn account_key(master: &Xpriv, network: Network) -> Result<String, KeyError> {
    let secp = Secp256k1::new();
    let coin = if network == Network::Bitcoin { 0 } else { 1 };

    let path = DerivationPath::from_str(&format!("m/{}'/{}'/0'", PURPOSE, coin))?;
    let account = master.derive_priv(&secp, &path)?;
    let xpub = Xpub::from_priv(&secp, &account);

    Ok(format!(
        "[{}/{}h/{}h/0h]{}",
        master.fingerprint(&secp),
        PURPOSE,
        coin,
        xpub
    ))
}

fn parse_descriptor(s: &str) -> Result<Descriptor<DescriptorPublicKey>, KeyError> {
    Descriptor::from_str(s).map_err(|e| KeyError::Descriptor(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "000102030405060708090a0b0c0d0e0f";
    const MASTER_XPRV: &str = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";
    const ACCOUNT_TPUB: &str = "tpubDC8msFGeGuwnKG9Upg7DM2b4DaRqg3CUZa5g8v2SRQ6K4NSkxUgd7HsL2XVWbVm39yBA4LAxysQAm397zwQSQoQgewGiYZqrA9DsP4zbQ1M";

    #[test]
    fn merge_prefers_the_argument() {
        let stored = RawKeys {
            seed: None,
            xprv: Some("stored-xprv".to_string()),
            xpub: Some("stored-xpub".to_string()),
        };
        let typed = RawKeys {
            xpub: Some("typed-xpub".to_string()),
            ..Default::default()
        };

        let merged = stored.merge(typed);
        assert_eq!(merged.seed, None);
        assert_eq!(merged.xprv.as_deref(), Some("stored-xprv"));
        assert_eq!(merged.xpub.as_deref(), Some("typed-xpub"));
    }

    #[test]
    fn strongest_key_wins() {
        let keys = RawKeys {
            seed: Some(SEED.to_string()),
            xprv: Some(MASTER_XPRV.to_string()),
            xpub: Some(ACCOUNT_TPUB.to_string()),
        };
        assert!(matches!(keys.to_wallet_keys().unwrap(), WalletKeys::Seed(_)));

        let keys = RawKeys {
            seed: None,
            ..keys
        };
        assert!(matches!(keys.to_wallet_keys().unwrap(), WalletKeys::ExtendedPrivate(_)));

        let keys = RawKeys {
            xprv: None,
            ..keys
        };
        let wallet_keys = keys.to_wallet_keys().unwrap();
        assert!(matches!(wallet_keys, WalletKeys::ExtendedPublic(_)));
        assert!(!wallet_keys.can_sign());
    }

    #[test]
    fn missing_and_malformed_keys() {
        assert!(matches!(RawKeys::default().to_wallet_keys(), Err(KeyError::Missing)));

        let bad_seed = RawKeys {
            seed: Some("not hex".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad_seed.to_wallet_keys(), Err(KeyError::Seed(_))));

        let bad_xpub = RawKeys {
            xpub: Some("xpub-nope".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad_xpub.to_wallet_keys(), Err(KeyError::Bip32(_))));
    }

    #[test]
    fn seed_and_its_master_xprv_agree() {
        let from_seed = WalletKeys::Seed(hex::decode(SEED).unwrap())
            .descriptors(Network::Bitcoin)
            .unwrap();
        let from_xprv = WalletKeys::ExtendedPrivate(Xpriv::from_str(MASTER_XPRV).unwrap())
            .descriptors(Network::Bitcoin)
            .unwrap();

        assert_eq!(from_seed, from_xprv);
        let external = from_seed.0.to_string();
        assert!(external.starts_with("wpkh([3442193e/84"));
        assert!(external.contains("]xpub"));
        assert!(from_seed.1.to_string().contains("/1/*"));
    }

    #[test]
    fn xpub_descriptors_have_no_origin() {
        let keys = WalletKeys::ExtendedPublic(Xpub::from_str(ACCOUNT_TPUB).unwrap());
        let (external, internal) = keys.descriptors(Network::Testnet).unwrap();

        assert!(external.to_string().starts_with(&format!("wpkh({}/0/*)", ACCOUNT_TPUB)));
        assert!(internal.to_string().starts_with(&format!("wpkh({}/1/*)", ACCOUNT_TPUB)));
    }
}

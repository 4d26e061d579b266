//! Wallet-side collaborators of the sync engine: key material and the
//! gap-limit address source.

pub mod keys;
pub mod spk_tracker;

pub use keys::{RawKeys, WalletKeys};
pub use spk_tracker::{DerivedSpk, DerivedSpkTracker};

//! Wallet sync over a pool of Electrum/Stratum servers.
//!
//! The pieces, leaves first:
//! - [`streaming::cache`]: server reliability scores and the shared,
//!   persisted connection cache.
//! - [`streaming::electrum`]: the line protocol and the per-connection
//!   state machine.
//! - [`streaming::engine`]: the wallet sync engine deciding what each
//!   connection does.
//! - [`streaming::runtime`]: the tokio shell that drives all of it.

pub mod config;
pub mod error;
pub mod persistence;
pub mod streaming;

pub use config::RuntimeConfig;
pub use error::{KeyError, PersistError, StratumError};

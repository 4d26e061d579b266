//! Server reliability and header caches shared across engines.

pub mod connection_cache;
pub mod server_cache;

pub use connection_cache::{ConnectionCache, EngineId, SharedConnectionCache};
pub use server_cache::{ServerCache, ServerInfo};

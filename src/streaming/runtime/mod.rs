//! Async shell around the sync engine: sockets, timers and housekeeping.

pub mod orchestrator;


pub use orchestrator::{EngineCommand, EngineHandle, SyncOrchestrator};

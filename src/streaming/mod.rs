pub mod cache;
pub mod domain;
pub mod electrum;
pub mod engine;
pub mod runtime;
pub mod types;

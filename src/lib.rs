// ABOUTME: Library root for dbsync, copying MySQL databases from a remote server to a local one
// ABOUTME: Exposes the inspector, dump strategies, orchestrator and supporting modules

pub mod config;
pub mod display;
pub mod error;
pub mod inspector;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod progress;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use config::{Config, SyncMethod};
pub use error::SyncError;
pub use models::SyncResult;
pub use orchestrator::SyncOrchestrator;
pub use strategy::{build_strategy, DumpStrategy, StrategyContext};

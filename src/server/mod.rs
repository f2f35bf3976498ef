//! Server module for live session connections.
//!
//! This module provides:
//! - Shared application state management
//! - Inbound message dispatch for connection agents
//! - The TCP listener that spawns one agent per connection

mod handlers;
mod listener;

pub use handlers::*;
pub use listener::*;

use std::sync::Arc;

use crate::config::Config;
use crate::consensus::{EngineCore, MagnitudeBoard, PriorityCalculator, VoteLedger};
use crate::hub::HubHandle;
use crate::storage::{Directory, SqliteStorage};

/// Application state shared across handlers.
///
/// The engines are built from one [`EngineCore`], so they share the
/// per-project locks and publish through the same hub.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQLite storage backend.
    pub storage: SqliteStorage,
    /// Participant and item directory.
    pub directory: Arc<dyn Directory>,
    /// Session hub front end.
    pub hub: HubHandle,
    /// Comparison vote ledger.
    pub ledger: VoteLedger,
    /// Magnitude scores and locks.
    pub magnitude: MagnitudeBoard,
    /// Final-score calculator.
    pub calculator: PriorityCalculator,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        storage: SqliteStorage,
        directory: Arc<dyn Directory>,
        hub: HubHandle,
    ) -> Self {
        let core = EngineCore::new(storage.clone(), Arc::clone(&directory), Arc::new(hub.clone()));

        tracing::info!(
            bind_addr = %config.server.bind_addr,
            outbound_buffer = config.hub.outbound_buffer,
            ping_interval_ms = config.hub.ping_interval_ms,
            "Application state initialized"
        );

        Self {
            config,
            storage,
            directory,
            hub,
            ledger: VoteLedger::new(core.clone()),
            magnitude: MagnitudeBoard::new(core.clone()),
            calculator: PriorityCalculator::new(core),
        }
    }
}

/// Shared application state type
pub type SharedState = Arc<AppState>;

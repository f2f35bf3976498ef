//! # Consensus Prioritizer
//!
//! A live group-prioritization service. Participants of a project judge every
//! pair of items on two criteria, value and complexity, and estimate each
//! item's magnitude on a fixed scale. Agreement must be unanimous. Settled
//! comparisons and locked magnitudes combine into a ranked priority list.
//!
//! ## Features
//!
//! - **Comparison sessions**: one pair per unordered item pair, settled by unanimous vote
//! - **Magnitude consensus**: per-item estimates locked on agreement or by facilitator override
//! - **Priority calculation**: win-count weights times magnitudes, ranked atomically per project
//! - **Live fan-out**: a session hub pushes every state change to connected participants
//!
//! ## Architecture
//!
//! ```text
//! Participants ⇄ ConnectionAgent (TCP, line-delimited JSON) → SessionDispatcher
//!                      ↑                                          ↓
//!                 Session Hub  ←── EventPublisher ──  VoteLedger / MagnitudeBoard
//!                                                                  ↓
//!                                                           SQLite (State)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use consensus_prioritizer::{AppState, Config, SessionServer};
//! use consensus_prioritizer::hub::Hub;
//! use consensus_prioritizer::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let (hub, _hub_task) = Hub::spawn(&config.hub);
//!     let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
//!     let directory = Arc::new(storage.clone());
//!     let state = Arc::new(AppState::new(config, storage, directory, hub));
//!     let server = SessionServer::new(state);
//!     server.run(listener, Default::default()).await?;
//!     Ok(())
//! }
//! ```

/// Configuration management for the service.
pub mod config;
/// Comparison, magnitude and priority engines.
pub mod consensus;
/// Error types and result aliases for the application.
pub mod error;
/// Session hub, wire envelopes and connection agents.
pub mod hub;
/// Connection dispatch and the TCP listener.
pub mod server;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, SessionServer, SharedState};

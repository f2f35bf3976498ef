//! Core infrastructure shared by the session engines.
//!
//! This module provides the [`EngineCore`] struct that centralizes the
//! dependencies used by the vote ledger, the magnitude board and the
//! priority calculator.

use std::sync::Arc;

use super::locks::ProjectLocks;
use crate::hub::EventPublisher;
use crate::storage::{Directory, SqliteStorage};

/// Core infrastructure shared by all session engines.
///
/// Contains the storage backend, the participant/item directory, the event
/// publisher and the per-project locks. Engines built from clones of the same
/// core share one set of project locks, which is what lets a priority
/// calculation exclude concurrent ledger mutations.
#[derive(Clone)]
pub struct EngineCore {
    /// Storage backend for persisting session state.
    storage: SqliteStorage,
    /// Read-only participant and item directory.
    directory: Arc<dyn Directory>,
    /// Sink for derived session events.
    publisher: Arc<dyn EventPublisher>,
    /// Shared per-project reader/writer locks.
    project_locks: Arc<ProjectLocks>,
}

impl EngineCore {
    /// Create a new engine core.
    pub fn new(
        storage: SqliteStorage,
        directory: Arc<dyn Directory>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            storage,
            directory,
            publisher,
            project_locks: Arc::new(ProjectLocks::new()),
        }
    }

    /// Get a reference to the storage backend.
    #[inline]
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Get a reference to the directory.
    #[inline]
    pub fn directory(&self) -> &dyn Directory {
        self.directory.as_ref()
    }

    /// Get a reference to the event publisher.
    #[inline]
    pub fn publisher(&self) -> &dyn EventPublisher {
        self.publisher.as_ref()
    }

    /// Get a reference to the project locks.
    #[inline]
    pub fn project_locks(&self) -> &ProjectLocks {
        &self.project_locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_core_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<EngineCore>();
    }

    #[test]
    fn test_engine_core_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineCore>();
    }
}

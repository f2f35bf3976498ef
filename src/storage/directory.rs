//! In-process participant and item directory.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use super::Directory;
use crate::error::StorageResult;

#[derive(Debug, Default)]
struct ProjectEntry {
    participants: BTreeSet<i64>,
    items: BTreeSet<i64>,
}

/// Directory held in memory.
///
/// Used when the engine is embedded next to a CRUD layer that pushes its
/// projects in directly, and as a fixture in tests.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    projects: RwLock<HashMap<i64, ProjectEntry>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory holding one project.
    pub fn with_project(project_id: i64, participants: &[i64], items: &[i64]) -> Self {
        let directory = Self::new();
        for &p in participants {
            directory.add_participant(project_id, p);
        }
        for &i in items {
            directory.add_item(project_id, i);
        }
        directory
    }

    /// Register a participant to a project.
    pub fn add_participant(&self, project_id: i64, participant_id: i64) {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        projects
            .entry(project_id)
            .or_default()
            .participants
            .insert(participant_id);
    }

    /// Add an item to a project.
    pub fn add_item(&self, project_id: i64, item_id: i64) {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        projects.entry(project_id).or_default().items.insert(item_id);
    }

    /// Remove an item from a project.
    pub fn remove_item(&self, project_id: i64, item_id: i64) {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = projects.get_mut(&project_id) {
            entry.items.remove(&item_id);
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn list_participants(&self, project_id: i64) -> StorageResult<Vec<i64>> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects
            .get(&project_id)
            .map(|p| p.participants.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn resolve_participant(
        &self,
        project_id: i64,
        participant_id: i64,
    ) -> StorageResult<bool> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects
            .get(&project_id)
            .is_some_and(|p| p.participants.contains(&participant_id)))
    }

    async fn list_items(&self, project_id: i64) -> StorageResult<Vec<i64>> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects
            .get(&project_id)
            .map(|p| p.items.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn resolve_item(&self, project_id: i64, item_id: i64) -> StorageResult<bool> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects
            .get(&project_id)
            .is_some_and(|p| p.items.contains(&item_id)))
    }
}

//! JSON-file mirror of a platform account. Every successful mutation is
//! written back atomically, so an interrupted run leaves a consistent file.

use super::memory::{MemoryPlatform, PlatformSnapshot};
use super::RecipePlatform;
use crate::core::error::RemoteError;
use crate::core::types::{CollectionListing, RecipeRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct SnapshotPlatform {
    path: PathBuf,
    memory: MemoryPlatform,
}

impl SnapshotPlatform {
    /// Open an existing snapshot file.
    pub fn open(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        let snapshot: PlatformSnapshot = serde_json::from_str(&content)
            .map_err(|e| format!("invalid platform snapshot {}: {}", path.display(), e))?;
        debug!(
            path = %path.display(),
            recipes = snapshot.recipes.len(),
            collections = snapshot.collections.len(),
            "opened platform snapshot"
        );
        Ok(Self {
            path: path.to_path_buf(),
            memory: MemoryPlatform::new(snapshot),
        })
    }

    pub fn snapshot(&self) -> PlatformSnapshot {
        self.memory.snapshot()
    }

    fn persist(&self) -> Result<(), RemoteError> {
        save_snapshot(&self.path, &self.memory.snapshot()).map_err(RemoteError::NonRetryable)
    }

    /// Persist after a mutation that changed state. Conflicts changed nothing.
    fn settle<T>(&self, result: Result<T, RemoteError>) -> Result<T, RemoteError> {
        let value = result?;
        self.persist()?;
        Ok(value)
    }
}

/// Write a snapshot atomically (temp file + rename).
pub fn save_snapshot(path: &Path, snapshot: &PlatformSnapshot) -> Result<(), String> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| format!("serialize error: {}", e))?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)
        .map_err(|e| format!("cannot write {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        )
    })
}

#[async_trait]
impl RecipePlatform for SnapshotPlatform {
    async fn fetch_recipes(&self) -> Result<Vec<RecipeRecord>, RemoteError> {
        self.memory.fetch_recipes().await
    }

    async fn fetch_collections(&self) -> Result<Vec<CollectionListing>, RemoteError> {
        self.memory.fetch_collections().await
    }

    async fn create_collection(&self, name: &str) -> Result<String, RemoteError> {
        let result = self.memory.create_collection(name).await;
        self.settle(result)
    }

    async fn add_member(&self, collection_id: &str, recipe_id: &str) -> Result<(), RemoteError> {
        let result = self.memory.add_member(collection_id, recipe_id).await;
        self.settle(result)
    }

    async fn remove_member(
        &self,
        collection_id: &str,
        recipe_id: &str,
    ) -> Result<(), RemoteError> {
        let result = self.memory.remove_member(collection_id, recipe_id).await;
        self.settle(result)
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<(), RemoteError> {
        let result = self.memory.delete_collection(collection_id).await;
        self.settle(result)
    }
}

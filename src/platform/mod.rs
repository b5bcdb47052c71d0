//! LD-020: Recipe platform collaborator.
//!
//! The organizer never talks to the platform directly; it goes through
//! [`RecipePlatform`]. Two implementations ship with the crate:
//! [`memory::MemoryPlatform`] (in-process, with fault injection) and
//! [`snapshot::SnapshotPlatform`] (a JSON mirror on disk, used by the CLI to
//! rehearse a reorganization offline).

pub mod memory;
pub mod snapshot;

use crate::core::error::RemoteError;
use crate::core::types::{CollectionListing, RecipeRecord, RemoteState};
use async_trait::async_trait;

/// Remote recipe/collection store.
///
/// Mutations are expected to report `RemoteError::Conflict` when they are
/// already in effect (member present, collection exists, member absent,
/// collection gone) so the executor can treat them as satisfied.
#[async_trait]
pub trait RecipePlatform: Send + Sync {
    /// All saved recipes.
    async fn fetch_recipes(&self) -> Result<Vec<RecipeRecord>, RemoteError>;

    /// All collections. Individual memberships may come back unavailable.
    async fn fetch_collections(&self) -> Result<Vec<CollectionListing>, RemoteError>;

    /// Create an empty collection; returns its id.
    async fn create_collection(&self, name: &str) -> Result<String, RemoteError>;

    async fn add_member(&self, collection_id: &str, recipe_id: &str) -> Result<(), RemoteError>;

    async fn remove_member(&self, collection_id: &str, recipe_id: &str)
        -> Result<(), RemoteError>;

    async fn delete_collection(&self, collection_id: &str) -> Result<(), RemoteError>;
}

/// Fetch collections and fold them into a [`RemoteState`].
pub async fn fetch_state(platform: &dyn RecipePlatform) -> Result<RemoteState, RemoteError> {
    let listings = platform.fetch_collections().await?;
    Ok(RemoteState::from_listings(listings))
}

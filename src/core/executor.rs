//! LD-012: Action executor — applies one planned action against the
//! platform with retry, treating "already in effect" as success.

use super::error::{ActionFailed, RemoteError};
use super::retry::{retry_async, RetryPolicy};
use super::types::{Action, CollectionListing, RemoteState};
use crate::platform::RecipePlatform;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// How an action ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The platform applied the mutation
    Applied,
    /// The mutation was already in effect (conflict response)
    AlreadySatisfied,
}

/// Collection name → remote id, seeded from the fetched state and kept
/// current as collections are created and deleted.
#[derive(Debug, Clone, Default)]
pub struct CollectionDirectory {
    ids: BTreeMap<String, String>,
}

impl CollectionDirectory {
    pub fn from_state(state: &RemoteState) -> Self {
        let mut ids = BTreeMap::new();
        for c in state.collections.values() {
            ids.entry(c.name.clone()).or_insert_with(|| c.id.clone());
        }
        Self { ids }
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.ids.get(name).map(String::as_str)
    }

    pub fn record(&mut self, name: &str, id: &str) {
        self.ids.insert(name.to_string(), id.to_string());
    }

    pub fn forget(&mut self, name: &str) {
        self.ids.remove(name);
    }
}

/// Applies actions one at a time.
pub struct ActionExecutor<'a> {
    platform: &'a dyn RecipePlatform,
    retry: RetryPolicy,
    directory: CollectionDirectory,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(platform: &'a dyn RecipePlatform, retry: RetryPolicy, directory: CollectionDirectory) -> Self {
        Self {
            platform,
            retry,
            directory,
        }
    }

    pub fn directory(&self) -> &CollectionDirectory {
        &self.directory
    }

    /// Execute one action. Transient errors are retried per policy; a
    /// conflict counts as success; anything else is an `ActionFailed`.
    pub async fn execute(&mut self, action: &Action) -> Result<ExecOutcome, ActionFailed> {
        let action_id = action.action_id();
        let collection_id = match self.resolve(action) {
            Ok(id) => id,
            Err(message) => {
                return Err(ActionFailed {
                    action_id,
                    retryable: false,
                    attempts: 0,
                    message,
                })
            }
        };

        let platform = self.platform;
        let (result, attempts) = retry_async(
            &self.retry,
            &action_id,
            RemoteError::is_retryable,
            || dispatch(platform, action, collection_id.as_deref()),
        )
        .await;

        match result {
            Ok(created) => {
                self.settle(action, created.as_deref());
                info!(action = %action, attempts, "applied");
                Ok(ExecOutcome::Applied)
            }
            Err(RemoteError::Conflict {
                message,
                existing_id,
            }) => {
                debug!(action = %action, reason = %message, "already satisfied");
                if let Action::CreateCollection { name } = action {
                    let id = match existing_id {
                        Some(id) => id,
                        None => self.lookup_remote(name).await.ok_or_else(|| ActionFailed {
                            action_id: action_id.clone(),
                            retryable: true,
                            attempts,
                            message: format!(
                                "platform reports \"{}\" exists but it is not listed",
                                name
                            ),
                        })?,
                    };
                    self.directory.record(name, &id);
                } else {
                    self.settle(action, None);
                }
                Ok(ExecOutcome::AlreadySatisfied)
            }
            Err(e) => {
                warn!(action = %action, attempts, error = %e, "action failed");
                Err(ActionFailed {
                    action_id,
                    retryable: e.is_retryable(),
                    attempts,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Remote collection id the action needs, if any.
    fn resolve(&self, action: &Action) -> Result<Option<String>, String> {
        match action {
            Action::CreateCollection { .. } => Ok(None),
            Action::AddRecipeToCollection { collection, .. } => self
                .directory
                .resolve(collection)
                .map(|id| Some(id.to_string()))
                .ok_or_else(|| format!("collection \"{}\" has no remote id", collection)),
            Action::RemoveRecipeFromCollection { collection_id, .. }
            | Action::DeleteCollection { collection_id, .. } => Ok(Some(collection_id.clone())),
        }
    }

    fn settle(&mut self, action: &Action, created: Option<&str>) {
        match action {
            Action::CreateCollection { name } => {
                if let Some(id) = created {
                    self.directory.record(name, id);
                }
            }
            Action::DeleteCollection { collection, .. } => self.directory.forget(collection),
            Action::AddRecipeToCollection { .. } | Action::RemoveRecipeFromCollection { .. } => {}
        }
    }

    async fn lookup_remote(&self, name: &str) -> Option<String> {
        let listings = self.platform.fetch_collections().await.ok()?;
        listings.into_iter().find_map(|l| match l {
            CollectionListing::Loaded(c) if c.name == name => Some(c.id),
            CollectionListing::Unavailable { id, name: n, .. } if n == name => Some(id),
            _ => None,
        })
    }
}

/// One platform call for an action. Returns the new id for creates.
async fn dispatch(
    platform: &dyn RecipePlatform,
    action: &Action,
    collection_id: Option<&str>,
) -> Result<Option<String>, RemoteError> {
    let id = || {
        collection_id.ok_or_else(|| RemoteError::NonRetryable("missing collection id".to_string()))
    };
    match action {
        Action::CreateCollection { name } => platform.create_collection(name).await.map(Some),
        Action::AddRecipeToCollection { recipe_id, .. } => {
            platform.add_member(id()?, recipe_id).await.map(|_| None)
        }
        Action::RemoveRecipeFromCollection { recipe_id, .. } => {
            platform.remove_member(id()?, recipe_id).await.map(|_| None)
        }
        Action::DeleteCollection { .. } => platform.delete_collection(id()?).await.map(|_| None),
    }
}

//! In-process platform with a call log and scripted faults.

use super::RecipePlatform;
use crate::core::error::RemoteError;
use crate::core::types::{CollectionListing, RecipeRecord, RemoteCollection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

/// Serializable platform contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    #[serde(default)]
    pub recipes: Vec<RecipeRecord>,

    #[serde(default)]
    pub collections: Vec<RemoteCollection>,

    /// Counter for generated collection ids
    #[serde(default)]
    pub next_id: u64,
}

impl PlatformSnapshot {
    pub fn collection_by_name(&self, name: &str) -> Option<&RemoteCollection> {
        self.collections.iter().find(|c| c.name == name)
    }

    fn collection_mut(&mut self, id: &str) -> Option<&mut RemoteCollection> {
        self.collections.iter_mut().find(|c| c.id == id)
    }

    fn allocate_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = format!("col-{:04}", self.next_id);
            if !self.collections.iter().any(|c| c.id == id) {
                return id;
            }
        }
    }
}

/// Recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    FetchRecipes,
    FetchCollections,
    Create { name: String },
    Add { collection_id: String, recipe_id: String },
    Remove { collection_id: String, recipe_id: String },
    Delete { collection_id: String },
}

impl PlatformCall {
    pub fn kind(&self) -> CallKind {
        match self {
            Self::FetchRecipes => CallKind::FetchRecipes,
            Self::FetchCollections => CallKind::FetchCollections,
            Self::Create { .. } => CallKind::Create,
            Self::Add { .. } => CallKind::Add,
            Self::Remove { .. } => CallKind::Remove,
            Self::Delete { .. } => CallKind::Delete,
        }
    }

    pub fn is_mutation(&self) -> bool {
        self.kind().is_mutation()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    FetchRecipes,
    FetchCollections,
    Create,
    Add,
    Remove,
    Delete,
}

impl CallKind {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Create | Self::Add | Self::Remove | Self::Delete)
    }
}

/// Scripted failure. Matches calls of `kind` (any mutation when `None`),
/// lets `skip` matching calls through, then fails the next `times` ones.
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: Option<CallKind>,
    pub skip: u32,
    pub times: u32,
    pub error: RemoteError,
    /// Apply the mutation before reporting the error (lost response)
    pub after_effect: bool,
}

impl Fault {
    pub fn on(kind: CallKind, error: RemoteError) -> Self {
        Self {
            kind: Some(kind),
            skip: 0,
            times: 1,
            error,
            after_effect: false,
        }
    }

    pub fn any_mutation(error: RemoteError) -> Self {
        Self {
            kind: None,
            skip: 0,
            times: 1,
            error,
            after_effect: false,
        }
    }

    pub fn after(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    pub fn times(mut self, times: u32) -> Self {
        self.times = times;
        self
    }

    pub fn after_effect(mut self) -> Self {
        self.after_effect = true;
        self
    }

    fn matches(&self, kind: CallKind) -> bool {
        match self.kind {
            Some(k) => k == kind,
            None => kind.is_mutation(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    snapshot: PlatformSnapshot,
    calls: Vec<PlatformCall>,
    faults: Vec<Fault>,
    unavailable: BTreeSet<String>,
}

impl Inner {
    /// Consume a matching fault, if one fires for this call.
    fn take_fault(&mut self, kind: CallKind) -> Option<Fault> {
        let fault = self.faults.iter_mut().find(|f| f.matches(kind) && f.times > 0)?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        fault.times -= 1;
        Some(fault.clone())
    }
}

/// In-memory recipe platform.
#[derive(Debug, Default)]
pub struct MemoryPlatform {
    inner: Mutex<Inner>,
}

impl MemoryPlatform {
    pub fn new(snapshot: PlatformSnapshot) -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot,
                ..Inner::default()
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn inject(&self, fault: Fault) {
        self.inner().faults.push(fault);
    }

    /// Membership fetches for this collection name report unavailable.
    pub fn mark_unavailable(&self, name: &str) {
        self.inner().unavailable.insert(name.to_string());
    }

    pub fn snapshot(&self) -> PlatformSnapshot {
        self.inner().snapshot.clone()
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.inner().calls.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.inner().calls.iter().filter(|c| c.is_mutation()).count()
    }

    pub fn clear_calls(&self) {
        self.inner().calls.clear();
    }

    /// Members of the collection with this name, if it exists.
    pub fn members_of(&self, name: &str) -> Option<BTreeSet<String>> {
        self.inner()
            .snapshot
            .collection_by_name(name)
            .map(|c| c.members.clone())
    }

    /// Record the call, then either fail it or run `apply` on the snapshot.
    fn mutate<T>(
        &self,
        call: PlatformCall,
        apply: impl FnOnce(&mut PlatformSnapshot) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut inner = self.inner();
        let kind = call.kind();
        inner.calls.push(call);
        match inner.take_fault(kind) {
            Some(fault) if fault.after_effect => {
                let _ = apply(&mut inner.snapshot);
                Err(fault.error)
            }
            Some(fault) => Err(fault.error),
            None => apply(&mut inner.snapshot),
        }
    }
}

#[async_trait]
impl RecipePlatform for MemoryPlatform {
    async fn fetch_recipes(&self) -> Result<Vec<RecipeRecord>, RemoteError> {
        let mut inner = self.inner();
        inner.calls.push(PlatformCall::FetchRecipes);
        if let Some(fault) = inner.take_fault(CallKind::FetchRecipes) {
            return Err(fault.error);
        }
        let snapshot = &inner.snapshot;
        Ok(snapshot
            .recipes
            .iter()
            .map(|r| {
                let mut r = r.clone();
                r.collections = snapshot
                    .collections
                    .iter()
                    .filter(|c| c.members.contains(&r.id))
                    .map(|c| c.id.clone())
                    .collect();
                r
            })
            .collect())
    }

    async fn fetch_collections(&self) -> Result<Vec<CollectionListing>, RemoteError> {
        let mut inner = self.inner();
        inner.calls.push(PlatformCall::FetchCollections);
        if let Some(fault) = inner.take_fault(CallKind::FetchCollections) {
            return Err(fault.error);
        }
        Ok(inner
            .snapshot
            .collections
            .iter()
            .map(|c| {
                if inner.unavailable.contains(&c.name) {
                    CollectionListing::Unavailable {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        reason: "membership fetch failed".to_string(),
                    }
                } else {
                    CollectionListing::Loaded(c.clone())
                }
            })
            .collect())
    }

    async fn create_collection(&self, name: &str) -> Result<String, RemoteError> {
        self.mutate(
            PlatformCall::Create {
                name: name.to_string(),
            },
            |snap| {
                if let Some(existing) = snap.collection_by_name(name) {
                    return Err(RemoteError::Conflict {
                        message: format!("collection \"{}\" already exists", name),
                        existing_id: Some(existing.id.clone()),
                    });
                }
                let id = snap.allocate_id();
                snap.collections.push(RemoteCollection {
                    id: id.clone(),
                    name: name.to_string(),
                    managed: false,
                    members: BTreeSet::new(),
                });
                Ok(id)
            },
        )
    }

    async fn add_member(&self, collection_id: &str, recipe_id: &str) -> Result<(), RemoteError> {
        self.mutate(
            PlatformCall::Add {
                collection_id: collection_id.to_string(),
                recipe_id: recipe_id.to_string(),
            },
            |snap| {
                let c = snap.collection_mut(collection_id).ok_or_else(|| {
                    RemoteError::NonRetryable(format!("collection {} not found", collection_id))
                })?;
                if c.members.insert(recipe_id.to_string()) {
                    Ok(())
                } else {
                    Err(RemoteError::Conflict {
                        message: format!("{} already in {}", recipe_id, collection_id),
                        existing_id: None,
                    })
                }
            },
        )
    }

    async fn remove_member(
        &self,
        collection_id: &str,
        recipe_id: &str,
    ) -> Result<(), RemoteError> {
        self.mutate(
            PlatformCall::Remove {
                collection_id: collection_id.to_string(),
                recipe_id: recipe_id.to_string(),
            },
            |snap| {
                let not_member = || RemoteError::Conflict {
                    message: format!("{} not in {}", recipe_id, collection_id),
                    existing_id: None,
                };
                let c = snap.collection_mut(collection_id).ok_or_else(not_member)?;
                if c.members.remove(recipe_id) {
                    Ok(())
                } else {
                    Err(not_member())
                }
            },
        )
    }

    async fn delete_collection(&self, collection_id: &str) -> Result<(), RemoteError> {
        self.mutate(
            PlatformCall::Delete {
                collection_id: collection_id.to_string(),
            },
            |snap| {
                let before = snap.collections.len();
                snap.collections.retain(|c| c.id != collection_id);
                if snap.collections.len() < before {
                    Ok(())
                } else {
                    Err(RemoteError::Conflict {
                        message: format!("collection {} already gone", collection_id),
                        existing_id: None,
                    })
                }
            },
        )
    }
}

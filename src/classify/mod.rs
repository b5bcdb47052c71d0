//! LD-030: Classification service collaborator.
//!
//! The service receives a recipe's name plus ingredient text and answers with
//! raw season and dish-type labels. Validating those labels against the
//! controlled vocabulary is the adapter's job (`core::classifier`), not the
//! service's.

pub mod keyword;

use crate::core::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Raw, unvalidated labels from a classification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLabels {
    pub season: String,
    pub dish_type: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait ClassificationService: Send + Sync {
    async fn classify(&self, text: &str) -> Result<RawLabels, ServiceError>;
}

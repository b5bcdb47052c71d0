//! LD-005: Classifier adapter — memoized, retried, concurrency-bounded
//! classification that degrades to "unclassified" instead of failing a run.

use super::error::{ClassifyError, ServiceError};
use super::retry::{retry_async, RetryPolicy};
use super::types::{Classification, ClassificationSource, DishType, RecipeRecord, Season};
use crate::classify::ClassificationService;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of a batch classification.
#[derive(Debug, Clone, Default)]
pub struct BatchClassification {
    /// Exactly one entry per input recipe id
    pub classifications: BTreeMap<String, Classification>,
    /// Served from the cache without calling the service
    pub cached: usize,
    /// Degraded to unclassified, with the reason
    pub degraded: Vec<ClassifyError>,
}

impl BatchClassification {
    pub fn classified_count(&self) -> usize {
        self.classifications
            .values()
            .filter(|c| c.is_classified())
            .count()
    }

    pub fn unclassified_count(&self) -> usize {
        self.classifications.len() - self.classified_count()
    }
}

pub struct ClassifierAdapter {
    service: Arc<dyn ClassificationService>,
    cache: Mutex<BTreeMap<String, Classification>>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl ClassifierAdapter {
    pub fn new(service: Arc<dyn ClassificationService>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            service,
            cache: Mutex::new(BTreeMap::new()),
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Seed the cache (e.g. from a checkpoint).
    pub fn with_cache(self, cache: BTreeMap<String, Classification>) -> Self {
        *self.cache_guard() = cache;
        self
    }

    fn cache_guard(&self) -> MutexGuard<'_, BTreeMap<String, Classification>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached(&self, recipe_id: &str) -> Option<Classification> {
        self.cache_guard().get(recipe_id).cloned()
    }

    /// Drop one cached classification. Returns whether it was cached.
    pub fn invalidate(&self, recipe_id: &str) -> bool {
        self.cache_guard().remove(recipe_id).is_some()
    }

    pub fn invalidate_all(&self) {
        self.cache_guard().clear();
    }

    /// Copy of the cache, for persisting.
    pub fn snapshot(&self) -> BTreeMap<String, Classification> {
        self.cache_guard().clone()
    }

    /// Classify one recipe: cache hit, else a single service call validated
    /// against the vocabulary. Only successful results are cached.
    pub async fn classify(&self, recipe: &RecipeRecord) -> Result<Classification, ClassifyError> {
        if let Some(hit) = self.cached(&recipe.id) {
            return Ok(hit);
        }
        let raw = self
            .service
            .classify(&recipe.summary_text())
            .await
            .map_err(|e| match e {
                ServiceError::Unavailable(reason) => ClassifyError::Unavailable {
                    recipe_id: recipe.id.clone(),
                    reason,
                },
                ServiceError::Malformed(reason) => ClassifyError::Invalid {
                    recipe_id: recipe.id.clone(),
                    reason,
                },
            })?;

        let invalid = |reason: String| ClassifyError::Invalid {
            recipe_id: recipe.id.clone(),
            reason,
        };
        let season = Season::from_label(&raw.season)
            .ok_or_else(|| invalid(format!("unknown season '{}'", raw.season)))?;
        let dish = DishType::from_label(&raw.dish_type)
            .ok_or_else(|| invalid(format!("unknown dish type '{}'", raw.dish_type)))?;
        let confidence = raw.confidence.unwrap_or(0.8).clamp(0.0, 1.0);

        let classification = Classification {
            recipe_id: recipe.id.clone(),
            season,
            dish_type: Some(dish),
            confidence,
            source: ClassificationSource::Model,
        };
        self.cache_guard()
            .insert(recipe.id.clone(), classification.clone());
        Ok(classification)
    }

    /// `classify` with the retry policy applied to transient failures.
    pub async fn classify_with_retry(
        &self,
        recipe: &RecipeRecord,
    ) -> Result<Classification, ClassifyError> {
        let (result, _attempts) = retry_async(
            &self.retry,
            &recipe.id,
            ClassifyError::is_retryable,
            || self.classify(recipe),
        )
        .await;
        result
    }

    /// Classify many recipes with at most `concurrency` calls in flight.
    /// Never fails: recipes that cannot be classified come back unclassified.
    pub async fn classify_batch(self: &Arc<Self>, recipes: &[RecipeRecord]) -> BatchClassification {
        let mut batch = BatchClassification::default();
        let mut seen = BTreeSet::new();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for recipe in recipes {
            if !seen.insert(recipe.id.clone()) {
                continue;
            }
            if let Some(hit) = self.cached(&recipe.id) {
                batch.cached += 1;
                batch.classifications.insert(recipe.id.clone(), hit);
                continue;
            }
            let adapter = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let recipe = recipe.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = adapter.classify_with_retry(&recipe).await;
                (recipe.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(c))) => {
                    debug!(recipe = %id, season = %c.season, "classified");
                    batch.classifications.insert(id, c);
                }
                Ok((_, Err(e))) => {
                    let id = e.recipe_id().to_string();
                    warn!(recipe = %id, error = %e, "classification degraded to unclassified");
                    batch
                        .classifications
                        .insert(id.clone(), Classification::unclassified(&id));
                    batch.degraded.push(e);
                }
                Err(e) => warn!(error = %e, "classification task aborted"),
            }
        }

        for id in seen {
            batch
                .classifications
                .entry(id.clone())
                .or_insert_with(|| Classification::unclassified(&id));
        }

        info!(
            total = batch.classifications.len(),
            classified = batch.classified_count(),
            cached = batch.cached,
            degraded = batch.degraded.len(),
            "classification finished"
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::RawLabels;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers "Verano"/"Pescados" for everything; fails the first
    /// `fail_first` calls; reports "Tapas" for texts containing "tapa".
    #[derive(Default)]
    struct FakeService {
        calls: AtomicUsize,
        fail_first: usize,
        always_down: bool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl ClassificationService for FakeService {
        async fn classify(&self, text: &str) -> Result<RawLabels, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.always_down || n < self.fail_first {
                return Err(ServiceError::Unavailable("timeout".to_string()));
            }
            let dish = if text.contains("tapa") { "Tapas" } else { "Pescados" };
            Ok(RawLabels {
                season: "Verano".to_string(),
                dish_type: dish.to_string(),
                confidence: Some(0.9),
            })
        }
    }

    fn recipe(id: &str, name: &str) -> RecipeRecord {
        RecipeRecord {
            id: id.to_string(),
            name: name.to_string(),
            ingredient_summary: String::new(),
            collections: BTreeSet::new(),
        }
    }

    fn adapter(service: Arc<FakeService>, attempts: u32, concurrency: usize) -> Arc<ClassifierAdapter> {
        Arc::new(ClassifierAdapter::new(
            service,
            RetryPolicy::immediate(attempts),
            concurrency,
        ))
    }

    #[tokio::test]
    async fn test_ld005_memoized() {
        let service = Arc::new(FakeService::default());
        let a = adapter(service.clone(), 1, 1);
        let r = recipe("r1", "Dorada");
        let first = a.classify(&r).await.unwrap();
        let second = a.classify(&r).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.dish_type, Some(DishType::Pescados));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ld005_invalid_vocabulary() {
        let service = Arc::new(FakeService::default());
        let a = adapter(service, 3, 1);
        let err = a.classify(&recipe("r1", "tapa de atún")).await.unwrap_err();
        assert!(matches!(err, ClassifyError::Invalid { .. }));
        assert!(a.cached("r1").is_none());
    }

    #[tokio::test]
    async fn test_ld005_retry_then_success() {
        let service = Arc::new(FakeService {
            fail_first: 2,
            ..FakeService::default()
        });
        let a = adapter(service.clone(), 3, 1);
        let c = a.classify_with_retry(&recipe("r1", "Dorada")).await.unwrap();
        assert!(c.is_classified());
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_ld005_invalidate() {
        let service = Arc::new(FakeService::default());
        let a = adapter(service.clone(), 1, 1);
        let r = recipe("r1", "Dorada");
        a.classify(&r).await.unwrap();
        assert!(a.invalidate("r1"));
        assert!(!a.invalidate("r1"));
        a.classify(&r).await.unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        a.invalidate_all();
        assert!(a.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_ld005_batch_degrades_when_service_down() {
        let service = Arc::new(FakeService {
            always_down: true,
            ..FakeService::default()
        });
        let a = adapter(service.clone(), 2, 2);
        let recipes = vec![recipe("r1", "Dorada"), recipe("r2", "Lubina")];
        let batch = a.classify_batch(&recipes).await;
        assert_eq!(batch.classifications.len(), 2);
        assert_eq!(batch.unclassified_count(), 2);
        assert_eq!(batch.degraded.len(), 2);
        assert_eq!(service.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_ld005_batch_uses_seeded_cache_and_dedups() {
        let service = Arc::new(FakeService::default());
        let mut seed = BTreeMap::new();
        seed.insert(
            "r1".to_string(),
            Classification {
                recipe_id: "r1".to_string(),
                season: Season::Winter,
                dish_type: Some(DishType::Sopas),
                confidence: 1.0,
                source: ClassificationSource::Model,
            },
        );
        let a = Arc::new(
            ClassifierAdapter::new(service.clone(), RetryPolicy::immediate(1), 4).with_cache(seed),
        );
        let recipes = vec![recipe("r1", "Cocido"), recipe("r2", "Dorada"), recipe("r2", "Dorada")];
        let batch = a.classify_batch(&recipes).await;
        assert_eq!(batch.cached, 1);
        assert_eq!(batch.classifications["r1"].season, Season::Winter);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_ld005_batch_respects_concurrency() {
        let service = Arc::new(FakeService::default());
        let a = adapter(service.clone(), 1, 2);
        let recipes: Vec<RecipeRecord> = (0..8)
            .map(|i| recipe(&format!("r{}", i), "Dorada"))
            .collect();
        let batch = a.classify_batch(&recipes).await;
        assert_eq!(batch.classified_count(), 8);
        assert!(service.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}

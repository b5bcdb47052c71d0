//! LD-010: Pipeline orchestrator — fetch, classify, plan, checkpoint, execute.
//!
//! Phases: Init → Planning → (DryRunReport | Executing) → (Done | Aborted).
//! The checkpoint is written before the first mutation and after every
//! completed action; a resumed run re-plans from fresh remote state and skips
//! actions whose ids are already recorded as completed.

use super::checkpoint::{self, CheckpointStore};
use super::classifier::ClassifierAdapter;
use super::error::{ActionFailed, PipelineError};
use super::executor::{ActionExecutor, CollectionDirectory, ExecOutcome};
use super::parser;
use super::planner;
use super::retry::RetryPolicy;
use super::rules::NamingRules;
use super::types::*;
use crate::classify::ClassificationService;
use crate::platform::{self, RecipePlatform};
use crate::provenance::{eventlog, hasher};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runtime settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub operation: Operation,
    pub dry_run: bool,
    pub region: String,
    pub rules: NamingRules,
    pub classification_retry: RetryPolicy,
    pub classification_concurrency: usize,
    pub execution_retry: RetryPolicy,
    /// Pause between consecutive mutations
    pub action_delay: Duration,
    /// Ignore cached classifications from an earlier attempt
    pub reclassify: bool,
}

impl PipelineConfig {
    pub fn from_config(config: &LarderConfig, operation: Operation) -> Result<Self, String> {
        if parser::region_locale(&config.region).is_none() {
            return Err(format!("unknown region '{}'", config.region));
        }
        Ok(Self {
            operation,
            dry_run: false,
            region: config.region.to_lowercase(),
            rules: NamingRules::from_config(&config.rules)?,
            classification_retry: RetryPolicy::from_settings(&config.classification.retry),
            classification_concurrency: config.classification.concurrency.max(1),
            execution_retry: RetryPolicy::from_settings(&config.execution.retry),
            action_delay: Duration::from_millis(config.execution.action_delay_ms),
            reclassify: false,
        })
    }
}

/// Cooperative cancellation, checked between actions.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Init,
    Planning,
    DryRunReport,
    Executing,
    Done,
    Aborted,
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::DryRunReport => "dry-run",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a run stopped before finishing its plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    ActionFailed {
        action: Action,
        failure: ActionFailed,
    },
    Cancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActionFailed { action, failure } => write!(f, "{}: {}", action, failure),
            Self::Cancelled => write!(f, "cancelled by operator"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassificationStats {
    pub classified: usize,
    pub unclassified: usize,
    /// Served from the checkpoint cache
    pub cached: usize,
    /// Recipes found in more than one two-level collection
    pub conflicting: usize,
}

/// What a dry run would do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DryRunReport {
    pub actions: Vec<Action>,
    /// Member counts per changed collection: (before, after), `None` = absent
    pub delta: BTreeMap<String, (Option<usize>, Option<usize>)>,
}

/// Final report of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub run_key: RunKey,
    pub operation: Operation,
    pub phase: PipelinePhase,
    pub resumed: bool,
    pub classification: ClassificationStats,
    /// Actions in the fresh plan
    pub planned: usize,
    /// Plan actions skipped because the checkpoint lists them as completed
    pub skipped_completed: usize,
    /// Collections left out of this run: name → reason
    pub skipped_collections: BTreeMap<String, String>,
    /// Unclassified recipes kept where they are
    pub retained_recipes: u32,
    /// Export recipe ids the platform no longer has
    pub missing_recipes: usize,
    /// Actions completed this run, in order
    pub applied: Vec<Action>,
    /// How many of `applied` were already in effect
    pub already_satisfied: usize,
    pub failure: Option<AbortReason>,
    /// Actions not yet executed
    pub pending: Vec<Action>,
    pub dry_run: Option<DryRunReport>,
    pub duration: Duration,
}

impl RunReport {
    fn new(state: &CheckpointState, resumed: bool) -> Self {
        Self {
            run_id: state.run_id.clone(),
            run_key: state.run_key.clone(),
            operation: state.operation,
            phase: PipelinePhase::Init,
            resumed,
            classification: ClassificationStats::default(),
            planned: 0,
            skipped_completed: 0,
            skipped_collections: BTreeMap::new(),
            retained_recipes: 0,
            missing_recipes: 0,
            applied: Vec::new(),
            already_satisfied: 0,
            failure: None,
            pending: Vec::new(),
            dry_run: None,
            duration: Duration::ZERO,
        }
    }

    pub fn last_applied(&self) -> Option<&Action> {
        self.applied.last()
    }
}

/// One organizer pipeline over a platform.
pub struct Pipeline<'a> {
    platform: &'a dyn RecipePlatform,
    classifier: Option<Arc<dyn ClassificationService>>,
    store: CheckpointStore,
    config: PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(platform: &'a dyn RecipePlatform, store: CheckpointStore, config: PipelineConfig) -> Self {
        Self {
            platform,
            classifier: None,
            store,
            config,
        }
    }

    pub fn with_classifier(mut self, service: Arc<dyn ClassificationService>) -> Self {
        self.classifier = Some(service);
        self
    }

    /// Run key an export would be checkpointed under.
    pub fn run_key_for(&self, export_bytes: &[u8]) -> RunKey {
        RunKey::derive(self.config.operation, &hasher::hash_bytes(export_bytes))
    }

    /// Execute the pipeline for one export file.
    pub async fn run(&self, export_bytes: &[u8], cancel: &CancelFlag) -> Result<RunReport, PipelineError> {
        let start = Instant::now();
        let op = self.config.operation;
        let export = parser::parse_export(export_bytes).map_err(PipelineError::Export)?;
        let run_key = self.run_key_for(export_bytes);

        // Init: lock and load before touching the platform.
        let _lock = if self.config.dry_run {
            None
        } else {
            Some(self.store.lock(&run_key)?)
        };
        let existing = self.store.load(&run_key)?;
        let resumed = existing.is_some();
        let mut state = existing
            .unwrap_or_else(|| checkpoint::new_checkpoint(&run_key, op, &eventlog::generate_run_id()));
        let mut report = RunReport::new(&state, resumed);
        info!(
            run_key = %run_key,
            run_id = %state.run_id,
            operation = %op,
            resumed,
            dry_run = self.config.dry_run,
            "run started"
        );
        self.record(
            &run_key,
            ProvenanceEvent::RunStarted {
                run_key: run_key.to_string(),
                run_id: state.run_id.clone(),
                operation: op,
                region: self.config.region.clone(),
                resumed,
                larder_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        );

        let recipes = self
            .platform
            .fetch_recipes()
            .await
            .map_err(PipelineError::Remote)?;
        let remote = platform::fetch_state(self.platform)
            .await
            .map_err(PipelineError::Remote)?;

        let wanted = export.recipe_ids();
        let recipes: Vec<RecipeRecord> = recipes
            .into_iter()
            .filter(|r| wanted.contains(&r.id))
            .collect();
        report.missing_recipes = wanted.len().saturating_sub(recipes.len());
        if report.missing_recipes > 0 {
            warn!(
                missing = report.missing_recipes,
                "export lists recipes the platform no longer has"
            );
        }

        // Planning
        report.phase = PipelinePhase::Planning;
        let classifications = match op {
            Operation::Import => {
                self.classify_recipes(&recipes, &mut state, &mut report.classification)
                    .await?
            }
            Operation::Organize => self.classifications_from_export(&export, &mut report.classification),
        };
        self.record(
            &run_key,
            ProvenanceEvent::ClassificationCompleted {
                run_id: state.run_id.clone(),
                classified: report.classification.classified as u32,
                unclassified: report.classification.unclassified as u32,
                cached: report.classification.cached as u32,
            },
        );

        let managed_origin = match op {
            Operation::Organize => self.managed_origin_ids(&export),
            Operation::Import => BTreeSet::new(),
        };
        let plan = planner::plan(&remote, &classifications, &self.config.rules, &managed_origin);
        let pending: Vec<Action> = plan
            .actions
            .iter()
            .filter(|a| !state.completed_action_ids.contains(&a.action_id()))
            .cloned()
            .collect();
        report.planned = plan.actions.len();
        report.skipped_completed = plan.actions.len() - pending.len();
        report.skipped_collections = plan.skipped_collections.clone();
        report.retained_recipes = plan.retained_recipes;
        info!(
            planned = report.planned,
            pending = pending.len(),
            skipped_completed = report.skipped_completed,
            "plan ready"
        );
        self.record(
            &run_key,
            ProvenanceEvent::PlanComputed {
                run_id: state.run_id.clone(),
                actions: plan.actions.len() as u32,
                pending: pending.len() as u32,
                skipped_collections: plan.skipped_collections.len() as u32,
            },
        );

        if self.config.dry_run {
            report.phase = PipelinePhase::DryRunReport;
            report.dry_run = Some(DryRunReport {
                delta: planner::membership_delta(&remote, &pending),
                actions: pending.clone(),
            });
            report.pending = pending;
            report.duration = start.elapsed();
            return Ok(report);
        }

        state.pending_actions = pending.clone();
        self.store.save(&mut state)?;

        // Executing
        report.phase = PipelinePhase::Executing;
        let mut executor = ActionExecutor::new(
            self.platform,
            self.config.execution_retry.clone(),
            CollectionDirectory::from_state(&remote),
        );
        for (i, action) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(remaining = pending.len() - i, "cancellation requested, stopping");
                report.failure = Some(AbortReason::Cancelled);
                break;
            }
            if i > 0 && !self.config.action_delay.is_zero() {
                tokio::time::sleep(self.config.action_delay).await;
            }
            match executor.execute(action).await {
                Ok(outcome) => self.record_success(&mut state, &mut report, action, outcome)?,
                Err(failure) => {
                    self.record_failure(&state, action, &failure);
                    report.failure = Some(AbortReason::ActionFailed {
                        action: action.clone(),
                        failure,
                    });
                    break;
                }
            }
        }

        report.pending = state.pending_actions.clone();
        report.duration = start.elapsed();
        match &report.failure {
            Some(reason) => {
                report.phase = PipelinePhase::Aborted;
                self.store.save(&mut state)?;
                warn!(
                    reason = %reason,
                    pending = report.pending.len(),
                    "run aborted; re-run the same command to resume"
                );
                self.record(
                    &run_key,
                    ProvenanceEvent::RunAborted {
                        run_id: state.run_id.clone(),
                        reason: reason.to_string(),
                        pending: report.pending.len() as u32,
                    },
                );
            }
            None => {
                report.phase = PipelinePhase::Done;
                self.store.clear(&run_key)?;
                info!(
                    applied = report.applied.len(),
                    already_satisfied = report.already_satisfied,
                    "run complete"
                );
                self.record(
                    &run_key,
                    ProvenanceEvent::RunCompleted {
                        run_id: state.run_id.clone(),
                        applied: report.applied.len() as u32,
                        total_seconds: report.duration.as_secs_f64(),
                    },
                );
            }
        }
        Ok(report)
    }

    async fn classify_recipes(
        &self,
        recipes: &[RecipeRecord],
        state: &mut CheckpointState,
        stats: &mut ClassificationStats,
    ) -> Result<BTreeMap<String, Classification>, PipelineError> {
        let service = self.classifier.clone().ok_or(PipelineError::NoClassifier)?;
        let seed = if self.config.reclassify {
            BTreeMap::new()
        } else {
            state.classifications.clone()
        };
        let adapter = Arc::new(
            ClassifierAdapter::new(
                service,
                self.config.classification_retry.clone(),
                self.config.classification_concurrency,
            )
            .with_cache(seed),
        );
        let batch = adapter.classify_batch(recipes).await;
        stats.classified = batch.classified_count();
        stats.unclassified = batch.unclassified_count();
        stats.cached = batch.cached;
        state.classifications = adapter.snapshot();
        Ok(batch.classifications)
    }

    /// Organize mode: classifications come from two-level source collection
    /// names in the export.
    fn classifications_from_export(
        &self,
        export: &ExportFile,
        stats: &mut ClassificationStats,
    ) -> BTreeMap<String, Classification> {
        let rules = &self.config.rules;
        let mut names_by_recipe: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for c in &export.collections {
            if rules.parse_two_level(&c.name).is_none() {
                continue;
            }
            for r in &c.recipe_ids {
                names_by_recipe.entry(r).or_default().push(&c.name);
            }
        }

        let mut out = BTreeMap::new();
        for (recipe_id, names) in names_by_recipe {
            if names.len() > 1 {
                stats.conflicting += 1;
                debug!(recipe = %recipe_id, collections = ?names, "recipe in several two-level collections; first name wins");
            }
            if let Some(c) = rules.classification_from_names(recipe_id, names) {
                out.insert(recipe_id.to_string(), c);
            }
        }
        stats.classified = out.len();
        out
    }

    fn managed_origin_ids(&self, export: &ExportFile) -> BTreeSet<String> {
        self.config
            .rules
            .managed_origin()
            .and_then(|name| export.collection(name))
            .map(|c| c.recipe_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record_success(
        &self,
        state: &mut CheckpointState,
        report: &mut RunReport,
        action: &Action,
        outcome: ExecOutcome,
    ) -> Result<(), PipelineError> {
        let action_id = action.action_id();
        state.completed_action_ids.insert(action_id.clone());
        if state.pending_actions.first() == Some(action) {
            state.pending_actions.remove(0);
        } else {
            state.pending_actions.retain(|a| a != action);
        }
        self.store.save(state)?;

        let already_satisfied = outcome == ExecOutcome::AlreadySatisfied;
        if already_satisfied {
            report.already_satisfied += 1;
        }
        report.applied.push(action.clone());
        self.record(
            &state.run_key,
            ProvenanceEvent::ActionApplied {
                run_id: state.run_id.clone(),
                action_id,
                action: action.describe(),
                already_satisfied,
            },
        );
        Ok(())
    }

    fn record_failure(&self, state: &CheckpointState, action: &Action, failure: &ActionFailed) {
        warn!(action = %action, error = %failure, "stopping at failed action");
        self.record(
            &state.run_key,
            ProvenanceEvent::ActionFailed {
                run_id: state.run_id.clone(),
                action_id: failure.action_id.clone(),
                action: action.describe(),
                retryable: failure.retryable,
                error: failure.message.clone(),
            },
        );
    }

    /// Append to the run's event log. Dry runs write nothing.
    fn record(&self, run_key: &RunKey, event: ProvenanceEvent) {
        if self.config.dry_run {
            return;
        }
        if let Err(e) = eventlog::append_event(self.store.state_dir(), run_key.as_str(), event) {
            warn!(error = %e, "cannot append provenance event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::keyword::KeywordClassifier;
    use crate::classify::RawLabels;
    use crate::core::error::{CheckpointError, RemoteError, ServiceError};
    use crate::platform::memory::{CallKind, Fault, MemoryPlatform, PlatformCall, PlatformSnapshot};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    fn test_config(operation: Operation) -> PipelineConfig {
        let mut config = PipelineConfig::from_config(&LarderConfig::default(), operation).unwrap();
        config.action_delay = Duration::ZERO;
        config.execution_retry = RetryPolicy::immediate(3);
        config.classification_retry = RetryPolicy::immediate(2);
        config
    }

    fn recipe(id: &str, name: &str) -> RecipeRecord {
        RecipeRecord {
            id: id.to_string(),
            name: name.to_string(),
            ingredient_summary: String::new(),
            collections: BTreeSet::new(),
        }
    }

    fn collection(id: &str, name: &str, members: &[&str]) -> RemoteCollection {
        RemoteCollection {
            id: id.to_string(),
            name: name.to_string(),
            managed: false,
            members: members.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// One two-level collection holding r1 on both sides.
    fn seafood_fixture() -> (MemoryPlatform, Vec<u8>) {
        let platform = MemoryPlatform::new(PlatformSnapshot {
            recipes: vec![recipe("r1", "Dorada a la sal")],
            collections: vec![collection("c1", "Verano > Pescados", &["r1"])],
            next_id: 0,
        });
        let export = br#"{"collections": [{"name": "Verano > Pescados", "recipe_ids": ["r1"]}]}"#;
        (platform, export.to_vec())
    }

    fn kinds(calls: &[PlatformCall]) -> Vec<CallKind> {
        calls.iter().filter(|c| c.is_mutation()).map(|c| c.kind()).collect()
    }

    fn checkpoint_exists(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .any(|e| e.path().join("checkpoint.json").exists())
            })
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_ld010_organize_seafood_example() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Organize));
        let report = pipeline.run(&export, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.phase, PipelinePhase::Done);
        assert_eq!(report.applied.len(), 4);
        assert_eq!(
            kinds(&platform.calls()),
            vec![CallKind::Create, CallKind::Add, CallKind::Remove, CallKind::Delete]
        );
        assert_eq!(
            platform.members_of("Seafood"),
            Some(BTreeSet::from(["r1".to_string()]))
        );
        assert!(platform.members_of("Verano > Pescados").is_none());
        assert!(!checkpoint_exists(dir.path()));

        let events = eventlog::read_events(dir.path(), report.run_key.as_str()).unwrap();
        assert!(matches!(events.first().unwrap().event, ProvenanceEvent::RunStarted { .. }));
        assert!(matches!(events.last().unwrap().event, ProvenanceEvent::RunCompleted { applied: 4, .. }));
    }

    #[tokio::test]
    async fn test_ld010_dry_run_is_pure() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let mut config = test_config(Operation::Organize);
        config.dry_run = true;
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), config);
        let report = pipeline.run(&export, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.phase, PipelinePhase::DryRunReport);
        assert_eq!(platform.mutation_count(), 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        let dry = report.dry_run.unwrap();
        assert_eq!(dry.actions.len(), 4);
        assert_eq!(dry.delta["Seafood"], (None, Some(1)));
        assert_eq!(dry.delta["Verano > Pescados"], (Some(1), None));
    }

    #[tokio::test]
    async fn test_ld010_resume_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        platform.inject(
            Fault::any_mutation(RemoteError::NonRetryable("session expired".to_string())).after(2),
        );
        let store = CheckpointStore::new(dir.path());
        let pipeline = Pipeline::new(&platform, store.clone(), test_config(Operation::Organize));

        let first = pipeline.run(&export, &CancelFlag::new()).await.unwrap();
        assert_eq!(first.phase, PipelinePhase::Aborted);
        assert_eq!(first.applied.len(), 2);
        assert_eq!(first.pending.len(), 2);
        assert!(matches!(
            first.failure,
            Some(AbortReason::ActionFailed { ref failure, .. }) if !failure.retryable
        ));
        let saved = store.load(&first.run_key).unwrap().unwrap();
        assert_eq!(saved.completed_action_ids.len(), 2);
        assert_eq!(saved.pending_actions, first.pending);

        let second = pipeline.run(&export, &CancelFlag::new()).await.unwrap();
        assert!(second.resumed);
        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.phase, PipelinePhase::Done);
        assert_eq!(second.applied.len(), 2);

        let creates = platform
            .calls()
            .iter()
            .filter(|c| c.kind() == CallKind::Create)
            .count();
        assert_eq!(creates, 1);
        assert!(platform.members_of("Verano > Pescados").is_none());
        assert_eq!(platform.members_of("Seafood").unwrap().len(), 1);
        assert!(store.load(&first.run_key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ld010_completed_ids_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let store = CheckpointStore::new(dir.path());
        let pipeline = Pipeline::new(&platform, store.clone(), test_config(Operation::Organize));

        let remove = Action::RemoveRecipeFromCollection {
            recipe_id: "r1".to_string(),
            collection: "Verano > Pescados".to_string(),
            collection_id: "c1".to_string(),
        };
        let key = pipeline.run_key_for(&export);
        let mut state = checkpoint::new_checkpoint(&key, Operation::Organize, "r-000000000042");
        state.completed_action_ids.insert(remove.action_id());
        store.save(&mut state).unwrap();

        let report = pipeline.run(&export, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.phase, PipelinePhase::Done);
        assert_eq!(report.skipped_completed, 1);
        assert!(!report.applied.contains(&remove));
        assert!(!platform
            .calls()
            .iter()
            .any(|c| matches!(c, PlatformCall::Remove { .. })));
    }

    #[tokio::test]
    async fn test_ld010_transient_exhaustion_aborts_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        platform.inject(Fault::on(CallKind::Add, RemoteError::Transient("429".to_string())).times(10));
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Organize));
        let report = pipeline.run(&export, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.phase, PipelinePhase::Aborted);
        match report.failure {
            Some(AbortReason::ActionFailed { action, failure }) => {
                assert_eq!(action.kind(), ActionKind::Add);
                assert!(failure.retryable);
                assert_eq!(failure.attempts, 3);
            }
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.pending.len(), 3);
        // Nothing after the failed add ran: the source collection still holds r1.
        assert!(platform.members_of("Verano > Pescados").unwrap().contains("r1"));
    }

    #[tokio::test]
    async fn test_ld010_cancelled_before_first_action() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let store = CheckpointStore::new(dir.path());
        let pipeline = Pipeline::new(&platform, store.clone(), test_config(Operation::Organize));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = pipeline.run(&export, &cancel).await.unwrap();

        assert_eq!(report.phase, PipelinePhase::Aborted);
        assert_eq!(report.failure, Some(AbortReason::Cancelled));
        assert_eq!(platform.mutation_count(), 0);
        assert_eq!(store.load(&report.run_key).unwrap().unwrap().pending_actions.len(), 4);
        assert!(!store.is_locked(&report.run_key));
    }

    #[tokio::test]
    async fn test_ld010_locked_run_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let store = CheckpointStore::new(dir.path());
        let pipeline = Pipeline::new(&platform, store.clone(), test_config(Operation::Organize));
        let _held = store.lock(&pipeline.run_key_for(&export)).unwrap();

        let err = pipeline.run(&export, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Checkpoint(CheckpointError::RunLocked { .. })));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ld010_corrupt_checkpoint_stops_before_remote() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let store = CheckpointStore::new(dir.path());
        let pipeline = Pipeline::new(&platform, store.clone(), test_config(Operation::Organize));
        let key = pipeline.run_key_for(&export);
        std::fs::create_dir_all(store.run_dir(&key)).unwrap();
        std::fs::write(store.checkpoint_path(&key), "{\"run_id\": ").unwrap();

        let err = pipeline.run(&export, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Checkpoint(CheckpointError::Corrupt { .. })));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ld010_managed_origin_stripped_from_custom() {
        let dir = tempfile::tempdir().unwrap();
        let mut origin = collection("c0", "Ideas sencillas", &["m1"]);
        origin.managed = true;
        let platform = MemoryPlatform::new(PlatformSnapshot {
            recipes: vec![recipe("m1", "Tostada"), recipe("r1", "Tortilla")],
            collections: vec![origin, collection("c1", "Cenas", &["m1", "r1"])],
            next_id: 0,
        });
        let export = br#"{
            "all_recipes": ["m1", "r1"],
            "collections": {"[Managed] Ideas sencillas": ["m1"], "[Custom] Cenas": ["m1", "r1"]}
        }"#;
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Organize));
        let report = pipeline.run(export, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.phase, PipelinePhase::Done);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(
            platform.members_of("Cenas"),
            Some(BTreeSet::from(["r1".to_string()]))
        );
        assert_eq!(
            platform.members_of("Ideas sencillas"),
            Some(BTreeSet::from(["m1".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_ld010_unavailable_collection_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        platform.mark_unavailable("Verano > Pescados");
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Organize));
        let report = pipeline.run(&export, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.phase, PipelinePhase::Done);
        assert!(report.skipped_collections.contains_key("Verano > Pescados"));
        // r1 still gets a flat home; the unreadable collection is left alone.
        assert_eq!(kinds(&platform.calls()), vec![CallKind::Create, CallKind::Add]);
    }

    struct DownService;

    #[async_trait]
    impl ClassificationService for DownService {
        async fn classify(&self, _text: &str) -> Result<RawLabels, ServiceError> {
            Err(ServiceError::Unavailable("503".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingService {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClassificationService for CountingService {
        async fn classify(&self, text: &str) -> Result<RawLabels, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            KeywordClassifier::new().classify(text).await
        }
    }

    #[tokio::test]
    async fn test_ld010_import_degrades_when_classifier_down() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Import))
            .with_classifier(Arc::new(DownService));
        let report = pipeline.run(&export, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.phase, PipelinePhase::Done);
        assert_eq!(report.classification.unclassified, 1);
        assert_eq!(report.retained_recipes, 1);
        assert_eq!(platform.mutation_count(), 0);
        assert!(platform.members_of("Verano > Pescados").unwrap().contains("r1"));
    }

    /// Unavailable for any recipe whose text mentions `needle`.
    struct FlakyFor {
        needle: &'static str,
    }

    #[async_trait]
    impl ClassificationService for FlakyFor {
        async fn classify(&self, text: &str) -> Result<RawLabels, ServiceError> {
            if text.contains(self.needle) {
                return Err(ServiceError::Unavailable("503".to_string()));
            }
            KeywordClassifier::new().classify(text).await
        }
    }

    #[tokio::test]
    async fn test_ld010_import_degrades_single_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let platform = MemoryPlatform::new(PlatformSnapshot {
            recipes: vec![recipe("r1", "Dorada a la sal"), recipe("r2", "Lubina al horno")],
            collections: vec![collection("c1", "Verano > Pescados", &["r1", "r2"])],
            next_id: 0,
        });
        let export = br#"{"collections": [{"name": "Verano > Pescados", "recipe_ids": ["r1", "r2"]}]}"#;
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Import))
            .with_classifier(Arc::new(FlakyFor { needle: "Lubina" }));
        let report = pipeline.run(export, &CancelFlag::new()).await.unwrap();

        assert_eq!(report.phase, PipelinePhase::Done);
        assert_eq!(report.classification.classified, 1);
        assert_eq!(report.classification.unclassified, 1);
        assert_eq!(report.retained_recipes, 1);
        assert_eq!(
            report.applied,
            vec![
                Action::CreateCollection {
                    name: "Seafood".to_string()
                },
                Action::AddRecipeToCollection {
                    recipe_id: "r1".to_string(),
                    collection: "Seafood".to_string(),
                },
                Action::RemoveRecipeFromCollection {
                    recipe_id: "r1".to_string(),
                    collection: "Verano > Pescados".to_string(),
                    collection_id: "c1".to_string(),
                },
            ]
        );
        assert_eq!(
            platform.members_of("Verano > Pescados"),
            Some(BTreeSet::from(["r2".to_string()]))
        );
        assert_eq!(
            platform.members_of("Seafood"),
            Some(BTreeSet::from(["r1".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_ld010_conflict_recorded_as_completed() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        // The add lands but its response is lost; the retry then conflicts.
        platform.inject(
            Fault::on(CallKind::Add, RemoteError::Transient("timeout".to_string())).after_effect(),
        );
        platform.inject(Fault::on(CallKind::Remove, RemoteError::NonRetryable("403".to_string())));
        let store = CheckpointStore::new(dir.path());
        let pipeline = Pipeline::new(&platform, store.clone(), test_config(Operation::Organize));

        let report = pipeline.run(&export, &CancelFlag::new()).await.unwrap();
        assert_eq!(report.phase, PipelinePhase::Aborted);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.already_satisfied, 1);
        assert_eq!(report.pending.len(), 2);

        let add = Action::AddRecipeToCollection {
            recipe_id: "r1".to_string(),
            collection: "Seafood".to_string(),
        };
        assert_eq!(report.last_applied(), Some(&add));
        let saved = store.load(&report.run_key).unwrap().unwrap();
        assert!(saved.completed_action_ids.contains(&add.action_id()));
        assert_eq!(saved.completed_action_ids.len(), 2);
        assert!(!saved.pending_actions.contains(&add));

        let events = eventlog::read_events(dir.path(), report.run_key.as_str()).unwrap();
        assert!(events.iter().any(|e| matches!(
            e.event,
            ProvenanceEvent::ActionApplied { already_satisfied: true, .. }
        )));

        let resumed = pipeline.run(&export, &CancelFlag::new()).await.unwrap();
        assert_eq!(resumed.phase, PipelinePhase::Done);
        assert_eq!(resumed.applied.len(), 2);
        assert_eq!(platform.members_of("Seafood").unwrap().len(), 1);
        assert!(platform.members_of("Verano > Pescados").is_none());
    }

    #[tokio::test]
    async fn test_ld010_import_without_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Import));
        let err = pipeline.run(&export, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoClassifier));
    }

    #[tokio::test]
    async fn test_ld010_import_cache_survives_abort() {
        let dir = tempfile::tempdir().unwrap();
        let platform = MemoryPlatform::new(PlatformSnapshot {
            recipes: vec![recipe("r1", "Gazpacho andaluz"), recipe("r2", "Dorada a la sal")],
            collections: vec![collection("c1", "Verano > Sopas", &["r1", "r2"])],
            next_id: 0,
        });
        platform.inject(Fault::on(CallKind::Add, RemoteError::NonRetryable("400".to_string())));
        let export = br#"{"collections": [{"name": "Verano > Sopas", "recipe_ids": ["r1", "r2"]}]}"#;
        let service = Arc::new(CountingService::default());
        let store = CheckpointStore::new(dir.path());
        let pipeline = Pipeline::new(&platform, store.clone(), test_config(Operation::Import))
            .with_classifier(service.clone());

        let first = pipeline.run(export, &CancelFlag::new()).await.unwrap();
        assert_eq!(first.phase, PipelinePhase::Aborted);
        assert_eq!(first.classification.classified, 2);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        let saved = store.load(&first.run_key).unwrap().unwrap();
        assert_eq!(saved.classifications.len(), 2);

        let second = pipeline.run(export, &CancelFlag::new()).await.unwrap();
        assert_eq!(second.phase, PipelinePhase::Done);
        assert_eq!(second.classification.cached, 2);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert!(platform.members_of("Soups").unwrap().contains("r1"));
        assert!(platform.members_of("Seafood").unwrap().contains("r2"));
        assert!(platform.members_of("Verano > Sopas").is_none());
    }

    #[tokio::test]
    async fn test_ld010_invalid_export() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, _) = seafood_fixture();
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Organize));
        let err = pipeline.run(b"[1, 2", &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Export(_)));
    }

    #[tokio::test]
    async fn test_ld010_second_run_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, export) = seafood_fixture();
        let pipeline = Pipeline::new(&platform, CheckpointStore::new(dir.path()), test_config(Operation::Organize));
        pipeline.run(&export, &CancelFlag::new()).await.unwrap();
        platform.clear_calls();

        let again = pipeline.run(&export, &CancelFlag::new()).await.unwrap();
        assert_eq!(again.phase, PipelinePhase::Done);
        assert_eq!(again.planned, 0);
        assert_eq!(platform.mutation_count(), 0);
    }

    #[test]
    fn test_ld010_config_rejects_unknown_region() {
        let config = LarderConfig {
            region: "mars".to_string(),
            ..LarderConfig::default()
        };
        assert!(PipelineConfig::from_config(&config, Operation::Import).is_err());
    }
}

//! LD-001: Domain types — recipes, classifications, collections, actions,
//! checkpoints, configuration, and provenance events.
//!
//! Everything that crosses a file boundary (config, export, checkpoint, event
//! log, platform snapshot) derives Serialize/Deserialize.

use crate::provenance::hasher;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Recipes
// ============================================================================

/// A recipe as fetched from the platform. Never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeRecord {
    /// Opaque, stable platform id
    pub id: String,

    /// Display name
    pub name: String,

    /// Short ingredient text used for classification
    #[serde(default)]
    pub ingredient_summary: String,

    /// Collections this recipe belongs to (by id)
    #[serde(default)]
    pub collections: BTreeSet<String>,
}

impl RecipeRecord {
    /// Text handed to the classification service.
    pub fn summary_text(&self) -> String {
        if self.ingredient_summary.trim().is_empty() {
            self.name.clone()
        } else {
            format!("{} (ingredients: {})", self.name, self.ingredient_summary)
        }
    }
}

// ============================================================================
// Classification vocabulary
// ============================================================================

/// Seasonality label. `Unclassified` is the degraded value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Season {
    #[serde(rename = "Primavera")]
    Spring,
    #[serde(rename = "Verano")]
    Summer,
    #[serde(rename = "Otoño")]
    Autumn,
    #[serde(rename = "Invierno")]
    Winter,
    #[serde(rename = "unclassified")]
    Unclassified,
}

impl Season {
    /// The four real seasons, in calendar order.
    pub const ALL: [Season; 4] = [Self::Spring, Self::Summer, Self::Autumn, Self::Winter];

    /// Label as used in collection names.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Spring => "Primavera",
            Self::Summer => "Verano",
            Self::Autumn => "Otoño",
            Self::Winter => "Invierno",
            Self::Unclassified => "unclassified",
        }
    }

    /// Emoji prefix used by seasonal collection names.
    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Spring => "\u{1F338}",
            Self::Summer => "\u{2600}\u{FE0F}",
            Self::Autumn => "\u{1F342}",
            Self::Winter => "\u{2744}\u{FE0F}",
            Self::Unclassified => "",
        }
    }

    /// Parse a label in Spanish or English, case-insensitively.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "primavera" | "spring" => Some(Self::Spring),
            "verano" | "summer" => Some(Self::Summer),
            "otoño" | "otono" | "autumn" | "fall" => Some(Self::Autumn),
            "invierno" | "winter" => Some(Self::Winter),
            "unclassified" => Some(Self::Unclassified),
            _ => None,
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Dish-type controlled vocabulary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DishType {
    Sopas,
    Ensaladas,
    Carnes,
    Pescados,
    Pastas,
    Arroces,
    Postres,
    Panes,
    Salsas,
}

impl DishType {
    pub const ALL: [DishType; 9] = [
        Self::Sopas,
        Self::Ensaladas,
        Self::Carnes,
        Self::Pescados,
        Self::Pastas,
        Self::Arroces,
        Self::Postres,
        Self::Panes,
        Self::Salsas,
    ];

    /// Spanish label (the vocabulary the classifier answers in).
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sopas => "Sopas",
            Self::Ensaladas => "Ensaladas",
            Self::Carnes => "Carnes",
            Self::Pescados => "Pescados",
            Self::Pastas => "Pastas",
            Self::Arroces => "Arroces",
            Self::Postres => "Postres",
            Self::Panes => "Panes",
            Self::Salsas => "Salsas",
        }
    }

    /// English culinary name, the default flat collection name.
    pub fn english(&self) -> &'static str {
        match self {
            Self::Sopas => "Soups",
            Self::Ensaladas => "Salads",
            Self::Carnes => "Meats",
            Self::Pescados => "Seafood",
            Self::Pastas => "Pasta",
            Self::Arroces => "Rice Dishes",
            Self::Postres => "Desserts",
            Self::Panes => "Breads",
            Self::Salsas => "Sauces",
        }
    }

    /// Parse either the Spanish or the English label, case-insensitively.
    pub fn from_label(label: &str) -> Option<Self> {
        let needle = label.trim();
        Self::ALL.into_iter().find(|d| {
            d.label().eq_ignore_ascii_case(needle) || d.english().eq_ignore_ascii_case(needle)
        })
    }
}

impl fmt::Display for DishType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// The external classification service
    #[default]
    Model,
    /// Parsed out of a two-level source collection name
    CollectionName,
}

/// Classification result for one recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub recipe_id: String,

    pub season: Season,

    /// `None` means the recipe is unclassified
    #[serde(default)]
    pub dish_type: Option<DishType>,

    #[serde(default = "default_confidence")]
    pub confidence: f32,

    #[serde(default)]
    pub source: ClassificationSource,
}

fn default_confidence() -> f32 {
    0.8
}

impl Classification {
    /// The degraded classification used when the service gives up.
    pub fn unclassified(recipe_id: &str) -> Self {
        Self {
            recipe_id: recipe_id.to_string(),
            season: Season::Unclassified,
            dish_type: None,
            confidence: 0.0,
            source: ClassificationSource::Model,
        }
    }

    pub fn is_classified(&self) -> bool {
        self.dish_type.is_some()
    }
}

// ============================================================================
// Collections
// ============================================================================

/// A remote collection with its current membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCollection {
    pub id: String,

    pub name: String,

    /// Platform says this collection is curated/auto-generated
    #[serde(default)]
    pub managed: bool,

    /// Member recipe ids
    #[serde(default)]
    pub members: BTreeSet<String>,
}

/// One entry of a collection listing. Membership fetches can fail per
/// collection without failing the whole listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionListing {
    Loaded(RemoteCollection),
    Unavailable {
        id: String,
        name: String,
        reason: String,
    },
}

/// Snapshot of the remote collection structure for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteState {
    /// Loaded collections keyed by id
    pub collections: BTreeMap<String, RemoteCollection>,

    /// Collections whose membership could not be fetched: name → reason
    pub unavailable: BTreeMap<String, String>,
}

impl RemoteState {
    pub fn from_listings(listings: Vec<CollectionListing>) -> Self {
        let mut state = Self::default();
        for listing in listings {
            match listing {
                CollectionListing::Loaded(c) => {
                    state.collections.insert(c.id.clone(), c);
                }
                CollectionListing::Unavailable { name, reason, .. } => {
                    state.unavailable.insert(name, reason);
                }
            }
        }
        state
    }

    /// Lookup by name. When names collide the lowest id wins.
    pub fn by_name(&self, name: &str) -> Option<&RemoteCollection> {
        self.collections.values().find(|c| c.name == name)
    }

    pub fn is_unavailable(&self, name: &str) -> bool {
        self.unavailable.contains_key(name)
    }

    /// Member count per collection name.
    pub fn member_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for c in self.collections.values() {
            counts.entry(c.name.clone()).or_insert(c.members.len());
        }
        counts
    }
}

/// Desired structure: canonical collection name → recipe ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionTarget {
    pub collections: BTreeMap<String, BTreeSet<String>>,
}

impl CollectionTarget {
    pub fn insert(&mut self, collection: &str, recipe_id: &str) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(recipe_id.to_string());
    }

    pub fn contains_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn members(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.collections.get(name)
    }
}

// ============================================================================
// Actions and plans
// ============================================================================

/// Kind of a planned mutation, in execution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Add,
    Remove,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Add => write!(f, "ADD"),
            Self::Remove => write!(f, "REMOVE"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// One atomic remote mutation.
///
/// Collections that may not exist yet are referenced by name and resolved to
/// a remote id when the action runs; removals and deletions target existing
/// collections and carry their id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    CreateCollection {
        name: String,
    },
    AddRecipeToCollection {
        recipe_id: String,
        collection: String,
    },
    RemoveRecipeFromCollection {
        recipe_id: String,
        collection: String,
        collection_id: String,
    },
    DeleteCollection {
        collection: String,
        collection_id: String,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::CreateCollection { .. } => ActionKind::Create,
            Self::AddRecipeToCollection { .. } => ActionKind::Add,
            Self::RemoveRecipeFromCollection { .. } => ActionKind::Remove,
            Self::DeleteCollection { .. } => ActionKind::Delete,
        }
    }

    /// Name of the collection this action touches.
    pub fn collection_name(&self) -> &str {
        match self {
            Self::CreateCollection { name } => name,
            Self::AddRecipeToCollection { collection, .. }
            | Self::RemoveRecipeFromCollection { collection, .. }
            | Self::DeleteCollection { collection, .. } => collection,
        }
    }

    pub fn recipe_id(&self) -> Option<&str> {
        match self {
            Self::AddRecipeToCollection { recipe_id, .. }
            | Self::RemoveRecipeFromCollection { recipe_id, .. } => Some(recipe_id),
            Self::CreateCollection { .. } | Self::DeleteCollection { .. } => None,
        }
    }

    pub fn collection_id(&self) -> Option<&str> {
        match self {
            Self::RemoveRecipeFromCollection { collection_id, .. }
            | Self::DeleteCollection { collection_id, .. } => Some(collection_id),
            Self::CreateCollection { .. } | Self::AddRecipeToCollection { .. } => None,
        }
    }

    /// Total order used by the planner: kind, collection name, recipe id.
    pub fn sort_key(&self) -> (ActionKind, &str, &str, &str) {
        (
            self.kind(),
            self.collection_name(),
            self.recipe_id().unwrap_or(""),
            self.collection_id().unwrap_or(""),
        )
    }

    /// Stable idempotency key derived from the variant and its operands.
    pub fn action_id(&self) -> String {
        hasher::composite_hash(&[
            &self.kind().to_string(),
            self.collection_name(),
            self.recipe_id().unwrap_or(""),
            self.collection_id().unwrap_or(""),
        ])
    }

    /// Human-readable one-liner.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateCollection { name } => format!("create collection \"{}\"", name),
            Self::AddRecipeToCollection {
                recipe_id,
                collection,
            } => format!("add {} to \"{}\"", recipe_id, collection),
            Self::RemoveRecipeFromCollection {
                recipe_id,
                collection,
                ..
            } => format!("remove {} from \"{}\"", recipe_id, collection),
            Self::DeleteCollection { collection, .. } => {
                format!("delete collection \"{}\"", collection)
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Ordered plan produced by the collection planner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Actions in execution order
    pub actions: Vec<Action>,

    /// Collections left out of this run: name → reason
    pub skipped_collections: BTreeMap<String, String>,

    /// Unclassified recipes kept where they are
    pub retained_recipes: u32,

    pub to_create: u32,
    pub to_add: u32,
    pub to_remove: u32,
    pub to_delete: u32,
}

// ============================================================================
// Runs and checkpoints
// ============================================================================

/// Pipeline operation type; part of the run key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Classify every exported recipe and file it into its target collection
    Import,
    /// Flatten two-level collections and strip auto-suggested recipes
    Organize,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import => write!(f, "import"),
            Self::Organize => write!(f, "organize"),
        }
    }
}

/// Checkpoint key: operation type + export content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunKey(String);

impl RunKey {
    /// Derive from a `blake3:{hex}` fingerprint of the export file.
    pub fn derive(operation: Operation, fingerprint: &str) -> Self {
        let hex = fingerprint.strip_prefix("blake3:").unwrap_or(fingerprint);
        let short: String = hex.chars().take(16).collect();
        Self(format!("{}-{}", operation, short))
    }

    /// Wrap an already-derived key (e.g. a state directory name).
    pub fn from_raw(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable progress record for one run key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Schema version
    pub schema: String,

    pub run_id: String,

    pub run_key: RunKey,

    pub operation: Operation,

    /// Action ids already applied (or found already satisfied)
    #[serde(default)]
    pub completed_action_ids: BTreeSet<String>,

    /// Remaining actions in execution order
    #[serde(default)]
    pub pending_actions: Vec<Action>,

    /// Classification cache by recipe id
    #[serde(default)]
    pub classifications: BTreeMap<String, Classification>,

    pub created_at: DateTime<Utc>,

    pub last_updated: DateTime<Utc>,

    /// Generator version
    pub generator: String,
}

// ============================================================================
// Export file
// ============================================================================

/// One source collection in an export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportCollection {
    pub name: String,
    #[serde(default)]
    pub recipe_ids: Vec<String>,
}

/// Export produced by the separate export tool. Read-only input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawExport")]
pub struct ExportFile {
    pub collections: Vec<ExportCollection>,

    /// Flat id list written by older exporters
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_recipes: Vec<String>,
}

#[derive(Deserialize)]
struct RawExport {
    #[serde(default)]
    collections: RawCollections,
    #[serde(default)]
    all_recipes: Vec<String>,
}

/// The exporter has written both a list of objects and a name → ids map.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCollections {
    List(Vec<ExportCollection>),
    Map(IndexMap<String, Vec<String>>),
}

impl Default for RawCollections {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl From<RawExport> for ExportFile {
    fn from(raw: RawExport) -> Self {
        let collections = match raw.collections {
            RawCollections::List(list) => list,
            RawCollections::Map(map) => map
                .into_iter()
                .map(|(name, recipe_ids)| ExportCollection { name, recipe_ids })
                .collect(),
        };
        Self {
            collections,
            all_recipes: raw.all_recipes,
        }
    }
}

impl ExportFile {
    /// Every recipe id mentioned anywhere in the export.
    pub fn recipe_ids(&self) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = self.all_recipes.iter().cloned().collect();
        for c in &self.collections {
            ids.extend(c.recipe_ids.iter().cloned());
        }
        ids
    }

    pub fn collection(&self, name: &str) -> Option<&ExportCollection> {
        self.collections.iter().find(|c| c.name == name)
    }
}

// ============================================================================
// larder.yaml
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LarderConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable profile name
    #[serde(default = "default_name")]
    pub name: String,

    /// Platform region code (es, de, fr, it, uk, us)
    #[serde(default = "default_region")]
    pub region: String,

    /// Where checkpoints and event logs live
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub classification: ClassificationConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Default for LarderConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: default_name(),
            region: default_region(),
            state_dir: default_state_dir(),
            rules: RulesConfig::default(),
            classification: ClassificationConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

fn default_name() -> String {
    "larder".to_string()
}

fn default_region() -> String {
    "es".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

/// How target collections are named.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingScheme {
    /// "Seafood"
    #[default]
    Flat,
    /// "☀️ Verano > Pescados"
    Seasonal,
}

/// Naming and "managed collection" rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default)]
    pub naming: NamingScheme,

    /// Regexes; a collection whose name matches any of them is managed
    #[serde(default = "default_managed_patterns")]
    pub managed_patterns: Vec<String>,

    /// Export collection holding auto-suggested recipes (organize only)
    #[serde(default = "default_managed_origin")]
    pub managed_origin_collection: Option<String>,

    /// Overrides for flat collection names
    #[serde(default)]
    pub translations: IndexMap<DishType, String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            naming: NamingScheme::default(),
            managed_patterns: default_managed_patterns(),
            managed_origin_collection: default_managed_origin(),
            translations: IndexMap::new(),
        }
    }
}

/// Two-level seasonal names, with or without an emoji prefix.
pub const SEASONAL_NAME_PATTERN: &str =
    r"^(?:.*?\s+)?(Primavera|Verano|Otoño|Invierno)\s*>\s*(.+?)\s*$";

fn default_managed_patterns() -> Vec<String> {
    vec![SEASONAL_NAME_PATTERN.to_string()]
}

fn default_managed_origin() -> Option<String> {
    Some("[Managed] Ideas sencillas".to_string())
}

/// Retry knobs shared by classification and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationConfig {
    /// Parallel classification calls
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry: RetrySettings::default(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Pause between consecutive mutations
    #[serde(default = "default_action_delay_ms")]
    pub action_delay_ms: u64,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            action_delay_ms: default_action_delay_ms(),
            retry: RetrySettings::default(),
        }
    }
}

fn default_action_delay_ms() -> u64 {
    500
}

// ============================================================================
// Provenance events
// ============================================================================

/// Event written to a run's JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        run_key: String,
        run_id: String,
        operation: Operation,
        region: String,
        resumed: bool,
        larder_version: String,
    },
    ClassificationCompleted {
        run_id: String,
        classified: u32,
        unclassified: u32,
        cached: u32,
    },
    PlanComputed {
        run_id: String,
        actions: u32,
        pending: u32,
        skipped_collections: u32,
    },
    ActionApplied {
        run_id: String,
        action_id: String,
        action: String,
        already_satisfied: bool,
    },
    ActionFailed {
        run_id: String,
        action_id: String,
        action: String,
        retryable: bool,
        error: String,
    },
    RunCompleted {
        run_id: String,
        applied: u32,
        total_seconds: f64,
    },
    RunAborted {
        run_id: String,
        reason: String,
        pending: u32,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Tests
// ============================================================================

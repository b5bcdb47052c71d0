//! LD-017: CLI subcommands — init, validate, plan, import, organize, status, reset.

use crate::classify::keyword::KeywordClassifier;
use crate::core::checkpoint::CheckpointStore;
use crate::core::orchestrator::{AbortReason, CancelFlag, Pipeline, PipelineConfig, RunReport};
use crate::core::{parser, types};
use crate::platform::snapshot::SnapshotPlatform;
use crate::provenance::hasher;
use clap::{Args, Subcommand, ValueEnum};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const DEFAULT_CONFIG: &str = "larder.yaml";

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationArg {
    Import,
    Organize,
}

impl From<OperationArg> for types::Operation {
    fn from(op: OperationArg) -> Self {
        match op {
            OperationArg::Import => Self::Import,
            OperationArg::Organize => Self::Organize,
        }
    }
}

/// Options shared by every command that talks to the platform.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to larder.yaml (defaults apply when the default file is absent)
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub file: PathBuf,

    /// Platform account snapshot (JSON) to operate on
    #[arg(long)]
    pub platform: PathBuf,

    /// Platform region (es, de, fr, it, uk, us)
    #[arg(long, env = "LARDER_REGION")]
    pub region: Option<String>,

    /// State directory (overrides larder.yaml)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a larder.yaml and state directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate larder.yaml
    Validate {
        /// Path to larder.yaml
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        file: PathBuf,
    },

    /// Show what a run would change, without mutating anything
    Plan {
        /// Export file produced by the exporter
        export: PathBuf,

        /// Which pipeline to plan
        #[arg(long, value_enum, default_value = "organize")]
        operation: OperationArg,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Classify exported recipes and file them into canonical collections
    Import {
        /// Export file produced by the exporter
        export: PathBuf,

        #[command(flatten)]
        run: RunArgs,

        /// Report the plan without applying it
        #[arg(long)]
        dry_run: bool,

        /// Ignore classifications cached by an interrupted run
        #[arg(long)]
        reclassify: bool,
    },

    /// Flatten two-level collections and strip auto-suggested recipes
    Organize {
        /// Export file produced by the exporter
        export: PathBuf,

        #[command(flatten)]
        run: RunArgs,

        /// Report the plan without applying it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show interrupted runs waiting to be resumed
    Status {
        /// Path to larder.yaml
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        file: PathBuf,

        /// State directory (overrides larder.yaml)
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },

    /// Discard the checkpoint of a run (e.g. a corrupt one)
    Reset {
        /// Export file the run was started with
        export: PathBuf,

        #[arg(long, value_enum)]
        operation: OperationArg,

        /// Path to larder.yaml
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        file: PathBuf,

        /// State directory (overrides larder.yaml)
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Also remove a leftover run lock
        #[arg(long)]
        unlock: bool,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Plan {
            export,
            operation,
            run,
        } => cmd_run(operation.into(), &export, &run, true, false),
        Commands::Import {
            export,
            run,
            dry_run,
            reclassify,
        } => cmd_run(types::Operation::Import, &export, &run, dry_run, reclassify),
        Commands::Organize {
            export,
            run,
            dry_run,
        } => cmd_run(types::Operation::Organize, &export, &run, dry_run, false),
        Commands::Status { file, state_dir } => cmd_status(&file, state_dir.as_deref()),
        Commands::Reset {
            export,
            operation,
            file,
            state_dir,
            unlock,
        } => cmd_reset(&export, operation.into(), &file, state_dir.as_deref(), unlock),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join(DEFAULT_CONFIG);
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let template = r#"version: "1.0"
name: my-larder
region: es
state_dir: state

rules:
  # flat: "Seafood"; seasonal: "☀️ Verano > Pescados"
  naming: flat
  managed_patterns:
    - '^(?:.*?\s+)?(Primavera|Verano|Otoño|Invierno)\s*>\s*(.+?)\s*$'
  managed_origin_collection: "[Managed] Ideas sencillas"
  translations: {}

classification:
  concurrency: 4
  retry:
    max_attempts: 3
    initial_delay_ms: 500

execution:
  action_delay_ms: 500
  retry:
    max_attempts: 3
    initial_delay_ms: 500
    max_delay_ms: 30000
"#;
    std::fs::write(&config_path, template)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized larder at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} (region {}, {:?} naming, {} managed pattern(s))",
            config.name,
            config.region,
            config.rules.naming,
            config.rules.managed_patterns.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Load larder.yaml; a missing default file means built-in defaults.
fn load_config(file: &Path) -> Result<types::LarderConfig, String> {
    if !file.exists() && file == Path::new(DEFAULT_CONFIG) {
        info!("no {} found, using defaults", DEFAULT_CONFIG);
        return Ok(types::LarderConfig::default());
    }
    parser::parse_and_validate(file)
}

fn resolve_state_dir(config: &types::LarderConfig, state_dir: Option<&Path>) -> PathBuf {
    state_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.state_dir.clone())
}

fn cmd_run(
    operation: types::Operation,
    export: &Path,
    args: &RunArgs,
    dry_run: bool,
    reclassify: bool,
) -> Result<(), String> {
    let mut config = load_config(&args.file)?;
    if let Some(region) = &args.region {
        config.region.clone_from(region);
    }
    let state_dir = resolve_state_dir(&config, args.state_dir.as_deref());

    let mut pipeline_config = PipelineConfig::from_config(&config, operation)?;
    pipeline_config.dry_run = dry_run;
    pipeline_config.reclassify = reclassify;

    let export_bytes = std::fs::read(export)
        .map_err(|e| format!("cannot read export {}: {}", export.display(), e))?;
    let platform = SnapshotPlatform::open(&args.platform)?;

    let mut pipeline = Pipeline::new(&platform, CheckpointStore::new(&state_dir), pipeline_config);
    if operation == types::Operation::Import {
        pipeline = pipeline.with_classifier(Arc::new(KeywordClassifier::new()));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))?;
    let cancel = CancelFlag::new();
    let report = runtime
        .block_on(async {
            let flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt: finishing the in-flight action, then stopping");
                    flag.cancel();
                }
            });
            pipeline.run(&export_bytes, &cancel).await
        })
        .map_err(|e| e.to_string())?;

    print!("{}", render_report(&report));

    match &report.failure {
        None => Ok(()),
        Some(AbortReason::Cancelled) => Err(format!(
            "run {} cancelled with {} action(s) pending; re-run to resume",
            report.run_key,
            report.pending.len()
        )),
        Some(reason @ AbortReason::ActionFailed { .. }) => Err(format!(
            "run {} aborted: {}; re-run to resume",
            report.run_key, reason
        )),
    }
}

fn symbol(action: &types::Action) -> &'static str {
    match action.kind() {
        types::ActionKind::Create | types::ActionKind::Add => "+",
        types::ActionKind::Remove | types::ActionKind::Delete => "-",
    }
}

fn count_str(n: Option<usize>) -> String {
    n.map(|n| n.to_string()).unwrap_or_else(|| "(absent)".to_string())
}

/// Render a run report for the terminal.
fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} [{}]{}",
        report.operation,
        report.run_key,
        report.run_id,
        if report.resumed { " (resumed)" } else { "" }
    );
    let stats = &report.classification;
    let _ = writeln!(
        out,
        "  classified: {}, unclassified: {}, cached: {}, retained in place: {}",
        stats.classified, stats.unclassified, stats.cached, report.retained_recipes
    );
    if stats.conflicting > 0 {
        let _ = writeln!(
            out,
            "  {} recipe(s) sit in several two-level collections; the first name was used",
            stats.conflicting
        );
    }
    if report.missing_recipes > 0 {
        let _ = writeln!(
            out,
            "  {} exported recipe(s) no longer on the platform",
            report.missing_recipes
        );
    }
    for (name, reason) in &report.skipped_collections {
        let _ = writeln!(out, "  SKIPPED: \"{}\" ({})", name, reason);
    }

    if let Some(dry) = &report.dry_run {
        out.push('\n');
        for action in &dry.actions {
            let _ = writeln!(out, "  {} {}", symbol(action), action);
        }
        out.push('\n');
        for (name, (before, after)) in &dry.delta {
            let _ = writeln!(out, "  {}: {} -> {}", name, count_str(*before), count_str(*after));
        }
        out.push('\n');
        let _ = writeln!(
            out,
            "Plan: {} action(s) ({} already completed by an earlier attempt). Dry run, nothing applied.",
            dry.actions.len(),
            report.skipped_completed
        );
        return out;
    }

    out.push('\n');
    for action in &report.applied {
        let _ = writeln!(out, "  {} {}", symbol(action), action);
    }
    out.push('\n');

    if let Some(reason) = &report.failure {
        match report.last_applied() {
            Some(last) => {
                let _ = writeln!(out, "Last applied: {}", last);
            }
            None => out.push_str("Last applied: (none)\n"),
        }
        match reason {
            AbortReason::ActionFailed { action, failure } => {
                let _ = writeln!(out, "FAILED: {} ({})", action, failure);
            }
            AbortReason::Cancelled => out.push_str("CANCELLED at an action boundary\n"),
        }
        let _ = writeln!(out, "Pending ({}):", report.pending.len());
        for action in &report.pending {
            let _ = writeln!(out, "  {} {}", symbol(action), action);
        }
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "{}: {} applied ({} already satisfied), {} pending ({:.1}s)",
        report.phase,
        report.applied.len(),
        report.already_satisfied,
        report.pending.len(),
        report.duration.as_secs_f64()
    );
    out
}

fn cmd_status(file: &Path, state_dir: Option<&Path>) -> Result<(), String> {
    let config = load_config(file)?;
    let store = CheckpointStore::new(resolve_state_dir(&config, state_dir));
    let runs = store.list()?;

    if runs.is_empty() {
        println!("No interrupted runs.");
        return Ok(());
    }

    for (key, loaded) in &runs {
        let locked = if store.is_locked(key) { " [locked]" } else { "" };
        match loaded {
            Ok(state) => {
                println!("Run: {} ({}){}", key, state.run_id, locked);
                println!("  Operation: {}", state.operation);
                println!("  Started:   {}", state.created_at.to_rfc3339());
                println!("  Updated:   {}", state.last_updated.to_rfc3339());
                println!(
                    "  Actions:   {} completed, {} pending",
                    state.completed_action_ids.len(),
                    state.pending_actions.len()
                );
                println!("  Cached classifications: {}", state.classifications.len());
                for action in &state.pending_actions {
                    println!("    {} {}", symbol(action), action);
                }
            }
            Err(e) => println!("Run: {}{}\n  ERROR: {}", key, locked, e),
        }
    }
    Ok(())
}

fn cmd_reset(
    export: &Path,
    operation: types::Operation,
    file: &Path,
    state_dir: Option<&Path>,
    unlock: bool,
) -> Result<(), String> {
    let config = load_config(file)?;
    let store = CheckpointStore::new(resolve_state_dir(&config, state_dir));
    let key = types::RunKey::derive(operation, &hasher::fingerprint_file(export)?);

    let cleared = store.clear(&key).map_err(|e| e.to_string())?;
    println!(
        "{}: checkpoint {}",
        key,
        if cleared { "removed" } else { "not found" }
    );
    if unlock {
        let removed = store.unlock(&key).map_err(|e| e.to_string())?;
        println!(
            "{}: run lock {}",
            key,
            if removed { "removed" } else { "not found" }
        );
    }
    Ok(())
}

//! LD-015: Append-only JSONL provenance event log, one file per run key.

use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use chrono::{SecondsFormat, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};

/// RFC 3339 UTC timestamp with second precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Event log path for a run key.
pub fn event_log_path(state_dir: &Path, run_key: &str) -> PathBuf {
    state_dir.join(run_key).join("events.jsonl")
}

/// Append an event to the run's event log.
pub fn append_event(state_dir: &Path, run_key: &str, event: ProvenanceEvent) -> Result<(), String> {
    let path = event_log_path(state_dir, run_key);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create state dir: {}", e))?;
    }

    let te = TimestampedEvent {
        ts: now_rfc3339(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;

    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;

    Ok(())
}

/// Read every event back, skipping lines that do not parse.
pub fn read_events(state_dir: &Path, run_key: &str) -> Result<Vec<TimestampedEvent>, String> {
    let path = event_log_path(state_dir, run_key);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

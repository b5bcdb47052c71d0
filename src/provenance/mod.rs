//! Provenance — content fingerprints and the per-run JSONL event log.

pub mod eventlog;
pub mod hasher;

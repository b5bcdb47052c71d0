//! Core logic — types, config parsing, naming rules, classification,
//! planning, execution, checkpointing, and the pipeline that ties them.

pub mod checkpoint;
pub mod classifier;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod parser;
pub mod planner;
pub mod retry;
pub mod rules;
pub mod types;

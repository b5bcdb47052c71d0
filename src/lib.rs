//! Larder — reorganizes recipe collections on a recipe platform account.
//!
//! Classifies exported recipes, plans the minimal set of collection
//! mutations, and applies them with retry and resumable checkpoints.

pub mod classify;
pub mod cli;
pub mod core;
pub mod platform;
pub mod provenance;

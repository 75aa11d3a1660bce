//! Turns a configuration and a merge request into label, lifecycle and reviewer changes.
pub mod actions;
pub mod catalog;
mod context;
pub mod lock;
pub mod periodic;
pub mod process;
pub mod reconcile;
pub mod reviewers;
pub mod status;

pub use catalog::{BackstageCatalog, OwnerCatalog};
pub use context::EngineContext;
pub use periodic::{start_periodic_evaluation, PeriodicEvaluation};
pub use process::{load_remote_config, process_merge_request, EvaluationState};

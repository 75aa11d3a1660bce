//! Test-only helpers: merge request fixtures and an in-memory SCM.
pub mod mock;

#![recursion_limit = "256"]
//! This is the library of scm-engine, which keeps merge request labels, lifecycle state and
//! reviewers in sync with rules stored next to the code.
pub mod config;
pub mod engine;
pub mod scm;
pub mod script;
pub mod server;
pub mod utils;

#[cfg(test)]
mod tests;

//! Cache-first view of CI/CD state across GitLab and GitHub.
//!
//! Reads are answered from per-platform freshness caches and never hit the
//! network. A background refresher keeps those caches warm through a request
//! gate that deduplicates, bounds and rate-limits outbound calls.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod gate;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod refresher;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

//! Generic freshness cache for the read side.
//!
//! This module provides:
//! - A string-keyed store with fresh / stale / expired windows
//! - The key grammar shared by reads and refreshes
//! - Read results that say whether data was fresh, stale or missing
//! - Recency extraction used to prioritise refreshes

pub mod key;
mod storage;
mod traits;

pub use key::{CacheKey, BRANCH_LIST_LIMIT, FALLBACK_BRANCH, PIPELINE_LIST_LIMIT};
pub use storage::{CacheEntry, CacheStats, FreshnessCache, Lookup};
pub use traits::{sort_by_recency, CacheResult, CacheSource, Recency};

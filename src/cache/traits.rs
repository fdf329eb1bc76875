//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};

use crate::platform::types::{Branch, Issue, MergeRequest, Pipeline, Project};

/// Trait for payloads that carry a last-modified timestamp.
///
/// The timestamp becomes the entry's recency hint, so recently active
/// projects get refreshed first, and it orders aggregated views.
pub trait Recency {
  fn recency(&self) -> Option<DateTime<Utc>>;
}

impl Recency for Project {
  fn recency(&self) -> Option<DateTime<Utc>> {
    self.last_activity
  }
}

impl Recency for Pipeline {
  fn recency(&self) -> Option<DateTime<Utc>> {
    self.last_change()
  }
}

impl Recency for Branch {
  fn recency(&self) -> Option<DateTime<Utc>> {
    self.last_commit_at
  }
}

impl Recency for MergeRequest {
  fn recency(&self) -> Option<DateTime<Utc>> {
    self.updated_at.or(self.created_at)
  }
}

impl Recency for Issue {
  fn recency(&self) -> Option<DateTime<Utc>> {
    self.updated_at.or(self.created_at)
  }
}

/// Sort most recently active first; entries without a timestamp go last.
pub fn sort_by_recency<T: Recency>(items: &mut [T]) {
  items.sort_by(|a, b| b.recency().cmp(&a.recency()));
}

/// Result from a cache read, including data and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data, or the empty sentinel on a miss
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (absent on a miss)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn hit(data: T, cached_at: DateTime<Utc>, is_fresh: bool) -> Self {
    Self {
      data,
      source: if is_fresh {
        CacheSource::Fresh
      } else {
        CacheSource::Stale
      },
      cached_at: Some(cached_at),
    }
  }

  pub fn miss(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Miss,
      cached_at: None,
    }
  }

  pub fn is_hit(&self) -> bool {
    self.source != CacheSource::Miss
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Within the fresh TTL
  Fresh,
  /// Past the fresh TTL but still inside the stale window
  Stale,
  /// Nothing usable cached
  Miss,
}

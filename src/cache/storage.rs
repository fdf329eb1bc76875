//! In-memory freshness cache with fresh/stale/expired semantics.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};

/// One stored value plus its freshness window.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub value: V,
  pub cached_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
  pub stale_until: DateTime<Utc>,
  /// Project or entity the entry belongs to
  pub owner_key: String,
  /// Activity timestamp used to order refreshes
  pub recency_hint: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
  Fresh,
  Stale,
  Expired,
}

impl<V> CacheEntry<V> {
  fn freshness(&self, now: DateTime<Utc>) -> Freshness {
    if now < self.expires_at {
      Freshness::Fresh
    } else if now <= self.stale_until {
      Freshness::Stale
    } else {
      Freshness::Expired
    }
  }
}

/// A cache hit.
#[derive(Debug, Clone)]
pub struct Lookup<V> {
  pub value: V,
  pub is_fresh: bool,
  pub cached_at: DateTime<Utc>,
}

/// Entry counts by freshness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub fresh: usize,
  pub stale: usize,
  /// Past the stale window, waiting for lazy eviction
  pub expired: usize,
  pub total: usize,
}

/// String-keyed store with a `ttl`/`stale_ttl` freshness window.
///
/// Entries are overwritten wholesale on every `set` and dropped lazily once a
/// `get` finds them past `stale_until`; there is no background sweep.
pub struct FreshnessCache<V> {
  entries: RwLock<HashMap<String, CacheEntry<V>>>,
  ttl: Duration,
  stale_ttl: Duration,
}

impl<V: Clone> FreshnessCache<V> {
  /// Create a cache. A `stale_ttl` shorter than `ttl` is raised to `ttl`.
  pub fn new(ttl: Duration, stale_ttl: Duration) -> Self {
    let stale_ttl = if stale_ttl < ttl {
      tracing::warn!(
        ttl_secs = ttl.num_seconds(),
        stale_ttl_secs = stale_ttl.num_seconds(),
        "Stale TTL shorter than fresh TTL, raising it"
      );
      ttl
    } else {
      stale_ttl
    };

    Self {
      entries: RwLock::new(HashMap::new()),
      ttl,
      stale_ttl,
    }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  pub fn stale_ttl(&self) -> Duration {
    self.stale_ttl
  }

  fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry<V>>> {
    self.entries.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry<V>>> {
    self.entries.write().unwrap_or_else(|e| e.into_inner())
  }

  pub fn get(&self, key: &str) -> Option<Lookup<V>> {
    self.get_at(key, Utc::now())
  }

  /// Look up `key` as of `now`. `None` when absent or past the stale window.
  pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<Lookup<V>> {
    {
      let entries = self.read();
      let entry = entries.get(key)?;
      let state = entry.freshness(now);
      if state != Freshness::Expired {
        return Some(Lookup {
          value: entry.value.clone(),
          is_fresh: state == Freshness::Fresh,
          cached_at: entry.cached_at,
        });
      }
    }

    // Re-check under the write lock: a refresh may have landed in between.
    let mut entries = self.write();
    if entries
      .get(key)
      .is_some_and(|entry| entry.freshness(now) == Freshness::Expired)
    {
      entries.remove(key);
    }
    None
  }

  pub fn set(&self, key: &str, value: V, owner_key: &str, recency_hint: Option<DateTime<Utc>>) {
    self.set_at(key, value, owner_key, recency_hint, Utc::now())
  }

  /// Unconditionally overwrite `key`, stamping the window from `now`.
  pub fn set_at(
    &self,
    key: &str,
    value: V,
    owner_key: &str,
    recency_hint: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
  ) {
    let entry = CacheEntry {
      value,
      cached_at: now,
      expires_at: now + self.ttl,
      stale_until: now + self.stale_ttl,
      owner_key: owner_key.to_string(),
      recency_hint,
    };
    self.write().insert(key.to_string(), entry);
  }

  /// Remove one key. Returns how many entries were removed (0 or 1).
  pub fn invalidate(&self, key: &str) -> usize {
    usize::from(self.write().remove(key).is_some())
  }

  /// Remove every key starting with `prefix`.
  pub fn invalidate_pattern(&self, prefix: &str) -> usize {
    let mut entries = self.write();
    let before = entries.len();
    entries.retain(|key, _| !key.starts_with(prefix));
    before - entries.len()
  }

  pub fn expired_keys(&self) -> Vec<String> {
    self.expired_keys_at(Utc::now())
  }

  /// Keys past their fresh TTL but still inside the stale window, most
  /// recently active first.
  pub fn expired_keys_at(&self, now: DateTime<Utc>) -> Vec<String> {
    let entries = self.read();
    let mut expired: Vec<(&String, Option<DateTime<Utc>>)> = entries
      .iter()
      .filter(|(_, entry)| entry.expires_at < now && now <= entry.stale_until)
      .map(|(key, entry)| (key, entry.recency_hint))
      .collect();

    // Ties broken by key so the order is deterministic.
    expired.sort_by(|(ka, ra), (kb, rb)| rb.cmp(ra).then_with(|| ka.cmp(kb)));
    expired.into_iter().map(|(key, _)| key.clone()).collect()
  }

  /// Owner key of a stored entry, regardless of freshness.
  pub fn owner_of(&self, key: &str) -> Option<String> {
    self.read().get(key).map(|entry| entry.owner_key.clone())
  }

  pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
    let mut keys: Vec<String> = self
      .read()
      .keys()
      .filter(|key| key.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  pub fn stats(&self) -> CacheStats {
    self.stats_at(Utc::now())
  }

  pub fn stats_at(&self, now: DateTime<Utc>) -> CacheStats {
    let entries = self.read();
    let mut stats = CacheStats {
      total: entries.len(),
      ..CacheStats::default()
    };
    for entry in entries.values() {
      match entry.freshness(now) {
        Freshness::Fresh => stats.fresh += 1,
        Freshness::Stale => stats.stale += 1,
        Freshness::Expired => stats.expired += 1,
      }
    }
    stats
  }

  pub fn len(&self) -> usize {
    self.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.read().is_empty()
  }
}

//! Cache-only platform client with an explicit refresh path.
//!
//! Reads never touch the network: they answer from the freshness cache, stale
//! or not, and fall back to an empty result. Writes happen only through
//! [`CachedPlatformClient::force_refresh`], which goes through the request
//! gate and overwrites the entry on success.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::cache::{CacheKey, CacheResult, CacheStats, FreshnessCache, Recency};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::gate::{GatePolicy, RateState, RequestGate};

use super::types::{Branch, Issue, MergeRequest, Pipeline, Project, UserProfile};
use super::{Capabilities, PlatformAdapter, ProjectPage};

/// Payload shapes stored in the cache, one per key method.
#[derive(Debug, Clone)]
pub enum CachedValue {
  Projects(Vec<Project>),
  ProjectCount(u64),
  LatestPipeline(Option<Pipeline>),
  Pipelines(Vec<Pipeline>),
  Branches(Vec<Branch>),
  Branch(Branch),
  MergeRequests(Vec<MergeRequest>),
  Issues(Vec<Issue>),
  User(UserProfile),
}

impl CachedValue {
  /// Most recent activity in the payload; becomes the entry's recency hint.
  pub fn recency(&self) -> Option<DateTime<Utc>> {
    fn newest<T: Recency>(items: &[T]) -> Option<DateTime<Utc>> {
      items.iter().filter_map(Recency::recency).max()
    }

    match self {
      Self::Projects(items) => newest(items),
      Self::ProjectCount(_) | Self::User(_) => None,
      Self::LatestPipeline(pipeline) => pipeline.as_ref().and_then(Recency::recency),
      Self::Pipelines(items) => newest(items),
      Self::Branches(items) => newest(items),
      Self::Branch(branch) => branch.recency(),
      Self::MergeRequests(items) => newest(items),
      Self::Issues(items) => newest(items),
    }
  }
}

/// Cache configuration for one platform.
#[derive(Debug, Clone, Copy)]
pub struct CacheWindow {
  pub ttl: Duration,
  pub stale_ttl: Duration,
}

impl Default for CacheWindow {
  fn default() -> Self {
    Self {
      ttl: Duration::minutes(5),
      stale_ttl: Duration::hours(1),
    }
  }
}

/// Per-platform cache facade: adapter, cache and request gate.
pub struct CachedPlatformClient {
  name: String,
  capabilities: Capabilities,
  adapter: Arc<dyn PlatformAdapter>,
  cache: FreshnessCache<CachedValue>,
  gate: RequestGate<CachedValue>,
  pages: RequestGate<ProjectPage>,
}

/// Pull one variant out of a cached value.
///
/// An entry of another shape is logged and read as a miss.
macro_rules! cached_as {
  ($self:ident, $key:expr, $variant:ident, $expected:literal, $empty:expr) => {{
    let key = $key.to_string();
    match $self.cache.get(&key) {
      None => CacheResult::miss($empty),
      Some(hit) => match hit.value {
        CachedValue::$variant(data) => CacheResult::hit(data, hit.cached_at, hit.is_fresh),
        _ => {
          $self.payload_mismatch(&key, $expected);
          CacheResult::miss($empty)
        }
      },
    }
  }};
}

impl CachedPlatformClient {
  pub fn new(adapter: Arc<dyn PlatformAdapter>, window: CacheWindow, policy: GatePolicy) -> Self {
    let name = adapter.name().to_string();
    let capabilities = adapter.capabilities();
    let gate = RequestGate::new(&name, policy);
    let pages = gate.sharing_limits();

    tracing::info!(
      platform = %name,
      merge_requests = capabilities.merge_requests,
      issues = capabilities.issues,
      current_user = capabilities.current_user,
      "Registered platform"
    );

    Self {
      cache: FreshnessCache::new(window.ttl, window.stale_ttl),
      name,
      capabilities,
      adapter,
      gate,
      pages,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  pub fn cache(&self) -> &FreshnessCache<CachedValue> {
    &self.cache
  }

  pub fn stats(&self) -> CacheStats {
    self.cache.stats()
  }

  pub fn rate_state(&self) -> RateState {
    self.gate.rate_state()
  }

  // ==========================================================================
  // Cache-only reads
  // ==========================================================================

  pub fn get_projects(&self) -> CacheResult<Vec<Project>> {
    cached_as!(self, CacheKey::Projects, Projects, "a project list", Vec::new())
  }

  pub fn get_project_count(&self) -> CacheResult<u64> {
    cached_as!(self, CacheKey::ProjectCount, ProjectCount, "a project count", 0)
  }

  pub fn get_latest_pipeline(
    &self,
    project_id: &str,
    branch: &str,
  ) -> CacheResult<Option<Pipeline>> {
    cached_as!(
      self,
      CacheKey::latest_pipeline(project_id, branch),
      LatestPipeline,
      "a latest pipeline",
      None
    )
  }

  pub fn get_pipelines(&self, project_id: &str, limit: u32) -> CacheResult<Vec<Pipeline>> {
    let key = CacheKey::Pipelines {
      project_id: project_id.to_string(),
      limit,
    };
    cached_as!(self, key, Pipelines, "a pipeline list", Vec::new())
  }

  pub fn get_branches(&self, project_id: &str, limit: u32) -> CacheResult<Vec<Branch>> {
    let key = CacheKey::Branches {
      project_id: project_id.to_string(),
      limit,
    };
    cached_as!(self, key, Branches, "a branch list", Vec::new())
  }

  pub fn get_branch(&self, project_id: &str, name: &str) -> CacheResult<Option<Branch>> {
    let key = CacheKey::branch(project_id, name).to_string();
    match self.cache.get(&key) {
      None => CacheResult::miss(None),
      Some(hit) => match hit.value {
        CachedValue::Branch(branch) => CacheResult::hit(Some(branch), hit.cached_at, hit.is_fresh),
        _ => {
          self.payload_mismatch(&key, "a branch");
          CacheResult::miss(None)
        }
      },
    }
  }

  pub fn get_merge_requests(&self, project_id: &str) -> CacheResult<Vec<MergeRequest>> {
    cached_as!(
      self,
      CacheKey::merge_requests(project_id),
      MergeRequests,
      "a merge request list",
      Vec::new()
    )
  }

  pub fn get_issues(&self, project_id: &str) -> CacheResult<Vec<Issue>> {
    cached_as!(
      self,
      CacheKey::issues(project_id),
      Issues,
      "an issue list",
      Vec::new()
    )
  }

  pub fn get_current_user(&self) -> CacheResult<Option<UserProfile>> {
    let key = CacheKey::CurrentUser.to_string();
    match self.cache.get(&key) {
      None => CacheResult::miss(None),
      Some(hit) => match hit.value {
        CachedValue::User(user) => CacheResult::hit(Some(user), hit.cached_at, hit.is_fresh),
        _ => {
          self.payload_mismatch(&key, "a user profile");
          CacheResult::miss(None)
        }
      },
    }
  }

  fn payload_mismatch(&self, key: &str, expected: &str) {
    tracing::warn!(
      platform = %self.name,
      key,
      expected,
      "Cache entry holds another payload shape, reading as a miss"
    );
  }

  // ==========================================================================
  // Refresh path
  // ==========================================================================

  /// Fetch the value behind `key` through the gate and store it.
  ///
  /// Malformed keys and unsupported capabilities fail before any adapter
  /// call. Nothing is written when the fetch fails.
  pub async fn force_refresh(&self, key: &str, cancel: &CancelToken) -> Result<()> {
    let parsed: CacheKey = key.parse()?;
    self.check_capability(&parsed)?;

    let adapter = &self.adapter;
    let value = self
      .gate
      .execute(key, cancel, || {
        let parsed = parsed.clone();
        async move { fetch(adapter.as_ref(), &parsed).await }
      })
      .await?;

    let owner = parsed.project_id().unwrap_or(&self.name).to_string();
    let recency = value.recency();
    self.cache.set(key, value, &owner, recency);

    tracing::debug!(platform = %self.name, key, "Cache entry refreshed");
    Ok(())
  }

  /// Refresh up to `max` entries that went stale, most recently active first.
  ///
  /// Returns how many refreshes succeeded.
  pub async fn refresh_expired(&self, max: usize, cancel: &CancelToken) -> usize {
    let keys = self.cache.expired_keys();
    let mut refreshed = 0;

    for key in keys.into_iter().take(max) {
      if cancel.is_cancelled() {
        break;
      }
      match self.force_refresh(&key, cancel).await {
        Ok(()) => refreshed += 1,
        Err(e) if e.is_cancelled() => break,
        Err(e) => {
          tracing::warn!(platform = %self.name, key = %key, error = %e, "Failed to refresh stale entry")
        }
      }
    }
    refreshed
  }

  /// Fetch one page of the project listing through the gate. Not cached.
  pub async fn fetch_project_page(
    &self,
    page: u32,
    per_page: u32,
    cancel: &CancelToken,
  ) -> Result<ProjectPage> {
    let key = format!("ListProjects:{}:{}", page, per_page);
    let adapter = &self.adapter;
    self
      .pages
      .execute(&key, cancel, || async move {
        adapter.list_projects(page, per_page).await
      })
      .await
  }

  /// Overwrite the project list entry.
  pub fn store_projects(&self, projects: Vec<Project>) {
    let value = CachedValue::Projects(projects);
    let recency = value.recency();
    self
      .cache
      .set(&CacheKey::Projects.to_string(), value, &self.name, recency);
  }

  /// Drop everything cached for one project. Returns how many entries went.
  pub fn invalidate_project(&self, project_id: &str) -> usize {
    let (exact, prefixes) = crate::cache::key::project_scopes(project_id);
    let removed = exact
      .iter()
      .map(|key| self.cache.invalidate(key))
      .chain(prefixes.iter().map(|prefix| self.cache.invalidate_pattern(prefix)))
      .sum();
    tracing::debug!(platform = %self.name, project_id, removed, "Invalidated project");
    removed
  }

  fn check_capability(&self, key: &CacheKey) -> Result<()> {
    let operation = match key {
      CacheKey::MergeRequests { .. } if !self.capabilities.merge_requests => "merge requests",
      CacheKey::Issues { .. } if !self.capabilities.issues => "issues",
      CacheKey::CurrentUser if !self.capabilities.current_user => "current user",
      _ => return Ok(()),
    };
    Err(Error::Unsupported {
      platform: self.name.clone(),
      operation,
    })
  }
}

/// Page size used when the whole project list is refreshed in one call.
const DIRECT_PAGE_SIZE: u32 = 100;

/// Map a key onto the matching adapter call.
async fn fetch(
  adapter: &dyn PlatformAdapter,
  key: &CacheKey,
) -> Result<super::Fetched<CachedValue>> {
  let fetched = match key {
    CacheKey::Projects => {
      let mut projects = Vec::new();
      let mut page = 1;
      loop {
        let fetched = adapter.list_projects(page, DIRECT_PAGE_SIZE).await?;
        let has_next = fetched.value.has_next;
        projects.extend(fetched.value.items);
        if !has_next {
          break super::Fetched::with_quota(CachedValue::Projects(projects), fetched.quota);
        }
        page += 1;
      }
    }
    CacheKey::ProjectCount => adapter
      .project_count()
      .await?
      .map(CachedValue::ProjectCount),
    CacheKey::LatestPipeline { project_id, branch } => adapter
      .latest_pipeline(project_id, branch)
      .await?
      .map(CachedValue::LatestPipeline),
    CacheKey::Pipelines { project_id, limit } => adapter
      .pipelines(project_id, *limit)
      .await?
      .map(CachedValue::Pipelines),
    CacheKey::Branches { project_id, limit } => adapter
      .branches(project_id, *limit)
      .await?
      .map(CachedValue::Branches),
    CacheKey::Branch { project_id, name } => adapter
      .branch(project_id, name)
      .await?
      .map(CachedValue::Branch),
    CacheKey::MergeRequests { project_id } => adapter
      .merge_requests(project_id)
      .await?
      .map(CachedValue::MergeRequests),
    CacheKey::Issues { project_id } => adapter
      .issues(project_id)
      .await?
      .map(CachedValue::Issues),
    CacheKey::CurrentUser => adapter.current_user().await?.map(CachedValue::User),
  };
  Ok(fetched)
}

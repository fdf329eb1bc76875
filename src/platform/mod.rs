//! Platform adapter contract and the adapters shipped with pipewatch.
//!
//! The core never talks HTTP itself. Everything it needs from a CI/CD host
//! goes through [`PlatformAdapter`], and every adapter call made by the core
//! goes through a [`crate::gate::RequestGate`].

pub mod cached_client;
pub mod github;
pub mod gitlab;
mod http;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use types::{Branch, Issue, MergeRequest, Pipeline, Project, UserProfile};

pub use cached_client::CachedPlatformClient;

/// Optional features a platform may lack.
///
/// Read once when the adapter is registered; the hot path only checks these
/// flags instead of probing the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
  pub merge_requests: bool,
  pub issues: bool,
  pub current_user: bool,
}

impl Capabilities {
  pub const ALL: Capabilities = Capabilities {
    merge_requests: true,
    issues: true,
    current_user: true,
  };

  pub const PIPELINES_ONLY: Capabilities = Capabilities {
    merge_requests: false,
    issues: false,
    current_user: false,
  };
}

/// Quota metadata reported alongside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
  pub remaining: i64,
  pub limit: Option<i64>,
  pub reset_at: Option<DateTime<Utc>>,
}

/// A typed adapter response plus whatever quota info came with it.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
  pub value: T,
  pub quota: Option<RateQuota>,
}

impl<T> Fetched<T> {
  pub fn new(value: T) -> Self {
    Self { value, quota: None }
  }

  pub fn with_quota(value: T, quota: Option<RateQuota>) -> Self {
    Self { value, quota }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
    Fetched {
      value: f(self.value),
      quota: self.quota,
    }
  }
}

/// One page of a project listing.
#[derive(Debug, Clone, Default)]
pub struct ProjectPage {
  pub items: Vec<Project>,
  pub has_next: bool,
}

/// Per-platform capability consumed by the core.
///
/// Errors must be classified: [`Error::Transient`] is retried,
/// [`Error::RateLimited`] is waited out, anything else is final.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
  /// Stable platform name, also used as the log field and allow-list scope.
  fn name(&self) -> &str;

  fn capabilities(&self) -> Capabilities;

  /// List projects, 1-based `page`.
  async fn list_projects(&self, page: u32, per_page: u32) -> Result<Fetched<ProjectPage>>;

  /// Total number of visible projects. May be an estimate.
  async fn project_count(&self) -> Result<Fetched<u64>>;

  /// Latest pipeline on `branch`, `None` if the branch never ran one.
  async fn latest_pipeline(&self, project_id: &str, branch: &str)
    -> Result<Fetched<Option<Pipeline>>>;

  async fn pipelines(&self, project_id: &str, limit: u32) -> Result<Fetched<Vec<Pipeline>>>;

  async fn branches(&self, project_id: &str, limit: u32) -> Result<Fetched<Vec<Branch>>>;

  async fn branch(&self, project_id: &str, name: &str) -> Result<Fetched<Branch>>;

  async fn merge_requests(&self, _project_id: &str) -> Result<Fetched<Vec<MergeRequest>>> {
    Err(self.unsupported("merge requests"))
  }

  async fn issues(&self, _project_id: &str) -> Result<Fetched<Vec<Issue>>> {
    Err(self.unsupported("issues"))
  }

  async fn current_user(&self) -> Result<Fetched<UserProfile>> {
    Err(self.unsupported("current user"))
  }

  fn unsupported(&self, operation: &'static str) -> Error {
    Error::Unsupported {
      platform: self.name().to_string(),
      operation,
    }
  }
}

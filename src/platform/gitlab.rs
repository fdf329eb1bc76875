//! GitLab REST v4 adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::error::{Error, Result};

use super::http::{header, QuotaHeaders, RestClient};
use super::types::{Branch, Issue, MergeRequest, Pipeline, PipelineStatus, Project, UserProfile};
use super::{Capabilities, Fetched, PlatformAdapter, ProjectPage};

pub const DEFAULT_URL: &str = "https://gitlab.com";

const QUOTA_HEADERS: QuotaHeaders = QuotaHeaders {
  remaining: "ratelimit-remaining",
  limit: "ratelimit-limit",
  reset: "ratelimit-reset",
};

/// Open merge requests and issues fetched per project
const ITEM_PAGE_SIZE: u32 = 100;

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiProject {
  id: u64,
  name: String,
  path_with_namespace: String,
  web_url: String,
  default_branch: Option<String>,
  last_activity_at: Option<DateTime<Utc>>,
  #[serde(default)]
  archived: bool,
}

#[derive(Debug, Deserialize)]
struct ApiPipeline {
  id: u64,
  project_id: u64,
  #[serde(rename = "ref")]
  git_ref: String,
  sha: String,
  status: String,
  web_url: String,
  created_at: Option<DateTime<Utc>>,
  updated_at: Option<DateTime<Utc>>,
  duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiCommit {
  id: String,
  title: Option<String>,
  committed_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiBranch {
  name: String,
  #[serde(default)]
  default: bool,
  #[serde(default)]
  protected: bool,
  web_url: Option<String>,
  commit: ApiCommit,
}

#[derive(Debug, Deserialize)]
struct ApiAuthor {
  username: String,
}

#[derive(Debug, Deserialize)]
struct ApiMergeRequest {
  iid: u64,
  title: String,
  author: ApiAuthor,
  source_branch: String,
  target_branch: String,
  #[serde(default)]
  draft: bool,
  #[serde(default)]
  work_in_progress: bool,
  web_url: String,
  created_at: Option<DateTime<Utc>>,
  updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
  iid: u64,
  title: String,
  author: ApiAuthor,
  #[serde(default)]
  labels: Vec<String>,
  web_url: String,
  created_at: Option<DateTime<Utc>>,
  updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
  username: String,
  name: String,
  avatar_url: Option<String>,
  web_url: Option<String>,
}

impl ApiProject {
  fn into_project(self, platform: &str) -> Project {
    Project {
      id: self.id.to_string(),
      name: self.name,
      full_path: self.path_with_namespace,
      web_url: self.web_url,
      default_branch: self.default_branch.unwrap_or_default(),
      platform: platform.to_string(),
      last_activity: self.last_activity_at,
      archived: self.archived,
    }
  }
}

impl From<ApiPipeline> for Pipeline {
  fn from(api: ApiPipeline) -> Self {
    Pipeline {
      id: api.id.to_string(),
      project_id: api.project_id.to_string(),
      branch: api.git_ref,
      sha: api.sha,
      status: PipelineStatus::parse(&api.status),
      web_url: api.web_url,
      created_at: api.created_at,
      updated_at: api.updated_at,
      duration_secs: api.duration.map(|secs| secs.max(0.0) as u64),
    }
  }
}

impl ApiBranch {
  fn into_branch(self, project_id: &str) -> Branch {
    Branch {
      name: self.name,
      project_id: project_id.to_string(),
      is_default: self.default,
      protected: self.protected,
      commit_sha: self.commit.id,
      commit_title: self.commit.title,
      last_commit_at: self.commit.committed_date,
      web_url: self.web_url,
    }
  }
}

impl ApiMergeRequest {
  fn into_merge_request(self, project_id: &str) -> MergeRequest {
    MergeRequest {
      id: self.iid.to_string(),
      project_id: project_id.to_string(),
      title: self.title,
      author: self.author.username,
      source_branch: self.source_branch,
      target_branch: self.target_branch,
      draft: self.draft || self.work_in_progress,
      web_url: self.web_url,
      created_at: self.created_at,
      updated_at: self.updated_at,
    }
  }
}

impl ApiIssue {
  fn into_issue(self, project_id: &str) -> Issue {
    Issue {
      id: self.iid.to_string(),
      project_id: project_id.to_string(),
      title: self.title,
      author: self.author.username,
      labels: self.labels,
      web_url: self.web_url,
      created_at: self.created_at,
      updated_at: self.updated_at,
    }
  }
}

impl From<ApiUser> for UserProfile {
  fn from(api: ApiUser) -> Self {
    UserProfile {
      username: api.username,
      name: api.name,
      avatar_url: api.avatar_url,
      web_url: api.web_url,
    }
  }
}

/// `X-Next-Page` is empty on the last page.
fn has_next_page(headers: &HeaderMap) -> bool {
  header(headers, "x-next-page").is_some()
}

fn total_count(headers: &HeaderMap) -> Option<u64> {
  header(headers, "x-total")?.parse().ok()
}

// ============================================================================
// Adapter
// ============================================================================

pub struct GitLabAdapter {
  name: String,
  http: RestClient,
  capabilities: Capabilities,
}

impl GitLabAdapter {
  /// `url` is the instance root, e.g. `https://gitlab.com`.
  pub fn new(name: &str, url: &str, token: Option<&str>) -> Result<Self> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
      let mut value = HeaderValue::from_str(token)
        .map_err(|_| Error::permanent(name, "token is not a valid header value"))?;
      value.set_sensitive(true);
      headers.insert("private-token", value);
    }

    let base = format!("{}/api/v4", url.trim_end_matches('/'));
    let http = RestClient::new(name, &base, headers, QUOTA_HEADERS)?;

    Ok(Self {
      name: name.to_string(),
      http,
      capabilities: Capabilities {
        current_user: token.is_some(),
        ..Capabilities::ALL
      },
    })
  }
}

#[async_trait]
impl PlatformAdapter for GitLabAdapter {
  fn name(&self) -> &str {
    &self.name
  }

  fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  async fn list_projects(&self, page: u32, per_page: u32) -> Result<Fetched<ProjectPage>> {
    let reply = self
      .http
      .get_json::<Vec<ApiProject>>(
        &["projects"],
        &[
          ("membership", "true".to_string()),
          ("archived", "false".to_string()),
          ("order_by", "last_activity_at".to_string()),
          ("page", page.to_string()),
          ("per_page", per_page.to_string()),
        ],
      )
      .await?;

    let has_next = has_next_page(&reply.headers);
    let name = &self.name;
    Ok(reply.fetched(|projects| ProjectPage {
      items: projects
        .into_iter()
        .map(|p| p.into_project(name))
        .collect(),
      has_next,
    }))
  }

  async fn project_count(&self) -> Result<Fetched<u64>> {
    let reply = self
      .http
      .get_json::<Vec<ApiProject>>(
        &["projects"],
        &[
          ("membership", "true".to_string()),
          ("archived", "false".to_string()),
          ("per_page", "1".to_string()),
        ],
      )
      .await?;

    // GitLab omits X-Total above its counting threshold.
    let count = total_count(&reply.headers).unwrap_or_else(|| {
      tracing::debug!(platform = %self.name, "No X-Total header on project listing");
      0
    });
    Ok(reply.fetched(|_| count))
  }

  async fn latest_pipeline(&self, project_id: &str, branch: &str) -> Result<Fetched<Option<Pipeline>>> {
    let reply = self
      .http
      .get_json::<Vec<ApiPipeline>>(
        &["projects", project_id, "pipelines"],
        &[
          ("ref", branch.to_string()),
          ("order_by", "updated_at".to_string()),
          ("sort", "desc".to_string()),
          ("per_page", "1".to_string()),
        ],
      )
      .await?;
    Ok(reply.fetched(|pipelines| pipelines.into_iter().next().map(Pipeline::from)))
  }

  async fn pipelines(&self, project_id: &str, limit: u32) -> Result<Fetched<Vec<Pipeline>>> {
    let reply = self
      .http
      .get_json::<Vec<ApiPipeline>>(
        &["projects", project_id, "pipelines"],
        &[
          ("order_by", "updated_at".to_string()),
          ("sort", "desc".to_string()),
          ("per_page", limit.to_string()),
        ],
      )
      .await?;
    Ok(reply.fetched(|pipelines| pipelines.into_iter().map(Pipeline::from).collect()))
  }

  async fn branches(&self, project_id: &str, limit: u32) -> Result<Fetched<Vec<Branch>>> {
    let reply = self
      .http
      .get_json::<Vec<ApiBranch>>(
        &["projects", project_id, "repository", "branches"],
        &[("per_page", limit.to_string())],
      )
      .await?;
    Ok(reply.fetched(|branches| {
      branches
        .into_iter()
        .map(|b| b.into_branch(project_id))
        .collect()
    }))
  }

  async fn branch(&self, project_id: &str, name: &str) -> Result<Fetched<Branch>> {
    let reply = self
      .http
      .get_json::<ApiBranch>(&["projects", project_id, "repository", "branches", name], &[])
      .await?;
    Ok(reply.fetched(|branch| branch.into_branch(project_id)))
  }

  async fn merge_requests(&self, project_id: &str) -> Result<Fetched<Vec<MergeRequest>>> {
    let reply = self
      .http
      .get_json::<Vec<ApiMergeRequest>>(
        &["projects", project_id, "merge_requests"],
        &[
          ("state", "opened".to_string()),
          ("order_by", "updated_at".to_string()),
          ("per_page", ITEM_PAGE_SIZE.to_string()),
        ],
      )
      .await?;
    Ok(reply.fetched(|items| {
      items
        .into_iter()
        .map(|mr| mr.into_merge_request(project_id))
        .collect()
    }))
  }

  async fn issues(&self, project_id: &str) -> Result<Fetched<Vec<Issue>>> {
    let reply = self
      .http
      .get_json::<Vec<ApiIssue>>(
        &["projects", project_id, "issues"],
        &[
          ("state", "opened".to_string()),
          ("order_by", "updated_at".to_string()),
          ("per_page", ITEM_PAGE_SIZE.to_string()),
        ],
      )
      .await?;
    Ok(reply.fetched(|items| items.into_iter().map(|i| i.into_issue(project_id)).collect()))
  }

  async fn current_user(&self) -> Result<Fetched<UserProfile>> {
    if !self.capabilities.current_user {
      return Err(self.unsupported("current user"));
    }
    let reply = self.http.get_json::<ApiUser>(&["user"], &[]).await?;
    Ok(reply.fetched(UserProfile::from))
  }
}

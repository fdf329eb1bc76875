//! GitHub REST v3 adapter.
//!
//! Repositories are projects (id `owner/name`), Actions workflow runs are
//! pipelines and pull requests are merge requests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

use super::http::{header, QuotaHeaders, RestClient};
use super::types::{Branch, Issue, MergeRequest, Pipeline, PipelineStatus, Project, UserProfile};
use super::{Capabilities, Fetched, PlatformAdapter, ProjectPage};

pub const DEFAULT_URL: &str = "https://api.github.com";

const QUOTA_HEADERS: QuotaHeaders = QuotaHeaders {
  remaining: "x-ratelimit-remaining",
  limit: "x-ratelimit-limit",
  reset: "x-ratelimit-reset",
};

/// Open pull requests and issues fetched per repository
const ITEM_PAGE_SIZE: u32 = 100;

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiRepo {
  name: String,
  full_name: String,
  html_url: String,
  #[serde(default)]
  default_branch: String,
  pushed_at: Option<DateTime<Utc>>,
  updated_at: Option<DateTime<Utc>>,
  #[serde(default)]
  archived: bool,
}

#[derive(Debug, Deserialize)]
struct ApiRunList {
  workflow_runs: Vec<ApiRun>,
}

#[derive(Debug, Deserialize)]
struct ApiRun {
  id: u64,
  head_branch: Option<String>,
  head_sha: String,
  status: Option<String>,
  conclusion: Option<String>,
  html_url: String,
  created_at: Option<DateTime<Utc>>,
  updated_at: Option<DateTime<Utc>>,
  run_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiBranchCommitDetail {
  message: Option<String>,
  committer: Option<ApiSignature>,
}

#[derive(Debug, Deserialize)]
struct ApiSignature {
  date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiBranchCommit {
  sha: String,
  /// Only present on the single-branch endpoint
  commit: Option<ApiBranchCommitDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiBranchLinks {
  html: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiBranch {
  name: String,
  commit: ApiBranchCommit,
  #[serde(default)]
  protected: bool,
  #[serde(rename = "_links")]
  links: Option<ApiBranchLinks>,
}

#[derive(Debug, Deserialize)]
struct ApiLogin {
  login: String,
}

#[derive(Debug, Deserialize)]
struct ApiRef {
  #[serde(rename = "ref")]
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiPull {
  number: u64,
  title: String,
  user: Option<ApiLogin>,
  head: ApiRef,
  base: ApiRef,
  #[serde(default)]
  draft: bool,
  html_url: String,
  created_at: Option<DateTime<Utc>>,
  updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiLabel {
  name: String,
}

#[derive(Debug, Deserialize)]
struct ApiIssue {
  number: u64,
  title: String,
  user: Option<ApiLogin>,
  #[serde(default)]
  labels: Vec<ApiLabel>,
  html_url: String,
  created_at: Option<DateTime<Utc>>,
  updated_at: Option<DateTime<Utc>>,
  /// Set when the issue is really a pull request
  pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
  login: String,
  name: Option<String>,
  avatar_url: Option<String>,
  html_url: Option<String>,
}

impl ApiRepo {
  fn into_project(self, platform: &str) -> Project {
    Project {
      id: self.full_name.clone(),
      name: self.name,
      full_path: self.full_name,
      web_url: self.html_url,
      default_branch: self.default_branch,
      platform: platform.to_string(),
      last_activity: self.pushed_at.or(self.updated_at),
      archived: self.archived,
    }
  }
}

impl ApiRun {
  fn into_pipeline(self, project_id: &str) -> Pipeline {
    // `status` only says "completed"; the outcome lives in `conclusion`.
    let raw = match (self.status.as_deref(), self.conclusion.as_deref()) {
      (Some("completed"), Some(conclusion)) => conclusion,
      (Some(status), _) => status,
      (None, conclusion) => conclusion.unwrap_or("unknown"),
    };
    let status = PipelineStatus::parse(raw);
    let duration_secs = match (status.is_finished(), self.run_started_at, self.updated_at) {
      (true, Some(started), Some(updated)) => (updated - started).to_std().ok().map(|d| d.as_secs()),
      _ => None,
    };

    Pipeline {
      id: self.id.to_string(),
      project_id: project_id.to_string(),
      branch: self.head_branch.unwrap_or_default(),
      sha: self.head_sha,
      status,
      web_url: self.html_url,
      created_at: self.created_at,
      updated_at: self.updated_at,
      duration_secs,
    }
  }
}

impl ApiBranch {
  fn into_branch(self, project_id: &str) -> Branch {
    let (commit_title, last_commit_at) = match self.commit.commit {
      Some(detail) => (
        detail
          .message
          .map(|m| m.lines().next().unwrap_or_default().to_string()),
        detail.committer.and_then(|c| c.date),
      ),
      None => (None, None),
    };

    Branch {
      name: self.name,
      project_id: project_id.to_string(),
      // The listing does not flag the default branch; readers match by name.
      is_default: false,
      protected: self.protected,
      commit_sha: self.commit.sha,
      commit_title,
      last_commit_at,
      web_url: self.links.and_then(|l| l.html),
    }
  }
}

impl ApiPull {
  fn into_merge_request(self, project_id: &str) -> MergeRequest {
    MergeRequest {
      id: self.number.to_string(),
      project_id: project_id.to_string(),
      title: self.title,
      author: self.user.map(|u| u.login).unwrap_or_default(),
      source_branch: self.head.name,
      target_branch: self.base.name,
      draft: self.draft,
      web_url: self.html_url,
      created_at: self.created_at,
      updated_at: self.updated_at,
    }
  }
}

impl ApiIssue {
  fn into_issue(self, project_id: &str) -> Issue {
    Issue {
      id: self.number.to_string(),
      project_id: project_id.to_string(),
      title: self.title,
      author: self.user.map(|u| u.login).unwrap_or_default(),
      labels: self.labels.into_iter().map(|l| l.name).collect(),
      web_url: self.html_url,
      created_at: self.created_at,
      updated_at: self.updated_at,
    }
  }
}

impl From<ApiUser> for UserProfile {
  fn from(api: ApiUser) -> Self {
    UserProfile {
      name: api.name.unwrap_or_else(|| api.login.clone()),
      username: api.login,
      avatar_url: api.avatar_url,
      web_url: api.html_url,
    }
  }
}

/// Target of the `Link` header entry with the given `rel`.
fn link_target(headers: &HeaderMap, rel: &str) -> Option<Url> {
  let wanted = format!("rel=\"{}\"", rel);
  header(headers, "link")?.split(',').find_map(|entry| {
    let (target, params) = entry.split_once(';')?;
    if !params.split(';').any(|p| p.trim() == wanted) {
      return None;
    }
    let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
    Url::parse(target).ok()
  })
}

fn page_of(url: &Url) -> Option<u64> {
  url
    .query_pairs()
    .find(|(key, _)| key == "page")
    .and_then(|(_, value)| value.parse().ok())
}

fn split_repo<'a>(platform: &str, project_id: &'a str) -> Result<(&'a str, &'a str)> {
  project_id
    .split_once('/')
    .filter(|(owner, repo)| !owner.is_empty() && !repo.is_empty())
    .ok_or_else(|| {
      Error::permanent(
        platform,
        format!("repository id {:?} is not owner/name", project_id),
      )
    })
}

// ============================================================================
// Adapter
// ============================================================================

pub struct GitHubAdapter {
  name: String,
  http: RestClient,
  capabilities: Capabilities,
}

impl GitHubAdapter {
  /// `url` is the API root, `https://api.github.com` for github.com.
  pub fn new(name: &str, url: &str, token: Option<&str>) -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
    if let Some(token) = token {
      let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| Error::permanent(name, "token is not a valid header value"))?;
      value.set_sensitive(true);
      headers.insert(AUTHORIZATION, value);
    }

    let http = RestClient::new(name, url, headers, QUOTA_HEADERS)?;

    Ok(Self {
      name: name.to_string(),
      http,
      capabilities: Capabilities {
        current_user: token.is_some(),
        ..Capabilities::ALL
      },
    })
  }

  fn repo<'a>(&self, project_id: &'a str) -> Result<(&'a str, &'a str)> {
    split_repo(&self.name, project_id)
  }

  async fn runs(&self, project_id: &str, query: &[(&str, String)]) -> Result<Fetched<Vec<Pipeline>>> {
    let (owner, repo) = self.repo(project_id)?;
    let reply = self
      .http
      .get_json::<ApiRunList>(&["repos", owner, repo, "actions", "runs"], query)
      .await?;
    Ok(reply.fetched(|list| {
      list
        .workflow_runs
        .into_iter()
        .map(|run| run.into_pipeline(project_id))
        .collect()
    }))
  }
}

#[async_trait]
impl PlatformAdapter for GitHubAdapter {
  fn name(&self) -> &str {
    &self.name
  }

  fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  async fn list_projects(&self, page: u32, per_page: u32) -> Result<Fetched<ProjectPage>> {
    let reply = self
      .http
      .get_json::<Vec<ApiRepo>>(
        &["user", "repos"],
        &[
          ("sort", "pushed".to_string()),
          ("page", page.to_string()),
          ("per_page", per_page.to_string()),
        ],
      )
      .await?;

    let has_next = link_target(&reply.headers, "next").is_some();
    let name = &self.name;
    Ok(reply.fetched(|repos| ProjectPage {
      items: repos.into_iter().map(|r| r.into_project(name)).collect(),
      has_next,
    }))
  }

  async fn project_count(&self) -> Result<Fetched<u64>> {
    // One repo per page: the page number of the last link is the total.
    let reply = self
      .http
      .get_json::<Vec<ApiRepo>>(&["user", "repos"], &[("per_page", "1".to_string())])
      .await?;
    let count = link_target(&reply.headers, "last")
      .as_ref()
      .and_then(page_of)
      .unwrap_or(reply.value.len() as u64);
    Ok(reply.fetched(|_| count))
  }

  async fn latest_pipeline(&self, project_id: &str, branch: &str) -> Result<Fetched<Option<Pipeline>>> {
    let fetched = self
      .runs(
        project_id,
        &[("branch", branch.to_string()), ("per_page", "1".to_string())],
      )
      .await?;
    Ok(fetched.map(|runs| runs.into_iter().next()))
  }

  async fn pipelines(&self, project_id: &str, limit: u32) -> Result<Fetched<Vec<Pipeline>>> {
    self
      .runs(project_id, &[("per_page", limit.to_string())])
      .await
  }

  async fn branches(&self, project_id: &str, limit: u32) -> Result<Fetched<Vec<Branch>>> {
    let (owner, repo) = self.repo(project_id)?;
    let reply = self
      .http
      .get_json::<Vec<ApiBranch>>(
        &["repos", owner, repo, "branches"],
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
    let (owner, repo) = self.repo(project_id)?;
    let reply = self
      .http
      .get_json::<ApiBranch>(&["repos", owner, repo, "branches", name], &[])
      .await?;
    Ok(reply.fetched(|branch| branch.into_branch(project_id)))
  }

  async fn merge_requests(&self, project_id: &str) -> Result<Fetched<Vec<MergeRequest>>> {
    let (owner, repo) = self.repo(project_id)?;
    let reply = self
      .http
      .get_json::<Vec<ApiPull>>(
        &["repos", owner, repo, "pulls"],
        &[
          ("state", "open".to_string()),
          ("sort", "updated".to_string()),
          ("direction", "desc".to_string()),
          ("per_page", ITEM_PAGE_SIZE.to_string()),
        ],
      )
      .await?;
    Ok(reply.fetched(|pulls| {
      pulls
        .into_iter()
        .map(|pr| pr.into_merge_request(project_id))
        .collect()
    }))
  }

  async fn issues(&self, project_id: &str) -> Result<Fetched<Vec<Issue>>> {
    let (owner, repo) = self.repo(project_id)?;
    let reply = self
      .http
      .get_json::<Vec<ApiIssue>>(
        &["repos", owner, repo, "issues"],
        &[
          ("state", "open".to_string()),
          ("sort", "updated".to_string()),
          ("per_page", ITEM_PAGE_SIZE.to_string()),
        ],
      )
      .await?;
    Ok(reply.fetched(|issues| {
      issues
        .into_iter()
        .filter(|issue| issue.pull_request.is_none())
        .map(|issue| issue.into_issue(project_id))
        .collect()
    }))
  }

  async fn current_user(&self) -> Result<Fetched<UserProfile>> {
    if !self.capabilities.current_user {
      return Err(self.unsupported("current user"));
    }
    let reply = self.http.get_json::<ApiUser>(&["user"], &[]).await?;
    Ok(reply.fetched(UserProfile::from))
  }
}

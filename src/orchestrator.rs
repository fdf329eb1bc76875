//! Cross-platform read views.
//!
//! The orchestrator only ever reads from the per-platform caches. It merges
//! project lists, applies allow-lists, builds composite views (default branch
//! plus its latest pipeline) and aggregates per-project data with a bounded
//! number of concurrent workers.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{stream, StreamExt};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::cache::{sort_by_recency, Recency, BRANCH_LIST_LIMIT, FALLBACK_BRANCH, PIPELINE_LIST_LIMIT};
use crate::error::{Error, Result};
use crate::platform::types::{Branch, Issue, MergeRequest, Pipeline, Project, UserProfile};
use crate::platform::{Capabilities, CachedPlatformClient};

/// Default cap on concurrent per-project reads.
pub const DEFAULT_MAX_CONCURRENCY: usize = 50;

/// Read-only view of one platform's cache.
///
/// Implementations must answer from memory and never call the platform.
pub trait PlatformReader: Send + Sync {
  fn name(&self) -> &str;
  fn capabilities(&self) -> Capabilities;
  fn projects(&self) -> Result<Vec<Project>>;
  fn project_count(&self) -> Result<u64>;
  fn latest_pipeline(&self, project_id: &str, branch: &str) -> Result<Option<Pipeline>>;
  fn pipelines(&self, project_id: &str, limit: u32) -> Result<Vec<Pipeline>>;
  fn branches(&self, project_id: &str, limit: u32) -> Result<Vec<Branch>>;
  fn branch(&self, project_id: &str, name: &str) -> Result<Option<Branch>>;
  fn merge_requests(&self, project_id: &str) -> Result<Vec<MergeRequest>>;
  fn issues(&self, project_id: &str) -> Result<Vec<Issue>>;
  fn current_user(&self) -> Result<Option<UserProfile>>;
}

impl PlatformReader for CachedPlatformClient {
  fn name(&self) -> &str {
    CachedPlatformClient::name(self)
  }

  fn capabilities(&self) -> Capabilities {
    CachedPlatformClient::capabilities(self)
  }

  fn projects(&self) -> Result<Vec<Project>> {
    Ok(self.get_projects().data)
  }

  fn project_count(&self) -> Result<u64> {
    Ok(self.get_project_count().data)
  }

  fn latest_pipeline(&self, project_id: &str, branch: &str) -> Result<Option<Pipeline>> {
    Ok(self.get_latest_pipeline(project_id, branch).data)
  }

  fn pipelines(&self, project_id: &str, limit: u32) -> Result<Vec<Pipeline>> {
    Ok(self.get_pipelines(project_id, limit).data)
  }

  fn branches(&self, project_id: &str, limit: u32) -> Result<Vec<Branch>> {
    Ok(self.get_branches(project_id, limit).data)
  }

  fn branch(&self, project_id: &str, name: &str) -> Result<Option<Branch>> {
    Ok(self.get_branch(project_id, name).data)
  }

  fn merge_requests(&self, project_id: &str) -> Result<Vec<MergeRequest>> {
    Ok(self.get_merge_requests(project_id).data)
  }

  fn issues(&self, project_id: &str) -> Result<Vec<Issue>> {
    Ok(self.get_issues(project_id).data)
  }

  fn current_user(&self) -> Result<Option<UserProfile>> {
    Ok(self.get_current_user().data)
  }
}

/// Default branch, its latest pipeline and the branch count of one project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
  pub platform: String,
  pub project: Project,
  pub default_branch: Option<Branch>,
  pub pipeline: Option<Pipeline>,
  pub branch_count: usize,
}

impl Recency for ProjectStatus {
  fn recency(&self) -> Option<chrono::DateTime<chrono::Utc>> {
    self
      .pipeline
      .as_ref()
      .and_then(Recency::recency)
      .or(self.project.last_activity)
  }
}

/// An aggregated item tagged with where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectItem<T> {
  pub platform: String,
  pub project_id: String,
  pub project_name: String,
  pub item: T,
}

impl<T: Recency> Recency for ProjectItem<T> {
  fn recency(&self) -> Option<chrono::DateTime<chrono::Utc>> {
    self.item.recency()
  }
}

struct Registered {
  reader: Arc<dyn PlatformReader>,
  /// Empty means every project is allowed
  allow: HashSet<String>,
}

impl Registered {
  fn allows(&self, project: &Project) -> bool {
    self.allow.is_empty() || self.allow.contains(&project.id)
  }
}

pub struct Orchestrator {
  platforms: Vec<Registered>,
  max_concurrency: usize,
}

impl Orchestrator {
  pub fn new(max_concurrency: usize) -> Self {
    Self {
      platforms: Vec::new(),
      max_concurrency: max_concurrency.max(1),
    }
  }

  /// Register a platform with its project allow-list (empty allows all).
  pub fn register(&mut self, reader: Arc<dyn PlatformReader>, allow_list: Vec<String>) {
    tracing::debug!(
      platform = %reader.name(),
      allowed = allow_list.len(),
      "Orchestrator platform registered"
    );
    self.platforms.push(Registered {
      reader,
      allow: allow_list.into_iter().collect(),
    });
  }

  pub fn platform_names(&self) -> Vec<String> {
    self
      .platforms
      .iter()
      .map(|p| p.reader.name().to_string())
      .collect()
  }

  fn platform(&self, name: &str) -> Result<&Registered> {
    self
      .platforms
      .iter()
      .find(|p| p.reader.name() == name)
      .ok_or_else(|| Error::UnknownPlatform(name.to_string()))
  }

  /// Allowed projects of every platform, each paired with its reader.
  ///
  /// Platforms whose list cannot be read are logged and skipped. Fails only
  /// when every platform failed.
  async fn project_targets(&self) -> Result<Vec<(Arc<dyn PlatformReader>, Project)>> {
    let mut join_set = JoinSet::new();
    for (index, platform) in self.platforms.iter().enumerate() {
      let reader = Arc::clone(&platform.reader);
      join_set.spawn(async move { (index, reader.projects()) });
    }

    let mut per_platform: Vec<(usize, Vec<Project>)> = Vec::new();
    let mut errors: Vec<(usize, Error)> = Vec::new();

    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok((index, Ok(projects))) => per_platform.push((index, projects)),
        Ok((index, Err(error))) => {
          tracing::warn!(
            platform = %self.platforms[index].reader.name(),
            error = %error,
            "Failed to read project list"
          );
          errors.push((index, error));
        }
        Err(join_error) => {
          tracing::warn!(error = %join_error, "Project list task failed");
          errors.push((usize::MAX, Error::Internal(join_error.to_string())));
        }
      }
    }

    if !errors.is_empty() && errors.len() == self.platforms.len() {
      errors.sort_by_key(|(index, _)| *index);
      if let Some((_, error)) = errors.into_iter().next() {
        return Err(error);
      }
    }

    // Registration order, not completion order.
    per_platform.sort_by_key(|(index, _)| *index);
    let targets = per_platform
      .into_iter()
      .flat_map(|(index, projects)| {
        let platform = &self.platforms[index];
        projects
          .into_iter()
          .filter(|project| platform.allows(project))
          .map(|project| (Arc::clone(&platform.reader), project))
          .collect::<Vec<_>>()
      })
      .collect();
    Ok(targets)
  }

  /// Union of every platform's cached project list, allow-lists applied.
  pub async fn get_all_projects(&self) -> Result<Vec<Project>> {
    Ok(
      self
        .project_targets()
        .await?
        .into_iter()
        .map(|(_, project)| project)
        .collect(),
    )
  }

  /// Sum of per-platform project counts. Approximate by nature; a platform
  /// with no cached count contributes the length of its cached list.
  pub fn get_project_count(&self) -> u64 {
    self
      .platforms
      .iter()
      .map(|platform| match platform.reader.project_count() {
        Ok(count) if count > 0 => count,
        _ => platform
          .reader
          .projects()
          .map(|projects| projects.len() as u64)
          .unwrap_or(0),
      })
      .sum()
  }

  /// Composite status of one project.
  ///
  /// `Ok(None)` when the project is not in the platform's cached list or is
  /// excluded by the allow-list.
  pub fn get_project_status(&self, platform: &str, project_id: &str) -> Result<Option<ProjectStatus>> {
    let registered = self.platform(platform)?;
    let project = registered
      .reader
      .projects()?
      .into_iter()
      .find(|project| project.id == project_id && registered.allows(project));

    match project {
      Some(project) => project_status(registered.reader.as_ref(), project).map(Some),
      None => Ok(None),
    }
  }

  /// Composite status of every allowed project, most recently active first.
  pub async fn get_all_project_statuses(&self) -> Result<Vec<ProjectStatus>> {
    let mut statuses = self
      .fan_out(|reader, project| project_status(reader, project).map(|status| vec![status]))
      .await?;
    sort_by_recency(&mut statuses);
    Ok(statuses)
  }

  pub async fn get_all_merge_requests(&self) -> Result<Vec<ProjectItem<MergeRequest>>> {
    let mut items = self
      .fan_out(|reader, project| {
        if !reader.capabilities().merge_requests {
          return Ok(Vec::new());
        }
        Ok(tag(reader, &project, reader.merge_requests(&project.id)?))
      })
      .await?;
    sort_by_recency(&mut items);
    Ok(items)
  }

  pub async fn get_all_issues(&self) -> Result<Vec<ProjectItem<Issue>>> {
    let mut items = self
      .fan_out(|reader, project| {
        if !reader.capabilities().issues {
          return Ok(Vec::new());
        }
        Ok(tag(reader, &project, reader.issues(&project.id)?))
      })
      .await?;
    sort_by_recency(&mut items);
    Ok(items)
  }

  pub async fn get_all_branches(&self) -> Result<Vec<ProjectItem<Branch>>> {
    let mut items = self
      .fan_out(|reader, project| {
        Ok(tag(
          reader,
          &project,
          reader.branches(&project.id, BRANCH_LIST_LIMIT)?,
        ))
      })
      .await?;
    sort_by_recency(&mut items);
    Ok(items)
  }

  /// The `limit` most recent pipelines across every allowed project.
  pub async fn get_recent_pipelines(&self, limit: usize) -> Result<Vec<ProjectItem<Pipeline>>> {
    let mut items = self
      .fan_out(|reader, project| {
        Ok(tag(
          reader,
          &project,
          reader.pipelines(&project.id, PIPELINE_LIST_LIMIT)?,
        ))
      })
      .await?;
    sort_by_recency(&mut items);
    items.truncate(limit);
    Ok(items)
  }

  /// Signed-in user of each platform that exposes one.
  pub fn get_current_users(&self) -> Vec<(String, UserProfile)> {
    self
      .platforms
      .iter()
      .filter(|platform| platform.reader.capabilities().current_user)
      .filter_map(|platform| match platform.reader.current_user() {
        Ok(user) => user.map(|user| (platform.reader.name().to_string(), user)),
        Err(error) => {
          tracing::warn!(platform = %platform.reader.name(), error = %error, "Failed to read current user");
          None
        }
      })
      .collect()
  }

  /// Run `read` for every allowed project with at most `max_concurrency`
  /// reads in flight. Per-project failures are logged and skipped.
  async fn fan_out<T, F>(&self, read: F) -> Result<Vec<T>>
  where
    T: Send + 'static,
    F: Fn(&dyn PlatformReader, Project) -> Result<Vec<T>> + Send + Sync + 'static,
  {
    let targets = self.project_targets().await?;
    let read = Arc::new(read);

    let results: Vec<_> = stream::iter(targets)
      .map(|(reader, project)| {
        let read = Arc::clone(&read);
        tokio::spawn(async move {
          let platform = reader.name().to_string();
          let project_id = project.id.clone();
          (platform, project_id, read(reader.as_ref(), project))
        })
      })
      .buffer_unordered(self.max_concurrency)
      .collect()
      .await;

    let mut items = Vec::new();
    for result in results {
      match result {
        Ok((_, _, Ok(found))) => items.extend(found),
        Ok((platform, project_id, Err(error))) => {
          tracing::warn!(platform = %platform, project_id = %project_id, error = %error, "Skipping project");
        }
        Err(join_error) => {
          tracing::warn!(error = %join_error, "Project read task failed");
        }
      }
    }
    Ok(items)
  }
}

fn tag<T>(reader: &dyn PlatformReader, project: &Project, items: Vec<T>) -> Vec<ProjectItem<T>> {
  items
    .into_iter()
    .map(|item| ProjectItem {
      platform: reader.name().to_string(),
      project_id: project.id.clone(),
      project_name: project.name.clone(),
      item,
    })
    .collect()
}

/// Build the composite status of `project` from cached reads only.
///
/// Default branch: the branch flagged default, else the one named like the
/// project's default branch, else a direct single-branch lookup.
fn project_status(reader: &dyn PlatformReader, project: Project) -> Result<ProjectStatus> {
  let branches = reader.branches(&project.id, BRANCH_LIST_LIMIT)?;

  let mut default_branch = branches
    .iter()
    .find(|branch| branch.is_default)
    .or_else(|| {
      branches
        .iter()
        .find(|branch| branch.name == project.default_branch)
    })
    .cloned();
  if default_branch.is_none() && !project.default_branch.is_empty() {
    default_branch = reader.branch(&project.id, &project.default_branch)?;
  }

  let branch_name = default_branch
    .as_ref()
    .map(|branch| branch.name.as_str())
    .filter(|name| !name.is_empty())
    .unwrap_or(project.default_branch.as_str());

  let mut pipeline = if branch_name.is_empty() {
    None
  } else {
    reader.latest_pipeline(&project.id, branch_name)?
  };
  if pipeline.is_none() && branch_name != FALLBACK_BRANCH {
    pipeline = reader.latest_pipeline(&project.id, FALLBACK_BRANCH)?;
  }

  Ok(ProjectStatus {
    platform: reader.name().to_string(),
    branch_count: branches.len(),
    default_branch,
    pipeline,
    project,
  })
}

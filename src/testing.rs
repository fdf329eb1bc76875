//! Scripted in-memory adapter for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::platform::types::{
  Branch, Issue, MergeRequest, Pipeline, PipelineStatus, Project, UserProfile,
};
use crate::platform::{Capabilities, Fetched, PlatformAdapter, ProjectPage};

pub fn at(hour: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
}

pub fn project(platform: &str, id: &str, default_branch: &str) -> Project {
  Project {
    id: id.to_string(),
    name: format!("project-{}", id),
    full_path: format!("group/project-{}", id),
    web_url: format!("https://{}/group/project-{}", platform, id),
    default_branch: default_branch.to_string(),
    platform: platform.to_string(),
    last_activity: None,
    archived: false,
  }
}

pub fn branch(project_id: &str, name: &str, is_default: bool) -> Branch {
  Branch {
    name: name.to_string(),
    project_id: project_id.to_string(),
    is_default,
    protected: is_default,
    commit_sha: format!("{}-sha", name),
    commit_title: None,
    last_commit_at: None,
    web_url: None,
  }
}

pub fn pipeline(project_id: &str, id: &str, branch: &str, updated: DateTime<Utc>) -> Pipeline {
  Pipeline {
    id: id.to_string(),
    project_id: project_id.to_string(),
    branch: branch.to_string(),
    sha: format!("{}-sha", id),
    status: PipelineStatus::Success,
    web_url: format!("https://ci/{}/{}", project_id, id),
    created_at: Some(updated),
    updated_at: Some(updated),
    duration_secs: Some(60),
  }
}

pub fn merge_request(project_id: &str, id: &str, updated: DateTime<Utc>) -> MergeRequest {
  MergeRequest {
    id: id.to_string(),
    project_id: project_id.to_string(),
    title: format!("MR {}", id),
    author: "dev".to_string(),
    source_branch: format!("feature-{}", id),
    target_branch: "main".to_string(),
    draft: false,
    web_url: format!("https://ci/{}/mr/{}", project_id, id),
    created_at: Some(updated),
    updated_at: Some(updated),
  }
}

pub fn issue(project_id: &str, id: &str, updated: DateTime<Utc>) -> Issue {
  Issue {
    id: id.to_string(),
    project_id: project_id.to_string(),
    title: format!("Issue {}", id),
    author: "reporter".to_string(),
    labels: vec![],
    web_url: format!("https://ci/{}/issues/{}", project_id, id),
    created_at: Some(updated),
    updated_at: Some(updated),
  }
}

pub fn user(username: &str) -> UserProfile {
  UserProfile {
    username: username.to_string(),
    name: username.to_uppercase(),
    avatar_url: None,
    web_url: None,
  }
}

/// Pause a page walk at one page until the test lets it continue.
#[derive(Clone)]
pub struct PageHold {
  pub page: u32,
  /// Notified when the held page is requested
  pub reached: Arc<Notify>,
  /// Notify to let the held page through
  pub release: Arc<Notify>,
}

impl PageHold {
  pub fn at_page(page: u32) -> Self {
    Self {
      page,
      reached: Arc::new(Notify::new()),
      release: Arc::new(Notify::new()),
    }
  }
}

#[derive(Default)]
struct Script {
  projects: Vec<Project>,
  branches: HashMap<String, Vec<Branch>>,
  pipelines: HashMap<String, Vec<Pipeline>>,
  merge_requests: HashMap<String, Vec<MergeRequest>>,
  issues: HashMap<String, Vec<Issue>>,
  user: Option<UserProfile>,
  /// `method:project` or `method:project:branch` markers that fail permanently
  failing: HashSet<String>,
  /// Pages that fail permanently
  failing_pages: HashSet<u32>,
}

pub struct ScriptedAdapter {
  name: String,
  capabilities: Capabilities,
  script: Mutex<Script>,
  calls: Mutex<HashMap<String, usize>>,
  total_calls: AtomicUsize,
  /// Project-scoped calls currently inside the adapter, and the most seen
  active: AtomicUsize,
  peak: AtomicUsize,
  delay: Duration,
  hold: Mutex<Option<PageHold>>,
}

impl ScriptedAdapter {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      capabilities: Capabilities::ALL,
      script: Mutex::new(Script::default()),
      calls: Mutex::new(HashMap::new()),
      total_calls: AtomicUsize::new(0),
      active: AtomicUsize::new(0),
      peak: AtomicUsize::new(0),
      delay: Duration::ZERO,
      hold: Mutex::new(None),
    }
  }

  pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
    self.capabilities = capabilities;
    self
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn with_projects(self, projects: Vec<Project>) -> Self {
    self.script.lock().unwrap().projects = projects;
    self
  }

  pub fn with_branches(self, project_id: &str, branches: Vec<Branch>) -> Self {
    self
      .script
      .lock()
      .unwrap()
      .branches
      .insert(project_id.to_string(), branches);
    self
  }

  pub fn with_pipelines(self, project_id: &str, pipelines: Vec<Pipeline>) -> Self {
    self
      .script
      .lock()
      .unwrap()
      .pipelines
      .insert(project_id.to_string(), pipelines);
    self
  }

  pub fn with_merge_requests(self, project_id: &str, items: Vec<MergeRequest>) -> Self {
    self
      .script
      .lock()
      .unwrap()
      .merge_requests
      .insert(project_id.to_string(), items);
    self
  }

  pub fn with_issues(self, project_id: &str, items: Vec<Issue>) -> Self {
    self
      .script
      .lock()
      .unwrap()
      .issues
      .insert(project_id.to_string(), items);
    self
  }

  pub fn with_user(self, user: UserProfile) -> Self {
    self.script.lock().unwrap().user = Some(user);
    self
  }

  /// Make `marker` (e.g. `latest_pipeline:7:main`) fail permanently.
  pub fn failing(self, marker: &str) -> Self {
    self
      .script
      .lock()
      .unwrap()
      .failing
      .insert(marker.to_string());
    self
  }

  pub fn failing_page(self, page: u32) -> Self {
    self.script.lock().unwrap().failing_pages.insert(page);
    self
  }

  pub fn hold_page(&self, hold: PageHold) {
    *self.hold.lock().unwrap() = Some(hold);
  }

  pub fn calls(&self, method: &str) -> usize {
    self.calls.lock().unwrap().get(method).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.total_calls.load(Ordering::SeqCst)
  }

  /// Most project-scoped calls that were ever in flight at once.
  pub fn peak_concurrency(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }

  async fn record(&self, method: &str, marker: &str) -> Result<()> {
    *self
      .calls
      .lock()
      .unwrap()
      .entry(method.to_string())
      .or_default() += 1;
    self.total_calls.fetch_add(1, Ordering::SeqCst);

    if !self.delay.is_zero() {
      // Project-scoped markers carry the project id after a colon.
      let scoped = marker.contains(':');
      if scoped {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
      }
      tokio::time::sleep(self.delay).await;
      if scoped {
        self.active.fetch_sub(1, Ordering::SeqCst);
      }
    }

    if self.script.lock().unwrap().failing.contains(marker) {
      return Err(Error::permanent(&self.name, format!("scripted failure {}", marker)));
    }
    Ok(())
  }
}

#[async_trait]
impl PlatformAdapter for ScriptedAdapter {
  fn name(&self) -> &str {
    &self.name
  }

  fn capabilities(&self) -> Capabilities {
    self.capabilities
  }

  async fn list_projects(&self, page: u32, per_page: u32) -> Result<Fetched<ProjectPage>> {
    self.record("list_projects", "list_projects").await?;

    let hold = self.hold.lock().unwrap().clone();
    if let Some(hold) = hold.filter(|h| h.page == page) {
      hold.reached.notify_one();
      hold.release.notified().await;
    }

    let script = self.script.lock().unwrap();
    if script.failing_pages.contains(&page) {
      return Err(Error::permanent(&self.name, format!("page {} failed", page)));
    }
    let start = ((page.max(1) - 1) * per_page) as usize;
    let items: Vec<Project> = script
      .projects
      .iter()
      .skip(start)
      .take(per_page as usize)
      .cloned()
      .collect();
    let has_next = start + items.len() < script.projects.len();
    Ok(Fetched::new(ProjectPage { items, has_next }))
  }

  async fn project_count(&self) -> Result<Fetched<u64>> {
    self.record("project_count", "project_count").await?;
    let count = self.script.lock().unwrap().projects.len() as u64;
    Ok(Fetched::new(count))
  }

  async fn latest_pipeline(
    &self,
    project_id: &str,
    branch: &str,
  ) -> Result<Fetched<Option<Pipeline>>> {
    self
      .record(
        "latest_pipeline",
        &format!("latest_pipeline:{}:{}", project_id, branch),
      )
      .await?;
    let script = self.script.lock().unwrap();
    let latest = script
      .pipelines
      .get(project_id)
      .and_then(|all| all.iter().find(|p| p.branch == branch).cloned());
    Ok(Fetched::new(latest))
  }

  async fn pipelines(&self, project_id: &str, limit: u32) -> Result<Fetched<Vec<Pipeline>>> {
    self
      .record("pipelines", &format!("pipelines:{}", project_id))
      .await?;
    let script = self.script.lock().unwrap();
    let items = script
      .pipelines
      .get(project_id)
      .map(|all| all.iter().take(limit as usize).cloned().collect())
      .unwrap_or_default();
    Ok(Fetched::new(items))
  }

  async fn branches(&self, project_id: &str, limit: u32) -> Result<Fetched<Vec<Branch>>> {
    self
      .record("branches", &format!("branches:{}", project_id))
      .await?;
    let script = self.script.lock().unwrap();
    let items = script
      .branches
      .get(project_id)
      .map(|all| all.iter().take(limit as usize).cloned().collect())
      .unwrap_or_default();
    Ok(Fetched::new(items))
  }

  async fn branch(&self, project_id: &str, name: &str) -> Result<Fetched<Branch>> {
    self
      .record("branch", &format!("branch:{}:{}", project_id, name))
      .await?;
    let script = self.script.lock().unwrap();
    script
      .branches
      .get(project_id)
      .and_then(|all| all.iter().find(|b| b.name == name).cloned())
      .map(Fetched::new)
      .ok_or_else(|| Error::permanent(&self.name, format!("no branch {}", name)))
  }

  async fn merge_requests(&self, project_id: &str) -> Result<Fetched<Vec<MergeRequest>>> {
    self
      .record("merge_requests", &format!("merge_requests:{}", project_id))
      .await?;
    let script = self.script.lock().unwrap();
    Ok(Fetched::new(
      script
        .merge_requests
        .get(project_id)
        .cloned()
        .unwrap_or_default(),
    ))
  }

  async fn issues(&self, project_id: &str) -> Result<Fetched<Vec<Issue>>> {
    self
      .record("issues", &format!("issues:{}", project_id))
      .await?;
    let script = self.script.lock().unwrap();
    Ok(Fetched::new(
      script.issues.get(project_id).cloned().unwrap_or_default(),
    ))
  }

  async fn current_user(&self) -> Result<Fetched<UserProfile>> {
    self.record("current_user", "current_user").await?;
    self
      .script
      .lock()
      .unwrap()
      .user
      .clone()
      .map(Fetched::new)
      .ok_or_else(|| Error::permanent(&self.name, "no user"))
  }
}

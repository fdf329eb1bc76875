//! Background refresh loop.
//!
//! One pass walks every platform's project pages, publishes the growing
//! project list after each page, and refreshes per-project entries through a
//! bounded worker pool. Passes repeat on a fixed interval until stopped.

use std::mem;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::cache::{CacheKey, FALLBACK_BRANCH};
use crate::cancel::{CancelSource, CancelToken};
use crate::error::Result;
use crate::platform::types::Project;
use crate::platform::CachedPlatformClient;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
  /// Time between the start of two passes
  pub interval: Duration,
  pub pass_timeout: Duration,
  pub page_size: u32,
  pub workers: usize,
  /// Stale entries refreshed at the end of each pass, per platform
  pub expired_batch: usize,
}

impl Default for RefreshConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_secs(300),
      pass_timeout: Duration::from_secs(240),
      page_size: 100,
      workers: 10,
      expired_batch: 200,
    }
  }
}

/// What one pass did on one platform.
#[derive(Debug, Clone, Default)]
pub struct PlatformReport {
  pub platform: String,
  pub pages: u32,
  pub projects: usize,
  pub refreshed: usize,
  pub failed: usize,
  pub expired_refreshed: usize,
  /// The page walk reached the last page
  pub complete: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PassReport {
  pub platforms: Vec<PlatformReport>,
  pub elapsed: Duration,
  pub timed_out: bool,
  pub cancelled: bool,
}

impl PassReport {
  pub fn refreshed(&self) -> usize {
    self.platforms.iter().map(|p| p.refreshed).sum()
  }

  pub fn failed(&self) -> usize {
    self.platforms.iter().map(|p| p.failed).sum()
  }
}

#[derive(Default)]
struct Tally {
  refreshed: usize,
  failed: usize,
}

impl Tally {
  /// Count a refresh result. Returns whether it succeeded.
  fn record(&mut self, platform: &str, key: &str, result: Result<()>) -> bool {
    match result {
      Ok(()) => {
        self.refreshed += 1;
        true
      }
      Err(e) if e.is_cancelled() => {
        tracing::debug!(platform, key, "Refresh cancelled");
        false
      }
      Err(e) => {
        self.failed += 1;
        tracing::warn!(platform, key, error = %e, "Refresh failed");
        false
      }
    }
  }
}

enum State {
  Idle,
  Running(JoinHandle<()>),
  Stopped,
}

struct Shared {
  platforms: Vec<Arc<CachedPlatformClient>>,
  config: RefreshConfig,
}

pub struct BackgroundRefresher {
  shared: Arc<Shared>,
  state: Mutex<State>,
  /// Fired by `stop` or on drop; observed by the loop and by `refresh_once`
  stop: CancelSource,
  /// Held shared by every `refresh_once` pass, exclusively by `stop`
  passes: RwLock<()>,
}

impl BackgroundRefresher {
  pub fn new(platforms: Vec<Arc<CachedPlatformClient>>, config: RefreshConfig) -> Self {
    Self {
      shared: Arc::new(Shared { platforms, config }),
      state: Mutex::new(State::Idle),
      stop: CancelSource::new(),
      passes: RwLock::new(()),
    }
  }

  pub fn is_running(&self) -> bool {
    matches!(*self.lock(), State::Running(_))
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Start the loop. Returns false when already running or stopped.
  pub fn start(&self) -> bool {
    let mut state = self.lock();
    match *state {
      State::Running(_) => {
        tracing::debug!("Refresher already running");
        false
      }
      State::Stopped => {
        tracing::warn!("Refresher was stopped and cannot be restarted");
        false
      }
      State::Idle => {
        let shared = Arc::clone(&self.shared);
        let token = self.stop.token();
        let handle = tokio::spawn(async move { shared.run(token).await });
        tracing::info!(
          platforms = self.shared.platforms.len(),
          interval_secs = self.shared.config.interval.as_secs(),
          "Refresher started"
        );
        *state = State::Running(handle);
        true
      }
    }
  }

  /// Cancel the loop and any single pass, then wait for them to wind down.
  pub async fn stop(&self) {
    let previous = mem::replace(&mut *self.lock(), State::Stopped);
    self.stop.cancel();

    let was_stopped = matches!(previous, State::Stopped);
    if let State::Running(handle) = previous {
      if let Err(e) = handle.await {
        tracing::error!(error = %e, "Refresher task ended abnormally");
      }
    }
    let _drained = self.passes.write().await;
    if !was_stopped {
      tracing::info!("Refresher stopped");
    }
  }

  /// Run a single pass outside the loop. Cancelled by `stop`.
  pub async fn refresh_once(&self) -> PassReport {
    if matches!(*self.lock(), State::Stopped) {
      tracing::warn!("Refresher was stopped, skipping pass");
      return PassReport {
        cancelled: true,
        ..PassReport::default()
      };
    }
    let _pass = self.passes.read().await;
    self.shared.refresh_all(&self.stop.token()).await
  }
}

impl Drop for BackgroundRefresher {
  fn drop(&mut self) {
    self.stop.cancel();
  }
}

impl Shared {
  async fn run(&self, cancel: CancelToken) {
    let mut ticker = tokio::time::interval(self.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {}
      }
      self.refresh_all(&cancel).await;
      if cancel.is_cancelled() {
        break;
      }
    }
  }

  /// One pass over every platform, bounded by the pass timeout.
  async fn refresh_all(&self, cancel: &CancelToken) -> PassReport {
    let started = Instant::now();
    let pass = CancelSource::child_of(cancel);
    let token = pass.token();

    let mut work = pin!(join_all(
      self
        .platforms
        .iter()
        .map(|client| refresh_platform(client, &self.config, &token)),
    ));

    let mut timed_out = false;
    let platforms = tokio::select! {
      reports = &mut work => reports,
      _ = tokio::time::sleep(self.config.pass_timeout) => {
        tracing::warn!(
          timeout_secs = self.config.pass_timeout.as_secs(),
          "Refresh pass timed out"
        );
        timed_out = true;
        pass.cancel();
        work.await
      }
    };

    let report = PassReport {
      platforms,
      elapsed: started.elapsed(),
      timed_out,
      cancelled: cancel.is_cancelled(),
    };
    tracing::info!(
      refreshed = report.refreshed(),
      failed = report.failed(),
      elapsed_ms = report.elapsed.as_millis() as u64,
      timed_out = report.timed_out,
      cancelled = report.cancelled,
      "Refresh pass finished"
    );
    report
  }
}

/// Walk one platform's pages and refresh everything hanging off them.
async fn refresh_platform(
  client: &Arc<CachedPlatformClient>,
  config: &RefreshConfig,
  cancel: &CancelToken,
) -> PlatformReport {
  let name = client.name().to_string();
  let capabilities = client.capabilities();
  let mut tally = Tally::default();
  let mut report = PlatformReport {
    platform: name.clone(),
    ..PlatformReport::default()
  };

  let count_key = CacheKey::ProjectCount.to_string();
  tally.record(&name, &count_key, client.force_refresh(&count_key, cancel).await);

  let previous = client.get_projects().data;
  let workers = Arc::new(Semaphore::new(config.workers.max(1)));
  let mut tasks = JoinSet::new();
  let mut accumulated: Vec<Project> = Vec::new();
  let mut page = 1;

  report.complete = loop {
    if cancel.is_cancelled() {
      break false;
    }
    match client
      .fetch_project_page(page, config.page_size.max(1), cancel)
      .await
    {
      Ok(fetched) => {
        for project in &fetched.items {
          let client = Arc::clone(client);
          let workers = Arc::clone(&workers);
          let cancel = cancel.clone();
          let project = project.clone();
          tasks.spawn(async move {
            let Ok(Ok(_permit)) = cancel.run(workers.acquire_owned()).await else {
              return Tally::default();
            };
            refresh_project(&client, &project, &cancel).await
          });
        }
        accumulated.extend(fetched.items);
        client.store_projects(merge_projects(&accumulated, &previous));
        report.pages += 1;
        tracing::debug!(
          platform = %name,
          page,
          projects = accumulated.len(),
          "Project page cached"
        );

        if !fetched.has_next {
          break true;
        }
        page += 1;
      }
      Err(e) if e.is_cancelled() => break false,
      Err(e) => {
        tally.failed += 1;
        tracing::warn!(platform = %name, page, error = %e, "Project page failed");
        break false;
      }
    }
  };

  while let Some(joined) = tasks.join_next().await {
    match joined {
      Ok(project) => {
        tally.refreshed += project.refreshed;
        tally.failed += project.failed;
      }
      Err(e) => {
        tally.failed += 1;
        tracing::warn!(platform = %name, error = %e, "Project refresh task failed");
      }
    }
  }

  report.projects = accumulated.len();
  if report.complete {
    client.store_projects(accumulated);
  }

  if capabilities.current_user && !cancel.is_cancelled() {
    let key = CacheKey::CurrentUser.to_string();
    tally.record(&name, &key, client.force_refresh(&key, cancel).await);
  }

  if !cancel.is_cancelled() {
    report.expired_refreshed = client.refresh_expired(config.expired_batch, cancel).await;
  }

  report.refreshed = tally.refreshed + report.expired_refreshed;
  report.failed = tally.failed;
  tracing::info!(
    platform = %name,
    pages = report.pages,
    projects = report.projects,
    refreshed = report.refreshed,
    failed = report.failed,
    complete = report.complete,
    "Platform refreshed"
  );
  report
}

/// Refresh every entry the read side needs for one project.
async fn refresh_project(
  client: &CachedPlatformClient,
  project: &Project,
  cancel: &CancelToken,
) -> Tally {
  let name = client.name();
  let capabilities = client.capabilities();
  let mut tally = Tally::default();

  let primary = if project.default_branch.is_empty() {
    FALLBACK_BRANCH
  } else {
    project.default_branch.as_str()
  };
  let key = CacheKey::latest_pipeline(&project.id, primary).to_string();
  let found = tally.record(name, &key, client.force_refresh(&key, cancel).await)
    && client
      .get_latest_pipeline(&project.id, primary)
      .data
      .is_some();
  if !found && primary != FALLBACK_BRANCH && !cancel.is_cancelled() {
    let key = CacheKey::latest_pipeline(&project.id, FALLBACK_BRANCH).to_string();
    tally.record(name, &key, client.force_refresh(&key, cancel).await);
  }

  let mut keys = vec![
    CacheKey::branches(&project.id),
    CacheKey::pipelines(&project.id),
  ];
  if capabilities.merge_requests {
    keys.push(CacheKey::merge_requests(&project.id));
  }
  if capabilities.issues {
    keys.push(CacheKey::issues(&project.id));
  }

  for key in keys {
    if cancel.is_cancelled() {
      break;
    }
    let key = key.to_string();
    tally.record(name, &key, client.force_refresh(&key, cancel).await);
  }
  tally
}

/// Accumulated projects first, then previously cached ones not yet seen.
fn merge_projects(accumulated: &[Project], previous: &[Project]) -> Vec<Project> {
  let seen: std::collections::HashSet<&str> =
    accumulated.iter().map(|p| p.id.as_str()).collect();
  accumulated
    .iter()
    .chain(previous.iter().filter(|p| !seen.contains(p.id.as_str())))
    .cloned()
    .collect()
}

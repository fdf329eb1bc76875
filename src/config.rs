use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gate::GatePolicy;
use crate::platform::cached_client::CacheWindow;
use crate::platform::{github, gitlab};
use crate::refresher::RefreshConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub gate: GateConfig,
  #[serde(default)]
  pub refresh: RefreshSection,
  #[serde(default)]
  pub orchestrator: OrchestratorConfig,
  pub platforms: Vec<PlatformConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub ttl_secs: u64,
  /// Entries are served stale until this age, then dropped
  pub stale_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 300,
      stale_ttl_secs: 3600,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateConfig {
  /// Concurrent outbound calls per platform
  pub max_concurrent: usize,
  pub max_attempts: u32,
  pub retry_base_ms: u64,
  pub queue_warn_ms: u64,
  /// Warn once remaining quota drops below this share of the limit
  pub low_quota_ratio: f64,
  /// Rate-limit waits allowed per call before giving up
  pub max_rate_limit_waits: u32,
}

impl Default for GateConfig {
  fn default() -> Self {
    let policy = GatePolicy::default();
    Self {
      max_concurrent: policy.max_concurrent,
      max_attempts: policy.max_attempts,
      retry_base_ms: policy.retry_base.as_millis() as u64,
      queue_warn_ms: policy.queue_warn.as_millis() as u64,
      low_quota_ratio: policy.low_quota_ratio,
      max_rate_limit_waits: policy.max_rate_limit_waits,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
  pub interval_secs: u64,
  pub pass_timeout_secs: u64,
  pub page_size: u32,
  pub workers: usize,
  pub expired_batch: usize,
}

impl Default for RefreshSection {
  fn default() -> Self {
    let defaults = RefreshConfig::default();
    Self {
      interval_secs: defaults.interval.as_secs(),
      pass_timeout_secs: defaults.pass_timeout.as_secs(),
      page_size: defaults.page_size,
      workers: defaults.workers,
      expired_batch: defaults.expired_batch,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
  pub max_concurrency: usize,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      max_concurrency: crate::orchestrator::DEFAULT_MAX_CONCURRENCY,
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
  Gitlab,
  Github,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
  pub kind: PlatformKind,
  /// Unique name used in logs and views (defaults to the kind)
  pub name: Option<String>,
  /// Instance root for GitLab, API root for GitHub
  pub url: Option<String>,
  /// Environment variable holding the access token
  pub token_env: Option<String>,
  /// Project ids to show; empty shows everything
  #[serde(default)]
  pub projects: Vec<String>,
}

impl PlatformConfig {
  pub fn name(&self) -> &str {
    match (&self.name, self.kind) {
      (Some(name), _) => name,
      (None, PlatformKind::Gitlab) => "gitlab",
      (None, PlatformKind::Github) => "github",
    }
  }

  pub fn url(&self) -> &str {
    match (&self.url, self.kind) {
      (Some(url), _) => url,
      (None, PlatformKind::Gitlab) => gitlab::DEFAULT_URL,
      (None, PlatformKind::Github) => github::DEFAULT_URL,
    }
  }

  fn default_token_env(&self) -> &'static str {
    match self.kind {
      PlatformKind::Gitlab => "GITLAB_TOKEN",
      PlatformKind::Github => "GITHUB_TOKEN",
    }
  }

  /// Read the access token from the configured environment variable.
  ///
  /// Falls back to GITLAB_TOKEN / GITHUB_TOKEN. A missing token is not an
  /// error: public projects can still be read.
  pub fn token(&self) -> Option<String> {
    let var = self
      .token_env
      .as_deref()
      .unwrap_or_else(|| self.default_token_env());
    std::env::var(var).ok().filter(|t| !t.trim().is_empty())
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pipewatch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pipewatch/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/pipewatch/config.yaml \
         (see config.example.yaml for the format)"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("pipewatch.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pipewatch").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.platforms.is_empty() {
      return Err(eyre!("at least one platform must be configured"));
    }

    let mut seen = std::collections::HashSet::new();
    for platform in &self.platforms {
      if !seen.insert(platform.name()) {
        return Err(eyre!("duplicate platform name {:?}", platform.name()));
      }
    }

    if self.cache.stale_ttl_secs < self.cache.ttl_secs {
      return Err(eyre!(
        "cache.stale_ttl_secs ({}) must not be shorter than cache.ttl_secs ({})",
        self.cache.stale_ttl_secs,
        self.cache.ttl_secs
      ));
    }
    Ok(())
  }

  pub fn cache_window(&self) -> CacheWindow {
    CacheWindow {
      ttl: chrono::Duration::seconds(self.cache.ttl_secs as i64),
      stale_ttl: chrono::Duration::seconds(self.cache.stale_ttl_secs as i64),
    }
  }

  pub fn gate_policy(&self) -> GatePolicy {
    GatePolicy {
      max_concurrent: self.gate.max_concurrent.max(1),
      max_attempts: self.gate.max_attempts.max(1),
      retry_base: Duration::from_millis(self.gate.retry_base_ms),
      queue_warn: Duration::from_millis(self.gate.queue_warn_ms),
      low_quota_ratio: self.gate.low_quota_ratio,
      max_rate_limit_waits: self.gate.max_rate_limit_waits.max(1),
    }
  }

  pub fn refresh_config(&self) -> RefreshConfig {
    RefreshConfig {
      interval: Duration::from_secs(self.refresh.interval_secs.max(1)),
      pass_timeout: Duration::from_secs(self.refresh.pass_timeout_secs.max(1)),
      page_size: self.refresh.page_size.max(1),
      workers: self.refresh.workers.max(1),
      expired_batch: self.refresh.expired_batch,
    }
  }
}

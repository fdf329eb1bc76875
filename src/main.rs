use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pipewatch::config::{Config, PlatformConfig, PlatformKind};
use pipewatch::logging::{self, LogTarget};
use pipewatch::orchestrator::{Orchestrator, PlatformReader};
use pipewatch::platform::github::GitHubAdapter;
use pipewatch::platform::gitlab::GitLabAdapter;
use pipewatch::platform::{CachedPlatformClient, PlatformAdapter};
use pipewatch::refresher::{BackgroundRefresher, PassReport};

#[derive(Parser, Debug)]
#[command(name = "pipewatch")]
#[command(about = "Cache-first CI/CD pipeline overview for GitLab and GitHub")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pipewatch/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log directory
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run one refresh pass and print the project summary
  Refresh,
  /// Keep refreshing in the background and print the summary periodically
  Watch {
    /// Seconds between summaries
    #[arg(long, default_value_t = 30)]
    every: u64,
  },
}

fn build_adapter(platform: &PlatformConfig) -> Result<Arc<dyn PlatformAdapter>> {
  let token = platform.token();
  if token.is_none() {
    tracing::warn!(platform = %platform.name(), "No access token set, only public data is visible");
  }

  let adapter: Arc<dyn PlatformAdapter> = match platform.kind {
    PlatformKind::Gitlab => Arc::new(
      GitLabAdapter::new(platform.name(), platform.url(), token.as_deref())
        .map_err(|e| eyre!("Failed to set up {}: {}", platform.name(), e))?,
    ),
    PlatformKind::Github => Arc::new(
      GitHubAdapter::new(platform.name(), platform.url(), token.as_deref())
        .map_err(|e| eyre!("Failed to set up {}: {}", platform.name(), e))?,
    ),
  };
  Ok(adapter)
}

struct App {
  orchestrator: Orchestrator,
  refresher: BackgroundRefresher,
  clients: Vec<Arc<CachedPlatformClient>>,
}

impl App {
  fn new(config: &Config) -> Result<Self> {
    let mut orchestrator = Orchestrator::new(config.orchestrator.max_concurrency);
    let mut clients = Vec::new();

    for platform in &config.platforms {
      let client = Arc::new(CachedPlatformClient::new(
        build_adapter(platform)?,
        config.cache_window(),
        config.gate_policy(),
      ));
      orchestrator.register(
        client.clone() as Arc<dyn PlatformReader>,
        platform.projects.clone(),
      );
      clients.push(client);
    }

    let refresher = BackgroundRefresher::new(clients.clone(), config.refresh_config());
    Ok(Self {
      orchestrator,
      refresher,
      clients,
    })
  }

  async fn print_summary(&self) -> Result<()> {
    let statuses = self
      .orchestrator
      .get_all_project_statuses()
      .await
      .map_err(|e| eyre!("Failed to read project statuses: {}", e))?;

    println!(
      "{:<10} {:<40} {:<20} {:<10} {}",
      "PLATFORM", "PROJECT", "BRANCH", "STATUS", "UPDATED"
    );
    for status in &statuses {
      let branch = status
        .default_branch
        .as_ref()
        .map(|b| b.name.as_str())
        .unwrap_or(status.project.default_branch.as_str());
      let (state, updated) = match &status.pipeline {
        Some(pipeline) => (
          pipeline.status.to_string(),
          pipeline
            .last_change()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default(),
        ),
        None => ("-".to_string(), String::new()),
      };
      println!(
        "{:<10} {:<40} {:<20} {:<10} {}",
        status.platform, status.project.full_path, branch, state, updated
      );
    }

    let merge_requests = self
      .orchestrator
      .get_all_merge_requests()
      .await
      .map(|items| items.len())
      .unwrap_or(0);
    let issues = self
      .orchestrator
      .get_all_issues()
      .await
      .map(|items| items.len())
      .unwrap_or(0);
    println!(
      "\n{} projects ({} reported), {} open merge requests, {} open issues",
      statuses.len(),
      self.orchestrator.get_project_count(),
      merge_requests,
      issues
    );

    for (platform, user) in self.orchestrator.get_current_users() {
      println!("{}: signed in as {}", platform, user.username);
    }
    for client in &self.clients {
      let stats = client.stats();
      let rate = client.rate_state();
      println!(
        "{}: cache {} fresh / {} stale / {} total, quota remaining {}",
        client.name(),
        stats.fresh,
        stats.stale,
        stats.total,
        if rate.remaining < 0 {
          "unknown".to_string()
        } else {
          rate.remaining.to_string()
        }
      );
    }
    Ok(())
  }
}

fn print_report(report: &PassReport) {
  for platform in &report.platforms {
    println!(
      "{}: {} projects over {} pages, {} refreshed, {} failed{}",
      platform.platform,
      platform.projects,
      platform.pages,
      platform.refreshed,
      platform.failed,
      if platform.complete { "" } else { " (incomplete)" }
    );
  }
  if report.timed_out {
    println!("pass timed out after {:.1}s", report.elapsed.as_secs_f64());
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let target = if args.log_stderr {
    LogTarget::Stderr
  } else {
    LogTarget::default_directory()
  };
  let _log_guard = logging::init(target)?;

  let config = Config::load(args.config.as_deref())?;
  let app = App::new(&config)?;

  match args.command {
    Command::Refresh => {
      let report = app.refresher.refresh_once().await;
      print_report(&report);
      println!();
      app.print_summary().await?;
    }
    Command::Watch { every } => {
      app.refresher.start();
      let mut ticker = tokio::time::interval(Duration::from_secs(every.max(1)));
      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          _ = ticker.tick() => {
            println!();
            app.print_summary().await?;
          }
        }
      }
      tracing::info!("Interrupted, stopping refresher");
      app.refresher.stop().await;
    }
  }

  Ok(())
}

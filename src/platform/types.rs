//! Domain snapshots produced by the platform adapters.
//!
//! The cache treats these as opaque payloads; only the timestamps are read
//! back out to prioritise refreshes and sort aggregated views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository/project on one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  /// Platform-native id (numeric for GitLab, `owner/name` for GitHub)
  pub id: String,
  pub name: String,
  /// Namespaced path, e.g. `group/sub/project`
  pub full_path: String,
  pub web_url: String,
  pub default_branch: String,
  /// Name of the platform this project was listed from
  pub platform: String,
  pub last_activity: Option<DateTime<Utc>>,
  pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
  Created,
  Pending,
  Running,
  Success,
  Failed,
  Canceled,
  Skipped,
  Manual,
  Unknown,
}

impl PipelineStatus {
  /// Map a platform status/conclusion string onto the shared set.
  pub fn parse(raw: &str) -> Self {
    match raw.to_ascii_lowercase().as_str() {
      "created" | "waiting_for_resource" | "preparing" | "requested" | "waiting" => Self::Created,
      "pending" | "queued" | "scheduled" => Self::Pending,
      "running" | "in_progress" => Self::Running,
      "success" | "completed" | "neutral" => Self::Success,
      "failed" | "failure" | "timed_out" | "startup_failure" | "action_required" => Self::Failed,
      "canceled" | "cancelled" => Self::Canceled,
      "skipped" => Self::Skipped,
      "manual" => Self::Manual,
      _ => Self::Unknown,
    }
  }

  pub fn is_finished(self) -> bool {
    matches!(
      self,
      Self::Success | Self::Failed | Self::Canceled | Self::Skipped
    )
  }
}

impl std::fmt::Display for PipelineStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Created => "created",
      Self::Pending => "pending",
      Self::Running => "running",
      Self::Success => "success",
      Self::Failed => "failed",
      Self::Canceled => "canceled",
      Self::Skipped => "skipped",
      Self::Manual => "manual",
      Self::Unknown => "unknown",
    };
    f.write_str(s)
  }
}

/// One pipeline (GitLab) or workflow run (GitHub)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
  pub id: String,
  pub project_id: String,
  pub branch: String,
  pub sha: String,
  pub status: PipelineStatus,
  pub web_url: String,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
  pub duration_secs: Option<u64>,
}

impl Pipeline {
  pub fn last_change(&self) -> Option<DateTime<Utc>> {
    self.updated_at.or(self.created_at)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
  pub name: String,
  pub project_id: String,
  /// Set when the platform reports the branch as default
  pub is_default: bool,
  pub protected: bool,
  pub commit_sha: String,
  pub commit_title: Option<String>,
  pub last_commit_at: Option<DateTime<Utc>>,
  pub web_url: Option<String>,
}

/// Merge request (GitLab) or pull request (GitHub)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
  pub id: String,
  pub project_id: String,
  pub title: String,
  pub author: String,
  pub source_branch: String,
  pub target_branch: String,
  pub draft: bool,
  pub web_url: String,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
  pub id: String,
  pub project_id: String,
  pub title: String,
  pub author: String,
  pub labels: Vec<String>,
  pub web_url: String,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
  pub username: String,
  pub name: String,
  pub avatar_url: Option<String>,
  pub web_url: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_parse_covers_both_vocabularies() {
    assert_eq!(PipelineStatus::parse("success"), PipelineStatus::Success);
    assert_eq!(PipelineStatus::parse("failure"), PipelineStatus::Failed);
    assert_eq!(PipelineStatus::parse("in_progress"), PipelineStatus::Running);
    assert_eq!(PipelineStatus::parse("Cancelled"), PipelineStatus::Canceled);
    assert_eq!(PipelineStatus::parse("something-new"), PipelineStatus::Unknown);
    assert!(PipelineStatus::Failed.is_finished());
    assert!(!PipelineStatus::Running.is_finished());
  }
}

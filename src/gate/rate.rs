//! Tracked rate quota for one platform.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::platform::RateQuota;

/// Remaining budget and reset time as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateState {
  /// -1 unknown, 0 exhausted, >0 budget left
  pub remaining: i64,
  pub limit: Option<i64>,
  pub reset_at: Option<DateTime<Utc>>,
}

impl RateState {
  pub const UNKNOWN: RateState = RateState {
    remaining: -1,
    limit: None,
    reset_at: None,
  };

  /// How long calls must hold off as of `now`, if at all.
  pub fn wait_at(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
    if self.remaining != 0 {
      return None;
    }
    let reset_at = self.reset_at?;
    (reset_at - now).to_std().ok().filter(|d| !d.is_zero())
  }

  /// Budget left but below `ratio` of the limit. Needs a known limit.
  pub fn is_low(&self, ratio: f64) -> bool {
    match self.limit.filter(|l| *l > 0) {
      Some(limit) => self.remaining > 0 && (self.remaining as f64) < (limit as f64) * ratio,
      None => false,
    }
  }
}

impl Default for RateState {
  fn default() -> Self {
    Self::UNKNOWN
  }
}

pub struct RateTracker {
  platform: String,
  state: RwLock<RateState>,
  low_ratio: f64,
}

impl RateTracker {
  pub fn new(platform: &str, low_ratio: f64) -> Self {
    Self {
      platform: platform.to_string(),
      state: RwLock::new(RateState::UNKNOWN),
      low_ratio,
    }
  }

  fn read(&self) -> RwLockReadGuard<'_, RateState> {
    self.state.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, RateState> {
    self.state.write().unwrap_or_else(|e| e.into_inner())
  }

  pub fn snapshot(&self) -> RateState {
    *self.read()
  }

  /// Record quota metadata from a response.
  pub fn update(&self, quota: RateQuota) {
    let state = RateState {
      remaining: quota.remaining,
      limit: quota.limit,
      reset_at: quota.reset_at,
    };
    *self.write() = state;

    if state.remaining == 0 {
      tracing::warn!(
        platform = %self.platform,
        reset_at = ?state.reset_at,
        "Rate limit exhausted"
      );
    } else if state.is_low(self.low_ratio) {
      tracing::warn!(
        platform = %self.platform,
        remaining = state.remaining,
        limit = ?state.limit,
        reset_at = ?state.reset_at,
        "Rate limit running low"
      );
    }
  }

  /// Mark the quota as exhausted until `reset_at`.
  pub fn mark_exhausted(&self, reset_at: DateTime<Utc>) {
    let mut state = self.write();
    state.remaining = 0;
    state.reset_at = Some(reset_at);
  }

  /// Suspend until the quota resets, if it is currently exhausted.
  pub async fn wait_for_reset(&self, cancel: &CancelToken) -> Result<()> {
    // Loop: the timer and the wall clock may disagree by a hair, and another
    // response may push the reset further out while we sleep.
    while let Some(wait) = self.snapshot().wait_at(Utc::now()) {
      tracing::info!(
        platform = %self.platform,
        wait_ms = wait.as_millis() as u64,
        "Waiting for rate limit reset"
      );
      cancel
        .run(tokio::time::sleep(wait.max(std::time::Duration::from_millis(1))))
        .await?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn unknown_and_budgeted_states_never_wait() {
    let now = Utc::now();
    assert!(RateState::UNKNOWN.wait_at(now).is_none());

    let budget = RateState {
      remaining: 10,
      limit: Some(100),
      reset_at: Some(now + Duration::minutes(5)),
    };
    assert!(budget.wait_at(now).is_none());
  }

  #[test]
  fn exhausted_waits_only_until_reset() {
    let now = Utc::now();
    let state = RateState {
      remaining: 0,
      limit: Some(100),
      reset_at: Some(now + Duration::seconds(3)),
    };
    let wait = state.wait_at(now).unwrap();
    assert_eq!(wait.as_secs(), 3);
    assert!(state.wait_at(now + Duration::seconds(4)).is_none());
  }

  #[test]
  fn low_quota_threshold() {
    let state = |remaining, limit| RateState {
      remaining,
      limit,
      reset_at: None,
    };
    assert!(state(199, Some(2000)).is_low(0.1));
    assert!(!state(200, Some(2000)).is_low(0.1));
    assert!(!state(0, Some(2000)).is_low(0.1));
    assert!(!state(-1, Some(2000)).is_low(0.1));
    assert!(!state(5, None).is_low(0.1));
    assert!(!state(5, Some(0)).is_low(0.1));
  }

  #[test]
  fn update_replaces_state() {
    let tracker = RateTracker::new("gitlab", 0.1);
    let quota = RateQuota {
      remaining: 3,
      limit: Some(100),
      reset_at: None,
    };
    tracker.update(quota);
    assert_eq!(tracker.snapshot().remaining, 3);

    let reset = Utc::now() + Duration::seconds(30);
    tracker.mark_exhausted(reset);
    let state = tracker.snapshot();
    assert_eq!(state.remaining, 0);
    assert_eq!(state.reset_at, Some(reset));
  }
}

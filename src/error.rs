//! Error taxonomy shared by the gate, the cache facade and the adapters.

use chrono::{DateTime, Utc};

use crate::platform::RateQuota;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the refresh path.
///
/// The read path never returns these for platform or network problems; a
/// missing entry is an empty result, not an error.
///
/// `Clone` is required because a deduplicated call hands the same outcome to
/// every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
  /// Network hiccup or 5xx response. Retried with backoff.
  #[error("transient error from {platform}: {message}")]
  Transient {
    platform: String,
    message: String,
    /// Quota headers the failed response still carried
    quota: Option<RateQuota>,
  },

  /// The platform quota is exhausted. Waited out, not charged to the retry budget.
  #[error("rate limit exhausted on {platform} (resets at {reset_at:?})")]
  RateLimited {
    platform: String,
    reset_at: Option<DateTime<Utc>>,
  },

  /// Anything the platform will keep rejecting (4xx, bad payload).
  #[error("{platform} rejected the request: {message}")]
  Permanent {
    platform: String,
    message: String,
    quota: Option<RateQuota>,
  },

  #[error("malformed cache key {key:?}: {reason}")]
  KeyFormat { key: String, reason: String },

  #[error("platform {0:?} is not registered")]
  UnknownPlatform(String),

  #[error("{platform} does not support {operation}")]
  Unsupported {
    platform: String,
    operation: &'static str,
  },

  #[error("operation cancelled")]
  Cancelled,

  #[error("{source} (gave up after {attempts} attempts)")]
  RetriesExhausted {
    attempts: u32,
    #[source]
    source: Box<Error>,
  },

  #[error("internal error: {0}")]
  Internal(String),
}

impl Error {
  pub fn transient(platform: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Transient {
      platform: platform.into(),
      message: message.into(),
      quota: None,
    }
  }

  pub fn permanent(platform: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Permanent {
      platform: platform.into(),
      message: message.into(),
      quota: None,
    }
  }

  pub fn key_format(key: impl Into<String>, reason: impl Into<String>) -> Self {
    Self::KeyFormat {
      key: key.into(),
      reason: reason.into(),
    }
  }

  /// Attach the quota reported by the response that failed.
  pub fn with_quota(mut self, reported: Option<RateQuota>) -> Self {
    if let Self::Transient { quota, .. } | Self::Permanent { quota, .. } = &mut self {
      *quota = reported;
    }
    self
  }

  /// Quota metadata carried by a failed response, if any.
  pub fn quota(&self) -> Option<RateQuota> {
    match self {
      Self::Transient { quota, .. } | Self::Permanent { quota, .. } => *quota,
      _ => None,
    }
  }

  /// Whether the gate should retry this error with backoff.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient { .. })
  }

  pub fn is_rate_limited(&self) -> bool {
    matches!(self, Self::RateLimited { .. })
  }

  /// Cancellation is propagated and logged quietly, never as a failure.
  pub fn is_cancelled(&self) -> bool {
    match self {
      Self::Cancelled => true,
      Self::RetriesExhausted { source, .. } => source.is_cancelled(),
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classification() {
    assert!(Error::transient("gitlab", "reset by peer").is_transient());
    assert!(!Error::permanent("gitlab", "404").is_transient());
    assert!(Error::Cancelled.is_cancelled());

    let wrapped = Error::RetriesExhausted {
      attempts: 3,
      source: Box::new(Error::transient("github", "502")),
    };
    assert!(!wrapped.is_transient());
    assert!(!wrapped.is_cancelled());
    assert!(wrapped.to_string().contains("after 3 attempts"));
  }

  #[test]
  fn quota_rides_on_response_errors_only() {
    let quota = RateQuota {
      remaining: 3,
      limit: Some(2000),
      reset_at: None,
    };
    assert_eq!(Error::permanent("gitlab", "404").with_quota(Some(quota)).quota(), Some(quota));
    assert_eq!(Error::transient("gitlab", "502").quota(), None);
    assert_eq!(Error::Cancelled.with_quota(Some(quota)).quota(), None);
  }
}

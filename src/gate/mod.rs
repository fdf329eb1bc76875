//! Request gate wrapping every outbound adapter call.
//!
//! One gate per adapter instance. A call through [`RequestGate::execute`]:
//!
//! 1. joins the in-flight table; a second caller for the same key waits for
//!    the first caller's outcome instead of calling the platform again
//! 2. takes a ticket from a fixed-size pool
//! 3. holds off while the tracked quota is exhausted
//! 4. runs the call, records quota metadata from the response, failed or not
//! 5. retries transient failures with exponential backoff; a rate-limited
//!    response waits for the reset without using up a retry

mod inflight;
mod rate;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::platform::Fetched;

pub use inflight::InFlightTable;
pub use rate::{RateState, RateTracker};

use inflight::{wait_for_leader, Slot, Waited};

/// Tuning for one gate.
#[derive(Debug, Clone)]
pub struct GatePolicy {
  /// Ticket pool size
  pub max_concurrent: usize,
  /// Total tries for a transient failure, first call included
  pub max_attempts: u32,
  /// Backoff unit; attempt `n` waits `retry_base * 2^n`
  pub retry_base: Duration,
  /// Ticket waits longer than this are logged as queuing
  pub queue_warn: Duration,
  /// Warn once remaining quota drops below this share of the limit
  pub low_quota_ratio: f64,
  /// Rate-limit waits allowed per call before giving up
  pub max_rate_limit_waits: u32,
}

impl Default for GatePolicy {
  fn default() -> Self {
    Self {
      max_concurrent: 5,
      max_attempts: 3,
      retry_base: Duration::from_secs(1),
      queue_warn: Duration::from_millis(100),
      low_quota_ratio: 0.1,
      max_rate_limit_waits: 5,
    }
  }
}

/// Ticket pool and quota state of one adapter instance.
struct Limits {
  platform: String,
  policy: GatePolicy,
  tickets: Semaphore,
  rate: RateTracker,
}

/// Gate for calls returning `T`.
///
/// Gates created with [`RequestGate::sharing_limits`] dedup their own keys
/// but draw from the same tickets and quota.
pub struct RequestGate<T: Clone> {
  limits: Arc<Limits>,
  in_flight: Arc<InFlightTable<T>>,
}

impl<T: Clone + Send + Sync + 'static> RequestGate<T> {
  pub fn new(platform: &str, policy: GatePolicy) -> Self {
    let limits = Limits {
      platform: platform.to_string(),
      tickets: Semaphore::new(policy.max_concurrent.max(1)),
      rate: RateTracker::new(platform, policy.low_quota_ratio),
      policy,
    };
    Self {
      limits: Arc::new(limits),
      in_flight: Arc::new(InFlightTable::new()),
    }
  }

  /// A gate for another payload type on the same adapter instance.
  pub fn sharing_limits<U: Clone + Send + Sync + 'static>(&self) -> RequestGate<U> {
    RequestGate {
      limits: Arc::clone(&self.limits),
      in_flight: Arc::new(InFlightTable::new()),
    }
  }

  pub fn platform(&self) -> &str {
    &self.limits.platform
  }

  pub fn policy(&self) -> &GatePolicy {
    &self.limits.policy
  }

  pub fn rate_state(&self) -> RateState {
    self.limits.rate.snapshot()
  }

  /// Number of keys with an outstanding call.
  pub fn in_flight(&self) -> usize {
    self.in_flight.len()
  }

  /// Run `call` for `key`, sharing the outcome with concurrent callers of the
  /// same key.
  ///
  /// `call` may run several times when retrying. A caller cancelled while
  /// waiting gets [`Error::Cancelled`]; the caller running the call is not
  /// affected. If that caller is cancelled instead, a waiter takes over.
  pub async fn execute<F, Fut>(&self, key: &str, cancel: &CancelToken, call: F) -> Result<T>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Fetched<T>>>,
  {
    loop {
      match self.in_flight.join(key) {
        Slot::Leader(guard) => {
          tracing::debug!(platform = %self.limits.platform, key, "Request started");
          let result = self.run_with_retry(key, cancel, &call).await;

          match &result {
            Ok(_) => {
              tracing::debug!(platform = %self.limits.platform, key, "Request succeeded");
              guard.complete(&result);
            }
            // Waiters retry on their own rather than inherit our cancellation.
            Err(e) if e.is_cancelled() => {
              tracing::debug!(platform = %self.limits.platform, key, "Request cancelled");
              drop(guard);
            }
            Err(e) => {
              tracing::warn!(platform = %self.limits.platform, key, error = %e, "Request failed");
              guard.complete(&result);
            }
          }
          return result;
        }
        Slot::Follower(rx) => {
          tracing::debug!(platform = %self.limits.platform, key, "Joining in-flight request");
          match wait_for_leader(rx, cancel).await {
            Waited::Done(result) => return result,
            Waited::Cancelled => return Err(Error::Cancelled),
            Waited::Abandoned => {
              tracing::debug!(platform = %self.limits.platform, key, "In-flight request abandoned, retrying");
            }
          }
        }
      }
    }
  }

  async fn run_with_retry<F, Fut>(&self, key: &str, cancel: &CancelToken, call: &F) -> Result<T>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Fetched<T>>>,
  {
    let max_attempts = self.limits.policy.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut rate_waits = 0u32;

    loop {
      let outcome = self.call_once(cancel, call).await;
      let reported = match &outcome {
        Ok(fetched) => fetched.quota,
        Err(e) => e.quota(),
      };
      if let Some(quota) = reported {
        self.limits.rate.update(quota);
      }

      match outcome {
        Ok(fetched) => return Ok(fetched.value),
        Err(Error::RateLimited { platform, reset_at }) => {
          if rate_waits >= self.limits.policy.max_rate_limit_waits {
            return Err(Error::RateLimited { platform, reset_at });
          }
          rate_waits += 1;
          let reset_at = reset_at
            .filter(|at| *at > Utc::now())
            .unwrap_or_else(|| Utc::now() + backoff_delta(self.limits.policy.retry_base, 0));
          tracing::warn!(
            platform = %self.limits.platform,
            key,
            reset_at = %reset_at,
            "Rate limited mid-request, waiting for reset"
          );
          self.limits.rate.mark_exhausted(reset_at);
        }
        Err(e) if e.is_transient() => {
          attempt += 1;
          if attempt >= max_attempts {
            return Err(Error::RetriesExhausted {
              attempts: attempt,
              source: Box::new(e),
            });
          }
          let delay = backoff(self.limits.policy.retry_base, attempt);
          tracing::warn!(
            platform = %self.limits.platform,
            key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "Transient failure, backing off"
          );
          cancel.run(tokio::time::sleep(delay)).await?;
        }
        Err(e) => return Err(e),
      }
    }
  }

  /// One attempt: ticket, quota check, call.
  async fn call_once<F, Fut>(&self, cancel: &CancelToken, call: &F) -> Result<Fetched<T>>
  where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Fetched<T>>>,
  {
    let queued = Instant::now();
    let _ticket = cancel
      .run(self.limits.tickets.acquire())
      .await?
      .map_err(|_| Error::Internal("ticket pool closed".to_string()))?;

    let waited = queued.elapsed();
    if waited > self.limits.policy.queue_warn {
      tracing::debug!(
        platform = %self.limits.platform,
        waited_ms = waited.as_millis() as u64,
        available = self.limits.tickets.available_permits(),
        "Request queued for a ticket"
      );
    }

    self.limits.rate.wait_for_reset(cancel).await?;
    cancel.run(call()).await?
  }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
  base.saturating_mul(2u32.saturating_pow(attempt))
}

fn backoff_delta(base: Duration, attempt: u32) -> chrono::Duration {
  chrono::Duration::from_std(backoff(base, attempt)).unwrap_or(chrono::Duration::seconds(1))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cancel::CancelSource;
  use crate::platform::RateQuota;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn fast_policy() -> GatePolicy {
    GatePolicy {
      retry_base: Duration::from_millis(1),
      ..GatePolicy::default()
    }
  }

  #[tokio::test]
  async fn concurrent_same_key_calls_once() {
    let gate: RequestGate<String> = RequestGate::new("test", fast_policy());
    let calls = AtomicUsize::new(0);
    let calls = &calls;
    let never = CancelToken::never();

    let call = || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(Fetched::new("payload".to_string()))
    };

    let (a, b) = tokio::join!(
      gate.execute("GetIssues:1", &never, call),
      gate.execute("GetIssues:1", &never, call)
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), "payload");
    assert_eq!(b.unwrap(), "payload");
    assert_eq!(gate.in_flight(), 0);
  }

  #[tokio::test]
  async fn errors_are_shared_too() {
    let gate: RequestGate<u32> = RequestGate::new("test", fast_policy());
    let calls = AtomicUsize::new(0);
    let calls = &calls;
    let never = CancelToken::never();

    let call = || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(30)).await;
      Err::<Fetched<u32>, _>(Error::permanent("test", "404"))
    };

    let (a, b) = tokio::join!(
      gate.execute("k", &never, call),
      gate.execute("k", &never, call)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(a, Err(Error::Permanent { .. })));
    assert!(matches!(b, Err(Error::Permanent { .. })));
  }

  #[tokio::test]
  async fn ticket_pool_bounds_concurrency() {
    let gate = Arc::new(RequestGate::<usize>::new(
      "test",
      GatePolicy {
        max_concurrent: 2,
        ..fast_policy()
      },
    ));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..10 {
      let gate = Arc::clone(&gate);
      let active = Arc::clone(&active);
      let peak = Arc::clone(&peak);
      handles.push(tokio::spawn(async move {
        let key = format!("key-{}", i);
        gate
          .execute(&key, &CancelToken::never(), || {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
              let now = active.fetch_add(1, Ordering::SeqCst) + 1;
              peak.fetch_max(now, Ordering::SeqCst);
              tokio::time::sleep(Duration::from_millis(20)).await;
              active.fetch_sub(1, Ordering::SeqCst);
              Ok(Fetched::new(i))
            }
          })
          .await
      }));
    }

    for handle in handles {
      handle.await.unwrap().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
  }

  #[tokio::test]
  async fn exhausted_quota_delays_call_until_reset() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    let reset_at = Utc::now() + chrono::Duration::milliseconds(300);
    gate.limits.rate.update(RateQuota {
      remaining: 0,
      limit: Some(100),
      reset_at: Some(reset_at),
    });

    let called_at = std::sync::Mutex::new(None);
    let slot = &called_at;
    gate
      .execute("k", &CancelToken::never(), || async move {
        *slot.lock().unwrap() = Some(Utc::now());
        Ok(Fetched::new(()))
      })
      .await
      .unwrap();

    let called_at = called_at.lock().unwrap().unwrap();
    assert!(called_at >= reset_at, "called at {} before reset {}", called_at, reset_at);
  }

  #[tokio::test]
  async fn quota_from_response_is_recorded() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    gate
      .execute("k", &CancelToken::never(), || async {
        Ok(Fetched::with_quota(
          (),
          Some(RateQuota {
            remaining: 42,
            limit: Some(5000),
            reset_at: None,
          }),
        ))
      })
      .await
      .unwrap();
    assert_eq!(gate.rate_state().remaining, 42);
    assert_eq!(gate.rate_state().limit, Some(5000));
  }

  #[tokio::test]
  async fn quota_from_failed_response_is_recorded() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    let never = CancelToken::never();
    let err = gate
      .execute("GetIssues:1", &never, || async {
        Err(Error::permanent("test", "404 Not Found").with_quota(Some(RateQuota {
          remaining: 3,
          limit: Some(2000),
          reset_at: None,
        })))
      })
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Permanent { .. }));
    assert_eq!(gate.rate_state().remaining, 3);
    assert_eq!(gate.rate_state().limit, Some(2000));
  }

  #[tokio::test]
  async fn server_error_with_exhausted_quota_waits_for_reset() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    let never = CancelToken::never();
    let reset_at = Utc::now() + chrono::Duration::milliseconds(200);
    let calls = std::sync::Mutex::new(Vec::new());
    let calls = &calls;

    gate
      .execute("k", &never, || async move {
        let mut seen = calls.lock().unwrap();
        seen.push(Utc::now());
        if seen.len() == 1 {
          Err(Error::transient("test", "502 Bad Gateway").with_quota(Some(RateQuota {
            remaining: 0,
            limit: Some(100),
            reset_at: Some(reset_at),
          })))
        } else {
          Ok(Fetched::new(()))
        }
      })
      .await
      .unwrap();

    let seen = calls.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[1] >= reset_at, "retried at {} before reset {}", seen[1], reset_at);
  }

  #[test]
  fn backoff_doubles_per_attempt() {
    let base = Duration::from_millis(100);
    assert_eq!(backoff(base, 0), Duration::from_millis(100));
    assert_eq!(backoff(base, 1), Duration::from_millis(200));
    assert_eq!(backoff(base, 2), Duration::from_millis(400));
    assert_eq!(backoff(base, 3), Duration::from_millis(800));
    assert_eq!(backoff(Duration::from_secs(1), 40), Duration::from_secs(u64::from(u32::MAX)));
  }

  #[tokio::test]
  async fn retries_wait_out_the_backoff() {
    let gate: RequestGate<()> = RequestGate::new(
      "test",
      GatePolicy {
        retry_base: Duration::from_millis(20),
        ..GatePolicy::default()
      },
    );
    let never = CancelToken::never();
    let started = Instant::now();

    let err = gate
      .execute("k", &never, || async {
        Err::<Fetched<()>, _>(Error::transient("test", "503"))
      })
      .await
      .unwrap_err();

    // attempts 1 and 2 back off 40ms and 80ms before the third try
    assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
    assert!(started.elapsed() >= Duration::from_millis(120));
  }

  #[tokio::test]
  async fn transient_failures_are_retried() {
    let gate: RequestGate<&'static str> = RequestGate::new("test", fast_policy());
    let calls = AtomicUsize::new(0);
    let calls = &calls;

    let result = gate
      .execute("k", &CancelToken::never(), || async move {
        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
          Err(Error::transient("test", "502"))
        } else {
          Ok(Fetched::new("ok"))
        }
      })
      .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn exhausted_retries_report_attempts() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    let calls = AtomicUsize::new(0);
    let calls = &calls;

    let err = gate
      .execute("k", &CancelToken::never(), || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::transient("test", "connection reset"))
      })
      .await
      .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match err {
      Error::RetriesExhausted { attempts, source } => {
        assert_eq!(attempts, 3);
        assert!(source.is_transient());
      }
      other => panic!("unexpected error {:?}", other),
    }
  }

  #[tokio::test]
  async fn permanent_failures_are_not_retried() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    let calls = AtomicUsize::new(0);
    let calls = &calls;

    let err = gate
      .execute("k", &CancelToken::never(), || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::permanent("test", "404 Not Found"))
      })
      .await
      .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(err, Error::Permanent { .. }));
  }

  #[tokio::test]
  async fn rate_limit_does_not_use_a_retry() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    let calls = AtomicUsize::new(0);

    let calls = &calls;

    // rate limited, transient, transient, ok: four calls within three attempts
    let result = gate
      .execute("k", &CancelToken::never(), || async move {
        match calls.fetch_add(1, Ordering::SeqCst) {
          0 => Err(Error::RateLimited {
            platform: "test".to_string(),
            reset_at: Some(Utc::now() + chrono::Duration::milliseconds(20)),
          }),
          1 | 2 => Err(Error::transient("test", "503")),
          _ => Ok(Fetched::new(())),
        }
      })
      .await;

    assert!(result.is_ok(), "{:?}", result);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test]
  async fn cancelled_waiter_leaves_leader_alone() {
    let gate: RequestGate<u32> = RequestGate::new("test", fast_policy());
    let waiter = CancelSource::new();
    let waiter_token = waiter.token();
    let calls = AtomicUsize::new(0);
    let calls = &calls;

    let call = || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(100)).await;
      Ok(Fetched::new(5))
    };

    let never = CancelToken::never();
    let leader = gate.execute("k", &never, call);
    let follower = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      let pending = gate.execute("k", &waiter_token, call);
      waiter.cancel();
      pending.await
    };

    let (leader, follower) = tokio::join!(leader, follower);
    assert_eq!(leader.unwrap(), 5);
    assert!(matches!(follower, Err(Error::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(gate.in_flight(), 0);
  }

  #[tokio::test]
  async fn cancelled_leader_hands_over_to_waiter() {
    let gate: RequestGate<u32> = RequestGate::new("test", fast_policy());
    let leader_cancel = CancelSource::new();
    let leader_token = leader_cancel.token();
    let calls = AtomicUsize::new(0);
    let calls = &calls;

    let call = || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(Fetched::new(9))
    };

    let leader = gate.execute("k", &leader_token, call);
    let follower = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      gate.execute("k", &CancelToken::never(), call).await
    };
    let canceller = async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      leader_cancel.cancel();
    };

    let (leader, follower, ()) = tokio::join!(leader, follower, canceller);
    assert!(matches!(leader, Err(Error::Cancelled)));
    assert_eq!(follower.unwrap(), 9);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(gate.in_flight(), 0);
  }

  #[tokio::test]
  async fn dropped_leader_cleans_up() {
    let gate: RequestGate<u32> = RequestGate::new("test", fast_policy());
    let never = CancelToken::never();
    let pending = gate.execute("k", &never, || async {
      tokio::time::sleep(Duration::from_secs(30)).await;
      Ok(Fetched::new(1))
    });

    let timed_out = tokio::time::timeout(Duration::from_millis(20), pending).await;
    assert!(timed_out.is_err());
    assert_eq!(gate.in_flight(), 0);
  }

  #[tokio::test]
  async fn cancellation_interrupts_rate_limit_wait() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    gate
      .limits
      .rate
      .mark_exhausted(Utc::now() + chrono::Duration::seconds(60));
    let source = CancelSource::new();
    let token = source.token();
    let calls = AtomicUsize::new(0);
    let calls = &calls;

    let run = gate.execute("k", &token, || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(Fetched::new(()))
    });
    let cancel = async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      source.cancel();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
      tokio::join!(run, cancel)
    })
    .await
    .expect("cancellation should end the wait promptly");
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn sibling_gates_share_quota() {
    let gate: RequestGate<()> = RequestGate::new("test", fast_policy());
    let pages: RequestGate<Vec<u32>> = gate.sharing_limits();
    gate
      .limits
      .rate
      .mark_exhausted(Utc::now() + chrono::Duration::seconds(60));

    assert_eq!(pages.rate_state().remaining, 0);
    assert_eq!(pages.platform(), "test");
  }
}

//! Table of outstanding calls, one per key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::cancel::CancelToken;
use crate::error::Result;

type Outcome<T> = Option<Result<T>>;

/// Outstanding calls keyed by request key.
///
/// The lock only guards the map; nobody holds it while waiting on a call.
pub struct InFlightTable<T> {
  calls: Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>,
}

/// What a caller gets when it joins the table.
pub enum Slot<T: Clone> {
  /// No call was outstanding; this caller runs it and must publish the result.
  Leader(LeaderGuard<T>),
  /// Another caller is running it; wait on this.
  Follower(watch::Receiver<Outcome<T>>),
}

/// How a follower's wait ended.
pub enum Waited<T> {
  Done(Result<T>),
  /// The leader went away without a result; the caller should try again.
  Abandoned,
  Cancelled,
}

impl<T: Clone> InFlightTable<T> {
  pub fn new() -> Self {
    Self {
      calls: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<Outcome<T>>>> {
    self.calls.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn join(self: &Arc<Self>, key: &str) -> Slot<T> {
    let mut calls = self.lock();
    if let Some(rx) = calls.get(key) {
      return Slot::Follower(rx.clone());
    }

    let (tx, rx) = watch::channel(None);
    calls.insert(key.to_string(), rx);
    Slot::Leader(LeaderGuard {
      table: Arc::clone(self),
      key: key.to_string(),
      tx: Some(tx),
    })
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn remove(&self, key: &str) {
    self.lock().remove(key);
  }
}

impl<T: Clone> Default for InFlightTable<T> {
  fn default() -> Self {
    Self::new()
  }
}

/// Held by the caller that runs the call.
///
/// Dropping it without [`LeaderGuard::complete`] removes the entry and closes
/// the channel, so waiters never hang on a call that was cancelled or dropped.
pub struct LeaderGuard<T: Clone> {
  table: Arc<InFlightTable<T>>,
  key: String,
  tx: Option<watch::Sender<Outcome<T>>>,
}

impl<T: Clone> LeaderGuard<T> {
  /// Remove the entry, then hand `result` to every waiter.
  pub fn complete(mut self, result: &Result<T>) {
    if let Some(tx) = self.tx.take() {
      self.table.remove(&self.key);
      tx.send_replace(Some(result.clone()));
    }
  }
}

impl<T: Clone> Drop for LeaderGuard<T> {
  fn drop(&mut self) {
    if self.tx.is_some() {
      self.table.remove(&self.key);
    }
  }
}

/// Wait for the leader's outcome, or for `cancel`.
pub async fn wait_for_leader<T: Clone>(
  mut rx: watch::Receiver<Outcome<T>>,
  cancel: &CancelToken,
) -> Waited<T> {
  let outcome = tokio::select! {
    biased;
    _ = cancel.cancelled() => return Waited::Cancelled,
    outcome = rx.wait_for(Option::is_some) => outcome,
  };

  match outcome {
    Ok(published) => match &*published {
      Some(result) => Waited::Done(result.clone()),
      None => Waited::Abandoned,
    },
    Err(_) => Waited::Abandoned,
  }
}

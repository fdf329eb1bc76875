//! Cooperative cancellation built on `tokio::sync::watch`.
//!
//! A [`CancelSource`] owns the flag; [`CancelToken`]s observe it. Child sources
//! observe their parent as well, so cancelling a refresher stop signal also
//! cancels the pass-level timeout scope derived from it.

use std::future::Future;

use futures::future::select_all;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
  tx: watch::Sender<bool>,
  token: CancelToken,
}

/// Observer side. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  chain: Vec<watch::Receiver<bool>>,
}

impl CancelSource {
  pub fn new() -> Self {
    let (tx, rx) = watch::channel(false);
    Self {
      tx,
      token: CancelToken { chain: vec![rx] },
    }
  }

  /// A source that is also cancelled whenever `parent` is.
  pub fn child_of(parent: &CancelToken) -> Self {
    let (tx, rx) = watch::channel(false);
    let mut chain = parent.chain.clone();
    chain.push(rx);
    Self {
      tx,
      token: CancelToken { chain },
    }
  }

  pub fn token(&self) -> CancelToken {
    self.token.clone()
  }

  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }
}

impl Default for CancelSource {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelToken {
  /// A token that never fires.
  pub fn never() -> Self {
    Self::default()
  }

  pub fn is_cancelled(&self) -> bool {
    self.chain.iter().any(|rx| *rx.borrow())
  }

  /// Resolves once this token or any of its ancestors is cancelled.
  pub async fn cancelled(&self) {
    if self.chain.is_empty() {
      return std::future::pending().await;
    }

    let waits = self.chain.iter().map(|rx| {
      let mut rx = rx.clone();
      Box::pin(async move {
        // A dropped source can no longer cancel anything.
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
          std::future::pending::<()>().await;
        }
      })
    });

    select_all(waits).await;
  }

  /// Run `fut` unless the token fires first.
  pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
    if self.is_cancelled() {
      return Err(Error::Cancelled);
    }
    tokio::select! {
      biased;
      _ = self.cancelled() => Err(Error::Cancelled),
      out = fut => Ok(out),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn child_observes_parent() {
    let parent = CancelSource::new();
    let child = CancelSource::child_of(&parent.token());
    let token = child.token();

    assert!(!token.is_cancelled());
    parent.cancel();
    assert!(token.is_cancelled());
    tokio::time::timeout(Duration::from_secs(1), token.cancelled())
      .await
      .expect("child should observe parent cancellation");
  }

  #[tokio::test]
  async fn parent_ignores_child() {
    let parent = CancelSource::new();
    let child = CancelSource::child_of(&parent.token());
    child.cancel();
    assert!(!parent.token().is_cancelled());
  }

  #[tokio::test]
  async fn run_returns_cancelled() {
    let source = CancelSource::new();
    let token = source.token();
    let handle = tokio::spawn(async move {
      token
        .run(tokio::time::sleep(Duration::from_secs(30)))
        .await
    });
    source.cancel();
    let out = handle.await.unwrap();
    assert!(matches!(out, Err(Error::Cancelled)));
  }

  #[tokio::test]
  async fn never_token_completes_work() {
    let out = CancelToken::never().run(async { 7 }).await.unwrap();
    assert_eq!(out, 7);
  }
}

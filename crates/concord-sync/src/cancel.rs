//! Cooperative cancellation for in-flight sync rounds.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable cancellation flag that can also be awaited.
///
/// Every clone observes the same flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone)]
pub struct CancellationToken {
  tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  pub fn cancel(&self) { self.tx.send_replace(true); }

  pub fn is_cancelled(&self) -> bool { *self.tx.borrow() }

  /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
  pub async fn cancelled(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives in `self`, so the channel cannot close under us.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }
}

impl Default for CancellationToken {
  fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  #[tokio::test]
  async fn clones_share_the_flag() {
    let token = CancellationToken::new();
    let other = token.clone();
    assert!(!other.is_cancelled());
    token.cancel();
    assert!(other.is_cancelled());
    other.cancelled().await;
  }

  #[tokio::test]
  async fn waiters_wake_on_cancel() {
    let token = CancellationToken::new();
    let waiter = {
      let token = token.clone();
      tokio::spawn(async move { token.cancelled().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());
    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), waiter)
      .await
      .expect("waiter woke")
      .unwrap();
  }
}

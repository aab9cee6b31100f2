use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// Cancellation token shared by a watch session, its reader task and its
/// event stream. Cloning hands out another handle to the same token, so a
/// wait can be abandoned from any task.
#[derive(Clone, Debug)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    notified: Notify,
    is_shutdown: AtomicBool,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                notified: Notify::new(),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Trigger shutdown exactly once. Subsequent calls are no-ops.
    pub fn trigger(&self) {
        if !self.inner.is_shutdown.swap(true, Ordering::SeqCst) {
            // first time wake all current waiters
            self.inner.notified.notify_waiters();
        }
    }

    /// Wait for shutdown. If shutdown already happened, returns immediately.
    pub async fn wait(&self) {
        // initializing the future here avoids race
        let notified = self.inner.notified.notified();

        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            return;
        }

        notified.await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::SeqCst)
    }

    /// Drive `fut` to completion unless shutdown fires first, in which case
    /// `fut` is dropped and `None` comes back.
    pub async fn run_until<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            () = self.wait() => None,
            out = fut => Some(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn trigger_wakes_waiter_in_other_task() {
        let token = Shutdown::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.trigger();
        handle.await.expect("waiter panicked");
        assert!(token.is_shutdown());
    }

    #[tokio::test]
    async fn run_until_abandons_pending_future() {
        let token = Shutdown::new();
        token.trigger();
        let out = token.run_until(std::future::pending::<()>()).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn run_until_returns_output_when_not_cancelled() {
        let token = Shutdown::new();
        assert_eq!(token.run_until(async { 7 }).await, Some(7));
    }
}

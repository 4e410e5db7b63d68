//! Termination signal handling.
//!
//! A single [`CancellationToken`] is shared by every long-running operation of
//! the run. It moves from not-cancelled to cancelled at most once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct CancellationSupervisor {
    token: CancellationToken,
    requested: Arc<AtomicBool>,
}

impl CancellationSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token to hand to operations that must stop on termination
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the run; later calls are no-ops.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn cancel(&self, source: &str) -> bool {
        if self
            .requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        info!(source, "termination requested, cancelling running operations");
        self.token.cancel();
        true
    }

    /// Cancel the run when SIGTERM or Ctrl+C arrives
    #[must_use]
    pub fn listen(&self) -> JoinHandle<()> {
        self.listen_for(termination_signal(), "signal")
    }

    /// Cancel the run once `trigger` resolves, unless the run finished first
    pub fn listen_for<F>(&self, trigger: F, source: &'static str) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = trigger => {
                    supervisor.cancel(source);
                }
                () = supervisor.token.cancelled() => {}
            }
        })
    }
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancellation_is_idempotent() {
        let supervisor = CancellationSupervisor::new();
        assert!(!supervisor.is_cancelled());
        assert!(supervisor.cancel("test"));
        assert!(!supervisor.cancel("test"));
        assert!(supervisor.is_cancelled());
        assert!(supervisor.token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_cancel_exactly_once() {
        let supervisor = CancellationSupervisor::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let supervisor = supervisor.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    supervisor.cancel("signal")
                })
            })
            .collect();

        let mut transitions = 0;
        for handle in handles {
            if handle.await.unwrap() {
                transitions += 1;
            }
        }
        assert_eq!(transitions, 1);
        assert!(supervisor.token().is_cancelled());
    }

    #[tokio::test]
    async fn trigger_cancels_shared_token() {
        let supervisor = CancellationSupervisor::new();
        let token = supervisor.token();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let handle = supervisor.listen_for(
            async move {
                let _ = rx.await;
            },
            "test",
        );
        assert!(!token.is_cancelled());

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn listener_exits_when_cancelled_elsewhere() {
        let supervisor = CancellationSupervisor::new();
        let handle = supervisor.listen_for(std::future::pending(), "test");
        supervisor.cancel("run finished");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

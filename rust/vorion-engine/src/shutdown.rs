//! Graceful shutdown coordination
//!
//! A process-wide flag gates new work: intake rejects once it is set and
//! workers stop dequeuing. The coordinator then drains in-flight handlers
//! under a deadline and forces close when it expires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default drain deadline
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Cloneable view of the shutdown flag
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve when shutdown begins (immediately if it already has)
    pub async fn wait(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut receiver = self.receiver.clone();
        while receiver.changed().await.is_ok() {
            if *receiver.borrow() {
                return;
            }
        }
    }
}

/// Owns the flag and the drain procedure
pub struct ShutdownCoordinator {
    flag: Arc<AtomicBool>,
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            sender,
            receiver,
        }
    }

    /// Signal handle for workers and the intake gate
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            flag: self.flag.clone(),
            receiver: self.receiver.clone(),
        }
    }

    /// Flip the flag; new work is rejected from here on
    pub fn begin(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.sender.send(true);
    }

    /// Drain worker tasks under the deadline. Tasks still running when it
    /// expires are aborted with a warning.
    pub async fn drain(&self, workers: Vec<JoinHandle<()>>, deadline: Duration) {
        self.begin();

        let drain_all = async {
            for handle in &workers {
                // JoinHandle is polled via its abort handle below; here we
                // only wait for natural completion
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };

        if tokio::time::timeout(deadline, drain_all).await.is_err() {
            tracing::warn!(
                deadline_s = deadline.as_secs(),
                "shutdown deadline exceeded, forcing close"
            );
            for handle in &workers {
                handle.abort();
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_observes_begin() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        assert!(!signal.is_shutting_down());
        coordinator.begin();
        assert!(signal.is_shutting_down());
        signal.wait().await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_workers() {
        let coordinator = ShutdownCoordinator::new();
        let signal = coordinator.signal();
        let worker = tokio::spawn(async move {
            signal.wait().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        });
        coordinator
            .drain(vec![worker], Duration::from_secs(5))
            .await;
    }

    #[tokio::test]
    async fn test_drain_forces_close_on_deadline() {
        let coordinator = ShutdownCoordinator::new();
        let worker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let started = std::time::Instant::now();
        coordinator
            .drain(vec![worker], Duration::from_millis(50))
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

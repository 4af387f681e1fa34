use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative shutdown for the worker loops.
///
/// State lives in a watch channel, so a listener created after `trigger()`
/// still observes the shutdown. Loops `select!` on
/// [`ShutdownListener::wait`] next to their interval tick.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let mut listener = shutdown.subscribe();
///
/// loop {
///     tokio::select! {
///         _ = listener.wait() => break,
///         _ = ticker.tick() => sweep().await,
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
    drained: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        let (drained, _) = watch::channel(0);
        Self {
            state: Arc::new(state),
            drained: Arc::new(drained),
        }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.state.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.state.borrow()
    }

    /// Trigger shutdown for every listener. Idempotent.
    pub fn trigger(&self) {
        let first = self.state.send_if_modified(|down| {
            if *down {
                false
            } else {
                *down = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        }
    }

    /// A guard that marks one loop as drained when dropped.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            drained: Arc::clone(&self.drained),
        }
    }

    /// Wait for `expected` guards to drop, up to `timeout`.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drained.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|n| *n >= expected)).await;
        let confirmed = *self.drained.borrow();
        match waited {
            Ok(_) => {
                info!(confirmed, "all loops drained");
                DrainResult::Complete(confirmed)
            }
            Err(_) => {
                warn!(confirmed, expected, "drain timeout; some loops did not stop in time");
                DrainResult::Timeout {
                    confirmed,
                    expected,
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ShutdownListener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once shutdown has been triggered (immediately if it already was).
    pub async fn wait(&mut self) {
        // A closed channel means the signal is gone; treat it as shutdown.
        let _ = self.rx.wait_for(|down| *down).await;
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless shutdown arrives first. Returns `false`
    /// when interrupted.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Confirms drain on drop.
#[derive(Debug)]
pub struct ShutdownGuard {
    drained: Arc<watch::Sender<usize>>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.drained.send_modify(|n| *n += 1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn late_listener_sees_shutdown() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut listener = signal.subscribe();
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("listener resolves immediately");
    }

    #[tokio::test]
    async fn sleep_is_interrupted() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        let s = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            s.trigger();
        });
        assert!(!listener.sleep(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn sleep_completes_without_shutdown() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        assert!(listener.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let signal = ShutdownSignal::new();
        let g1 = signal.guard();
        let g2 = signal.guard();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(g1);
            drop(g2);
        });
        assert!(signal.wait_for_drain(2, Duration::from_secs(1)).await.is_complete());
    }

    #[tokio::test]
    async fn drain_times_out() {
        let signal = ShutdownSignal::new();
        let _held = signal.guard();
        let result = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Engine-wide shutdown state shared with every component that has to react
/// to a stop in progress (redelivery sleeps, failover loops, consumers).
#[derive(Clone)]
pub struct ShutdownSignal {
    stopping: Arc<watch::Sender<bool>>,
    forced: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (stopping, _) = watch::channel(false);
        Self {
            stopping: Arc::new(stopping),
            forced: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    pub fn begin(&self) {
        self.stopping.send_replace(true);
    }

    /// The graceful period is over; remaining work should be abandoned.
    pub fn force(&self) {
        self.forced.store(true, Ordering::SeqCst);
        self.stopping.send_replace(true);
    }

    pub fn reset(&self) {
        self.forced.store(false, Ordering::SeqCst);
        self.stopping.send_replace(false);
    }

    /// Resolves once a stop has begun.
    pub async fn stopping(&self) {
        let mut rx = self.stopping.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stopping_wakes_waiters() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.stopping().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signal.begin();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(signal.is_stopping());
        assert!(!signal.is_forced());

        signal.force();
        assert!(signal.is_forced());
        signal.reset();
        assert!(!signal.is_stopping());
    }
}

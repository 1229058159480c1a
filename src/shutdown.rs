use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Process-wide keep-running flag shared by every worker.
///
/// Cancellation is cooperative: workers check [`Shutdown::is_running`] at
/// the top of each iteration and race their blocking calls against
/// [`Shutdown::cancelled`]. A fatal condition is latched exactly once so
/// the supervisor can tell a requested stop from a failure.
#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    fatal: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Resolves once a stop was requested, by either path.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Requests an orderly stop (Ctrl-C, end of test).
    pub fn request_stop(&self) {
        if self.is_running() {
            info!("Stop requested, telling all workers to exit");
        }
        self.token.cancel();
    }

    /// Latches a fatal condition and stops every worker.
    ///
    /// Returns `true` only for the call that actually raised it; later
    /// callers are ignored so the signal fires once.
    pub fn raise_fatal(&self, reason: impl Into<String>) -> bool {
        if self
            .fatal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let reason = reason.into();
        error!("Fatal: {reason}. Shutting down.");
        if let Ok(mut slot) = self.reason.lock() {
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_is_raised_once() {
        let shutdown = Shutdown::new();
        assert!(shutdown.is_running());

        assert!(shutdown.raise_fatal("stream failed 5 times"));
        assert!(!shutdown.raise_fatal("second reason"));

        assert!(!shutdown.is_running());
        assert!(shutdown.is_fatal());
        assert_eq!(
            shutdown.fatal_reason().as_deref(),
            Some("stream failed 5 times")
        );
    }

    #[tokio::test]
    async fn test_stop_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        shutdown.request_stop();
        handle.await.unwrap();
        assert!(!shutdown.is_fatal());
        assert_eq!(shutdown.fatal_reason(), None);
    }
}

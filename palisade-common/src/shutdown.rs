use std::sync::Arc;

use tokio::sync::Semaphore;

/// A one-way stop latch. Enrolment polling, the peer channels, and their
/// per-connection tasks all watch one of these; raising it is how a node
/// winds anything down.
///
/// Semantics worth knowing:
///
/// - Cloning yields another handle onto the same latch.
/// - The signal is level-triggered, not edge-triggered: a handle that
///   starts waiting *after* the latch was raised completes immediately.
///   That is what lets a reconnect loop poll for shutdown at the top of
///   every iteration without ever missing a stop request.
/// - Raising the latch twice is harmless; it stays raised.
///
/// Internally this rides on a [`Semaphore`] with zero permits: [`acquire`]
/// on such a semaphore blocks until the semaphore is closed, so `send`
/// closes it and `recv` reads the resulting [`AcquireError`] as the
/// signal.
///
/// [`acquire`]: Semaphore::acquire
/// [`AcquireError`]: tokio::sync::AcquireError
#[derive(Clone, Debug)]
pub struct ShutdownChannel {
    inner: Arc<Semaphore>,
}

impl ShutdownChannel {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
        }
    }

    /// Raise the latch. Every current and future [`recv`](Self::recv)
    /// completes.
    pub fn send(&self) {
        self.inner.close()
    }

    /// Wait until the latch is raised. Returns immediately if it already
    /// was.
    pub async fn recv(&self) {
        match self.inner.acquire().await {
            Ok(_permit) => unreachable!("No permit is ever added"),
            Err(_closed) => (),
        }
    }

    /// Check the latch without waiting.
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn raising_releases_current_and_future_waiters() {
        let shutdown = ShutdownChannel::new();
        let waiter = shutdown.clone();
        let waiting = tokio::spawn(async move { waiter.recv().await });

        time::sleep(Duration::from_millis(10)).await;
        assert!(!shutdown.try_recv());

        shutdown.send();
        // Raising again changes nothing.
        shutdown.send();
        waiting.await.unwrap();

        // A handle cloned after the fact still observes the signal.
        let late = shutdown.clone();
        assert!(late.try_recv());
        time::timeout(Duration::from_millis(1), late.recv())
            .await
            .expect("recv after send must not block");
    }
}

//! A channel for broadcasting a shutdown signal to all tasks.

use std::sync::Arc;

use tokio::sync::Semaphore;

/// A synchronization utility designed for sending / receiving shutdown
/// signals.
///
/// Features:
///
/// - Multi-producer and multi-consumer - simply clone to get another handle.
/// - Consumers observe shutdown signals that were sent before they started
///   waiting (unlike [`tokio::sync::broadcast`]).
/// - Sending the signal multiple times is safe.
///
/// Internally this relies on the fact that [`Semaphore::acquire`] on a
/// semaphore with zero permits returns only once the semaphore has been
/// closed: closing is "send", and observing the close is "receive".
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

    /// Send the shutdown signal, releasing every current and future waiter.
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for the shutdown signal. Returns immediately if one was already
    /// sent.
    pub async fn recv(&self) {
        match self.inner.acquire().await {
            // Zero permits exist, so an acquire can only ever fail (closed).
            Ok(_permit) => unreachable!("acquired a permit from 0 permits"),
            Err(_closed) => (),
        }
    }

    /// Whether a shutdown signal has already been sent.
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn multiple_sends_dont_panic() {
        let shutdown = ShutdownChannel::new();
        shutdown.send();
        shutdown.send();
        assert!(shutdown.try_recv());
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_still_observes() {
        let shutdown = ShutdownChannel::new();
        shutdown.send();
        let late = shutdown.clone();
        tokio::time::timeout(Duration::from_secs(1), late.recv())
            .await
            .expect("Should have observed the earlier signal");
    }
}

use std::sync::Arc;

use tokio::sync::Semaphore;

/// A synchronization utility for sending / receiving shutdown signals.
///
/// Features:
///
/// - Multi-producer and multi-consumer - simply clone to get another handle.
/// - Every clone observes shutdown signals at-most-once. If the shutdown has
///   already been sent, new clones can still observe it once.
/// - Consumers can receive shutdown signals that were sent prior to
///   'subscribing' to the channel (unlike [`tokio::sync::broadcast`]).
/// - It is safe to send a shutdown signal multiple times.
///
/// The underlying implementation (ab)uses the fact that calling [`acquire`]
/// on a [`Semaphore`] with 0 permits only returns once the [`Semaphore`] has
/// been closed. Closing the [`Semaphore`] is equivalent to sending a shutdown
/// signal.
///
/// [`acquire`]: Semaphore::acquire
#[derive(Debug)]
pub struct ShutdownChannel {
    inner: Arc<Semaphore>,
    have_recved: bool,
}

impl ShutdownChannel {
    /// Construct a new [`ShutdownChannel`].
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(0)),
            have_recved: false,
        }
    }

    /// Send a shutdown signal, causing all actors waiting on this channel to
    /// complete their call to [`recv`].
    ///
    /// [`recv`]: ShutdownChannel::recv
    pub fn send(&self) {
        self.inner.close();
    }

    /// Wait for a shutdown signal.
    ///
    /// If this handle has already observed a shutdown, _this future will
    /// never return!_
    pub async fn recv(&mut self) {
        if self.have_recved {
            std::future::pending().await
        } else {
            self.inner
                .acquire()
                .await
                .map_err(|_| ())
                .expect_err("Shouldn't've been able to acquire a permit");
            self.have_recved = true;
        }
    }

    /// Immediately returns whether a shutdown signal has been sent.
    pub fn try_recv(&self) -> bool {
        self.inner.is_closed()
    }
}

impl Clone for ShutdownChannel {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            // Every clone gets a chance to see the shutdown, even if the
            // clonee handle has already seen it.
            have_recved: false,
        }
    }
}

#[cfg(test)]
mod test {
    use tokio_test::{assert_pending, assert_ready};

    use super::*;

    #[test]
    fn multiple_sends_doesnt_panic() {
        let shutdown = ShutdownChannel::new();
        shutdown.send();
        shutdown.send();
    }

    #[test]
    fn only_yields_shutdown_once_per_handle() {
        let shutdown1 = ShutdownChannel::new();
        let mut shutdown2 = shutdown1.clone();

        let mut recv_task = tokio_test::task::spawn(shutdown2.recv());
        assert_pending!(recv_task.poll());

        shutdown1.send();

        assert!(recv_task.is_woken());
        assert_ready!(recv_task.poll());
        drop(recv_task);

        // recv'ing from the same handle again never resolves
        let mut recv_again = tokio_test::task::spawn(shutdown2.recv());
        assert_pending!(recv_again.poll());
        drop(recv_again);

        // but a new clone gets a fresh chance to see the shutdown
        let mut shutdown3 = shutdown2.clone();
        assert!(shutdown3.try_recv());
        let mut recv_task3 = tokio_test::task::spawn(shutdown3.recv());
        assert_ready!(recv_task3.poll());
    }
}

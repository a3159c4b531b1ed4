use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};

/// A thin wrapper around [`tokio::task::JoinHandle`] that adds the
/// `#[must_use]` lint to ensure that all spawned tasks are joined or
/// explicitly annotated that no joining is required, plus a task label that
/// shows up in logs.
#[must_use]
pub struct LxTask<T> {
    handle: JoinHandle<T>,
    name: &'static str,
}

impl<T> LxTask<T> {
    pub fn spawn<F>(name: &'static str, future: F) -> LxTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        LxTask {
            handle: tokio::spawn(future),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Abort the task, without waiting for it to finish cancelling.
    pub fn abort(&self) {
        self.handle.abort()
    }

    /// Detach the task so it keeps running in the background without a
    /// handle. Prefer holding the handle and joining where possible.
    pub fn detach(self) {
        drop(self.handle)
    }
}

impl<T> Future for LxTask<T> {
    type Output = Result<T, JoinError>;
    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

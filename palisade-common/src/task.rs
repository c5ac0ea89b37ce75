use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, debug, error};

/// A thin wrapper around [`tokio::task::JoinHandle`] that:
///
/// (1) propagates panics instead of catching them
/// (2) adds the `#[must_use]` lint to ensure that all spawned tasks are
///     joined or explicitly annotated that no joining is required. Use
///     [`NodeTask::detach`] to make it clear that the spawned task should be
///     detached from the handle. Once detached, a task can't be joined.
///
/// [`NodeTask`] also includes a task name for improved debuggability: channel
/// tasks are named after the endpoint they serve so hung shutdowns can be
/// attributed.
#[must_use]
pub struct NodeTask<T> {
    task: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T> NodeTask<T> {
    /// Spawns a named task which inherits from the current span.
    /// This is generally what you want to use.
    #[inline]
    pub fn spawn<F>(
        name: impl Into<Cow<'static, str>>,
        future: F,
    ) -> NodeTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        // Instrument the future so that the current tracing span propagates
        // past spawn boundaries.
        let span = tracing::Span::current();
        Self::spawn_with_span(name, span, future)
    }

    /// Spawns a named task with a custom span.
    ///
    /// Note that the [`tracing::Span`]s generated by the `span!` macros
    /// inherit from the current span by default. Include `parent: None` to
    /// prevent that.
    #[inline]
    pub fn spawn_with_span<F>(
        name: impl Into<Cow<'static, str>>,
        span: tracing::Span,
        future: F,
    ) -> NodeTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.into();
        debug!("Spawning task: {name}");
        Self {
            task: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    /// Drop the task handle, detaching it so it continues running in the
    /// background. Without a handle, you can no longer `.await` the task
    /// itself to get the output.
    ///
    /// We consider it an anti-pattern to spawn tasks without some handle to
    /// get the results (or potential panics) from the completed task.
    #[inline]
    pub fn detach(self) {
        std::mem::drop(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Calls [`is_finished`] on the underlying [`JoinHandle`].
    ///
    /// [`is_finished`]: tokio::task::JoinHandle::is_finished
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    #[inline]
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl<T> Future for NodeTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.task).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };

        let result = match result {
            Ok(val) => Ok(val),
            Err(join_err) => match join_err.try_into_panic() {
                // If the inner spawned task panicked, then propagate the
                // panic to the `NodeTask` poller.
                Ok(panic_reason) => {
                    error!("Task '{name}' panicked!", name = self.name());
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };

        Poll::Ready(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_returns_output() {
        let task = NodeTask::spawn("adder", async { 1 + 2 });
        assert_eq!(task.name(), "adder");
        assert_eq!(task.await.unwrap(), 3);
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn panics_propagate() {
        let task = NodeTask::<()>::spawn("bomb", async { panic!("boom") });
        let _ = task.await;
    }

    #[tokio::test]
    async fn abort_surfaces_as_join_error() {
        let task = NodeTask::<()>::spawn("sleeper", async {
            std::future::pending::<()>().await
        });
        task.abort();
        let err = task.await.unwrap_err();
        assert!(err.is_cancelled());
    }
}

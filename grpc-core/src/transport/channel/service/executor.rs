use hyper::rt;
use std::{future::Future, pin::Pin, sync::Arc};

/// Spawns the background task that drives an HTTP/2 connection to completion.
///
/// A custom executor lets callers embedding this crate in a runtime other than the default
/// `tokio` multi-threaded one (e.g. a `LocalSet`) control how that task is spawned.
pub trait Executor<F> {
    fn execute(&self, fut: F);
}

impl<F> Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TokioExecutor;

impl<F> rt::Executor<F> for TokioExecutor
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}

/// A type-erased, cheaply-clonable [`Executor`], shared between the handshake future and every
/// connection it spawns.
#[derive(Clone)]
pub(crate) struct SharedExec {
    inner: Arc<dyn Executor<Pin<Box<dyn Future<Output = ()> + Send>>> + Send + Sync>,
}

impl SharedExec {
    pub(crate) fn new<E>(exec: E) -> Self
    where
        E: Executor<Pin<Box<dyn Future<Output = ()> + Send>>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(exec),
        }
    }

    pub(crate) fn tokio() -> Self {
        Self::new(TokioExecutor)
    }

    /// Spawns an already-boxed background task on this executor.
    pub(crate) fn spawn(&self, fut: Pin<Box<dyn Future<Output = ()> + Send>>) {
        self.inner.execute(fut);
    }
}

impl<F> rt::Executor<F> for SharedExec
where
    F: Future<Output = ()> + Send + 'static,
{
    fn execute(&self, fut: F) {
        self.inner.execute(Box::pin(fut));
    }
}

impl std::fmt::Debug for SharedExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedExec").finish()
    }
}

/// Explicit asynchronous results
///
/// Producers wrapped by [`Stage`](crate::stage::Stage) and
/// [`FunctionCache`](crate::memo::FunctionCache) may hand back a value that is
/// not ready yet. [`Deferred`] is that value; [`MaybeDeferred`] is what a
/// producer returns when it may go either way.
use futures::future::{self, BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A value that becomes available when awaited
#[must_use = "a deferred value does nothing unless awaited"]
pub struct Deferred<T> {
    inner: BoxFuture<'static, T>,
}

impl<T: Send + 'static> Deferred<T> {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self { inner: fut.boxed() }
    }

    /// An already-resolved deferred value
    pub fn ready(value: T) -> Self {
        Self::new(future::ready(value))
    }
}

impl<T> Future for Deferred<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.inner.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deferred(..)")
    }
}

/// Either a ready value or a deferred one
#[derive(Debug)]
pub enum MaybeDeferred<T> {
    Ready(T),
    Deferred(Deferred<T>),
}

impl<T: Send + 'static> MaybeDeferred<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, MaybeDeferred::Deferred(_))
    }

    /// The value, if it is ready
    pub fn into_ready(self) -> Option<T> {
        match self {
            MaybeDeferred::Ready(value) => Some(value),
            MaybeDeferred::Deferred(_) => None,
        }
    }

    pub fn into_deferred(self) -> Deferred<T> {
        match self {
            MaybeDeferred::Ready(value) => Deferred::ready(value),
            MaybeDeferred::Deferred(deferred) => deferred,
        }
    }

    pub async fn resolve(self) -> T {
        match self {
            MaybeDeferred::Ready(value) => value,
            MaybeDeferred::Deferred(deferred) => deferred.await,
        }
    }
}

impl<T> From<Deferred<T>> for MaybeDeferred<T> {
    fn from(deferred: Deferred<T>) -> Self {
        MaybeDeferred::Deferred(deferred)
    }
}

//! Resolve-once values shared among every waiter.
//!
//! A [`Deferred`] wraps a boxed future in [`Shared`]: the first poll drives
//! the computation and every clone observes the same result. Nothing runs
//! until something awaits, which is what lets buffers collect items before
//! flushing.

use crate::error::{ResolveError, ResolveResult};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::{Future, IntoFuture};

/// A placeholder for a value that is computed at most once.
pub struct Deferred<T> {
    inner: Shared<BoxFuture<'static, ResolveResult<T>>>,
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Defers a computation until the first await.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ResolveResult<T>> + Send + 'static,
    {
        Self {
            inner: future.boxed().shared(),
        }
    }

    /// An already resolved value.
    pub fn ready(value: T) -> Self {
        Self::new(future::ready(Ok(value)))
    }

    /// An already failed value.
    pub fn failed(error: ResolveError) -> Self {
        Self::new(future::ready(Err(error)))
    }

    /// Returns the result if the value has already been computed.
    pub fn peek(&self) -> Option<&ResolveResult<T>> {
        self.inner.peek()
    }

    /// Returns true once the computation has finished.
    pub fn is_resolved(&self) -> bool {
        self.peek().is_some()
    }

    /// Transforms the value once it resolves.
    pub fn map<U, F>(self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Deferred::new(async move { self.await.map(f) })
    }

    /// Chains a fallible step after the value resolves.
    pub fn and_then<U, F>(self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> ResolveResult<U> + Send + 'static,
    {
        Deferred::new(async move { self.await.and_then(f) })
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> IntoFuture for Deferred<T>
where
    T: Clone,
{
    type Output = ResolveResult<T>;
    type IntoFuture = Shared<BoxFuture<'static, ResolveResult<T>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.inner
    }
}

impl<T> fmt::Debug for Deferred<T>
where
    T: Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peek() {
            Some(result) => f.debug_tuple("Deferred").field(result).finish(),
            None => f.write_str("Deferred(<pending>)"),
        }
    }
}

/// Waits for every deferred, failing fast on the first error.
pub async fn wait_all<T>(deferreds: Vec<Deferred<T>>) -> ResolveResult<Vec<T>>
where
    T: Clone,
{
    future::try_join_all(deferreds.into_iter().map(IntoFuture::into_future)).await
}

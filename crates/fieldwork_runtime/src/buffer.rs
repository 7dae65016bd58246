//! Request-scoped batching of bulk loads.
//!
//! Items added under the same group key accumulate until something awaits
//! one of the returned deferreds. The first waiter drives the flush: it lets
//! in-flight siblings finish adding, detaches the group, and runs one bulk
//! load for everything collected. Later adds under the same key open a new
//! group.

use async_trait::async_trait;
use fieldwork_core::{BufferError, Deferred, ResolveError, ResolveResult};
use rustc_hash::FxHashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tracing::debug;

/// Performs the bulk load for one group.
#[async_trait]
pub trait BatchLoader: Send + Sync + 'static {
    /// Group discriminator.
    type Group: Clone + Eq + Hash + Display + Send + Sync + 'static;
    /// One submitted request.
    type Item: Send + 'static;
    /// The result handed back for one item.
    type Output: Clone + Send + Sync + 'static;

    /// Loads every item of a group. Must return one output per item, in
    /// submission order.
    async fn load(
        &self,
        group: &Self::Group,
        items: Vec<Self::Item>,
    ) -> Result<Vec<Self::Output>, BufferError>;
}

struct PendingGroup<L: BatchLoader> {
    items: Vec<L::Item>,
    flush: Deferred<Arc<Vec<L::Output>>>,
}

type PendingMap<L> = FxHashMap<<L as BatchLoader>::Group, PendingGroup<L>>;

/// Collects items per group and loads each group once.
pub struct Buffer<L: BatchLoader> {
    loader: Arc<L>,
    pending: Arc<Mutex<PendingMap<L>>>,
}

impl<L: BatchLoader> Buffer<L> {
    /// Creates a buffer around a loader.
    pub fn new(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
            pending: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// The underlying loader.
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Queues an item and returns its result placeholder.
    ///
    /// Nothing is loaded until a returned deferred is awaited.
    pub fn add(&self, group: L::Group, item: L::Item) -> Deferred<L::Output> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = pending.entry(group.clone()).or_insert_with(|| PendingGroup {
            items: Vec::new(),
            flush: self.flush(group.clone()),
        });
        let index = entry.items.len();
        entry.items.push(item);
        let flush = entry.flush.clone();
        drop(pending);

        flush.and_then(move |outputs| {
            outputs.get(index).cloned().ok_or_else(|| {
                BufferError::Cardinality {
                    group: group.to_string(),
                    expected: index + 1,
                    actual: outputs.len(),
                }
                .into()
            })
        })
    }

    /// Number of groups waiting to be flushed.
    pub fn pending_groups(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn flush(&self, group: L::Group) -> Deferred<Arc<Vec<L::Output>>> {
        let loader = Arc::clone(&self.loader);
        let pending = Arc::downgrade(&self.pending);

        Deferred::new(async move {
            let Some(pending) = pending.upgrade() else {
                return Err(ResolveError::from(BufferError::Load {
                    group: group.to_string(),
                    message: "buffer was dropped before the group flushed".to_string(),
                }));
            };

            // Let siblings polled in the same pass add to the group first.
            let mut seen = 0;
            loop {
                let len = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&group)
                    .map_or(0, |g| g.items.len());
                if len == seen {
                    break;
                }
                seen = len;
                YieldNow::default().await;
            }

            let items = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&group)
                .map(|g| g.items)
                .unwrap_or_default();

            load_group(loader.as_ref(), &group, items).await
        })
    }
}

async fn load_group<L: BatchLoader>(
    loader: &L,
    group: &L::Group,
    items: Vec<L::Item>,
) -> ResolveResult<Arc<Vec<L::Output>>> {
    let expected = items.len();
    debug!(group = %group, items = expected, "flushing buffer group");

    let outputs = loader.load(group, items).await?;
    if outputs.len() != expected {
        return Err(BufferError::Cardinality {
            group: group.to_string(),
            expected,
            actual: outputs.len(),
        }
        .into());
    }
    Ok(Arc::new(outputs))
}

impl<L: BatchLoader> std::fmt::Debug for Buffer<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("pending_groups", &self.pending_groups())
            .finish()
    }
}

/// Returns `Pending` once, waking itself immediately.
#[derive(Default)]
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::IntoFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Doubler {
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl BatchLoader for Doubler {
        type Group = String;
        type Item = u32;
        type Output = u32;

        async fn load(&self, group: &String, items: Vec<u32>) -> Result<Vec<u32>, BufferError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(items.clone());
            if group == "broken" {
                return Err(BufferError::Load {
                    group: group.clone(),
                    message: "store offline".into(),
                });
            }
            if group == "short" {
                return Ok(Vec::new());
            }
            Ok(items.into_iter().map(|i| i * 2).collect())
        }
    }

    #[tokio::test]
    async fn test_flushes_once_in_submission_order() {
        let buffer = Buffer::new(Doubler::default());
        let a = buffer.add("n".into(), 1);
        let b = buffer.add("n".into(), 2);
        let c = buffer.add("n".into(), 3);

        assert_eq!(buffer.loader().calls.load(Ordering::SeqCst), 0);
        assert_eq!(buffer.pending_groups(), 1);

        assert_eq!(c.await.unwrap(), 6);
        assert_eq!(a.await.unwrap(), 2);
        assert_eq!(b.await.unwrap(), 4);
        assert_eq!(buffer.loader().calls.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.pending_groups(), 0);
    }

    #[tokio::test]
    async fn test_groups_load_separately() {
        let buffer = Buffer::new(Doubler::default());
        let a = buffer.add("a".into(), 1);
        let b = buffer.add("b".into(), 2);

        let (a, b) = futures::join!(a.into_future(), b.into_future());
        assert_eq!((a.unwrap(), b.unwrap()), (2, 4));
        assert_eq!(buffer.loader().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_adds_after_flush_open_a_new_group() {
        let buffer = Buffer::new(Doubler::default());
        assert_eq!(buffer.add("n".into(), 1).await.unwrap(), 2);
        assert_eq!(buffer.add("n".into(), 5).await.unwrap(), 10);

        let batches = buffer.loader().batches.lock().unwrap().clone();
        assert_eq!(batches, vec![vec![1], vec![5]]);
    }

    #[tokio::test]
    async fn test_siblings_joined_with_the_first_waiter() {
        let buffer = Arc::new(Buffer::new(Doubler::default()));

        let first = {
            let buffer = Arc::clone(&buffer);
            async move { buffer.add("n".into(), 1).await }
        };
        let second = {
            let buffer = Arc::clone(&buffer);
            async move { buffer.add("n".into(), 2).await }
        };

        let (first, second) = futures::join!(first, second);
        assert_eq!((first.unwrap(), second.unwrap()), (2, 4));

        let batches = buffer.loader().batches.lock().unwrap().clone();
        assert_eq!(batches, vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_load_failure_fails_every_item() {
        let buffer = Buffer::new(Doubler::default());
        let a = buffer.add("broken".into(), 1);
        let b = buffer.add("broken".into(), 2);

        let a = a.await.unwrap_err();
        let b = b.await.unwrap_err();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.code(), "BUFFER_ERROR");
        assert_eq!(buffer.loader().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cardinality_mismatch() {
        let buffer = Buffer::new(Doubler::default());
        let err = buffer.add("short".into(), 1).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "bulk load for buffer group short returned 0 results for 1 items"
        );
    }
}

//! The job contract: where items come from and how each one is processed.
//!
//! A [`ParallelJob`] is shared by every worker of a run, so all methods take
//! `&self` and may be called concurrently. Implementations that keep mutable
//! state guard it themselves (a `Mutex`, atomics, or a channel to an owning
//! task).
//!
//! Two shapes of job fit the trait:
//! - a pull source that answers [`ParallelJob::item_at`] lazily and overrides
//!   whichever lifecycle hooks it needs;
//! - a fixed list of items plus a processing function, see [`ItemsJob`].

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::JobError;

/// A source of items and the unit of work applied to each one.
#[async_trait]
pub trait ParallelJob: Send + Sync + 'static {
    /// The value flowing through the pipeline.
    type Item: Clone + Send + Sync + 'static;

    /// Checked once before anything is announced. `Ok(false)` ends the run
    /// quietly; `Err` ends it and is reported by `JobStream::finish`.
    async fn can_start(&self) -> Result<bool, JobError> {
        Ok(true)
    }

    /// The item at position `index`, or `None` past the end of the source.
    ///
    /// Called once per index while announcing and again when the item is
    /// scheduled, so the answer for a given index must be stable.
    async fn item_at(&self, index: usize) -> Option<Self::Item>;

    /// Applied once, right before the item's `Queued` event.
    async fn will_queue(&self, item: Self::Item) -> Self::Item {
        item
    }

    /// Applied once, right before the item's `Processing` event. The result
    /// is what [`ParallelJob::process`] receives.
    async fn will_start(&self, item: Self::Item) -> Self::Item {
        item
    }

    /// Process one item. Must watch `cancel` and return
    /// [`JobError::Cancelled`] promptly once it fires.
    async fn process(
        &self,
        item: Self::Item,
        cancel: &CancellationToken,
    ) -> Result<Self::Item, JobError>;

    /// Called when `process` fails; the returned value is reported in the
    /// item's `Error` event.
    async fn failed(&self, item: Self::Item, _error: &JobError) -> Self::Item {
        item
    }
}

/// Race `fut` against `cancel`, mapping cancellation to
/// [`JobError::Cancelled`].
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, JobError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled),
        result = fut => result,
    }
}

// ---------------------------------------------------------------------------
// ItemsJob
// ---------------------------------------------------------------------------

/// A job over a fixed list of items with a single processing function.
///
/// ```no_run
/// use batchrun::{ItemsJob, JobError, ParallelProcessor};
///
/// # async fn demo() -> batchrun::Result<()> {
/// let job = ItemsJob::new(vec![1, 2, 3], |n: u32, _cancel| async move {
///     Ok::<_, JobError>(n * 2)
/// });
/// let processor = ParallelProcessor::new(job);
/// let summary = processor.start()?.finish().await?;
/// assert_eq!(summary.done, 3);
/// # Ok(())
/// # }
/// ```
pub struct ItemsJob<T, F, Fut> {
    items: Vec<T>,
    process: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<T, F, Fut> ItemsJob<T, F, Fut>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, JobError>> + Send + 'static,
{
    pub fn new(items: Vec<T>, process: F) -> Self {
        Self {
            items,
            process,
            _fut: PhantomData,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl<T, F, Fut> ParallelJob for ItemsJob<T, F, Fut>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, JobError>> + Send + 'static,
{
    type Item = T;

    async fn item_at(&self, index: usize) -> Option<T> {
        self.items.get(index).cloned()
    }

    async fn process(&self, item: T, cancel: &CancellationToken) -> Result<T, JobError> {
        (self.process)(item, cancel.clone()).await
    }
}

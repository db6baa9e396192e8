use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::defer::defer;

/// Schedules deferred evictions on the tokio timer.
///
/// Each eviction is an independent task that can be aborted through the returned handle.
/// The scheduler keeps count of the timers that are still alive, so that timers of
/// replaced or removed entries can be observed not to pile up.
#[derive(Clone, Debug, Default)]
pub(crate) struct EvictionScheduler {
    pending: Arc<AtomicUsize>,
}

impl EvictionScheduler {
    /// Runs `evict` once `after` has elapsed.
    ///
    /// The closure is never run if the returned handle is aborted before the deadline.
    pub(crate) fn schedule<F>(&self, after: Duration, evict: F) -> AbortHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let done = defer(move || {
            pending.fetch_sub(1, Ordering::Relaxed);
        });

        let timer = async move {
            let _done = done; // move into the future
            tokio::time::sleep(after).await;
            evict();
        };
        tokio::spawn(timer).abort_handle()
    }

    /// The number of timers that have neither fired nor been aborted yet.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use moka::ops::compute::{CompResult, Op};
use tokio::task::AbortHandle;

use crate::defer::defer;
use crate::eviction::EvictionScheduler;
use crate::{CacheEntry, Interrupted};

// Inner result necessary because `futures::Shared` needs a clonable output, and the channel
// wraps the computation result into its own `Canceled` result.
type ComputationChannel<T, E> = Shared<oneshot::Receiver<Result<T, E>>>;

type Entries<K, T, E> = moka::sync::Cache<K, Slot<T, E>>;

/// A computation shared between every caller that asked for the same key.
///
/// Polling this future does not drive the computation itself, which runs as a separate task.
/// Dropping it therefore never cancels the computation for the other waiters.
pub struct Computation<T, E> {
    channel: ComputationChannel<T, E>,
}

impl<T, E> Clone for Computation<T, E> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Computation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computation")
            .field("settled", &self.channel.peek().is_some())
            .finish()
    }
}

impl<T, E> Future for Computation<T, E>
where
    T: Clone,
    E: Clone + From<Interrupted>,
{
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.channel
            .poll_unpin(cx)
            .map(|received| received.unwrap_or_else(|_canceled| Err(Interrupted.into())))
    }
}

/// One generation of a cache entry.
///
/// A key can be inserted again after its previous entry was evicted, so evictions compare the
/// `generation` they were created for against the current entry and leave newer ones alone.
struct Slot<T, E> {
    generation: u64,
    channel: ComputationChannel<T, E>,
    /// The eviction timer, once the computation settled with a time to live.
    eviction: Arc<OnceLock<AbortHandle>>,
}

impl<T, E> Clone for Slot<T, E> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            channel: self.channel.clone(),
            eviction: Arc::clone(&self.eviction),
        }
    }
}

/// An in-memory cache for asynchronous computations.
///
/// The purpose of this cache is to do request coalescing: all concurrent callers asking for the
/// same key share one computation, and only the caller that inserted the entry invokes the
/// supplier. Settled values are held in memory depending on [`CacheEntry::time_to_live`]:
///
/// - failed computations are evicted right away,
/// - values without a time to live are evicted right away,
/// - values with a time to live are evicted once it elapsed, or earlier through
///   [`invalidate`](Self::invalidate).
///
/// Eviction happens before the result is handed to the waiters, so callers either join a
/// computation that will still deliver its result, or start a new one.
///
/// The computations are spawned on the current tokio runtime, so this cache must be used from
/// within a runtime context.
pub struct CoalescingCache<K, T, E> {
    name: Arc<str>,
    entries: Entries<K, T, E>,
    generations: Arc<AtomicU64>,
    evictions: EvictionScheduler,
}

impl<K, T, E> Clone for CoalescingCache<K, T, E>
where
    K: Hash + Eq + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Self {
            name: Arc::clone(&self.name),
            entries: self.entries.clone(),
            generations: Arc::clone(&self.generations),
            evictions: self.evictions.clone(),
        }
    }
}

impl<K, T, E> fmt::Debug for CoalescingCache<K, T, E>
where
    K: Hash + Eq + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("name", &self.name)
            .field("in-memory items", &self.entries.entry_count())
            .field("pending evictions", &self.evictions.pending())
            .finish()
    }
}

impl<K, T, E> CoalescingCache<K, T, E>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    T: CacheEntry + Clone + Send + Sync + 'static,
    E: Clone + From<Interrupted> + Send + Sync + 'static,
{
    /// Creates a new cache.
    ///
    /// The `name` shows up in logs.
    pub fn new(name: &str) -> Self {
        let entries = moka::sync::Cache::builder().name(name).build();
        Self {
            name: name.into(),
            entries,
            generations: Default::default(),
            evictions: Default::default(),
        }
    }

    /// Returns the computation for `key`, creating it with `supplier` if there is none.
    ///
    /// If an entry exists, its computation is returned and `supplier` is not invoked. Otherwise
    /// the entry is inserted atomically and `supplier` is invoked exactly once, even if many
    /// callers race on the same unseen key.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the
    /// computation on the runtime, even if the returned future is never awaited.
    pub fn get_or_create<F, Fut>(&self, key: K, supplier: F) -> Computation<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut sender = None;
        let slot = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| {
                let (tx, rx) = oneshot::channel();
                sender = Some(tx);
                Slot {
                    generation: self.generations.fetch_add(1, Ordering::Relaxed),
                    channel: rx.shared(),
                    eviction: Default::default(),
                }
            })
            .into_value();

        match sender {
            Some(sender) => {
                tracing::trace!(cache = %self.name, ?key, "Spawning computation");
                self.spawn_computation(key, &slot, supplier, sender);
            }
            None => {
                tracing::trace!(cache = %self.name, ?key, "Computation was deduplicated");
            }
        }

        Computation {
            channel: slot.channel,
        }
    }

    /// Removes the entry for `key`, returning its computation if there was one.
    ///
    /// The returned computation may still be pending. A scheduled eviction of the entry is
    /// cancelled, and the next [`get_or_create`](Self::get_or_create) for `key` starts afresh.
    pub fn invalidate(&self, key: &K) -> Option<Computation<T, E>> {
        let slot = self.entries.remove(key)?;
        if let Some(timer) = slot.eviction.get() {
            timer.abort();
        }
        tracing::trace!(cache = %self.name, ?key, "Invalidated entry");

        Some(Computation {
            channel: slot.channel,
        })
    }

    /// Returns `true` if there is an entry for `key`, pending or settled.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// The number of scheduled evictions that have not fired yet.
    pub fn pending_evictions(&self) -> usize {
        self.evictions.pending()
    }

    /// Spawns the computation as a separate task and handles its completion.
    ///
    /// On completion, the entry is evicted or its eviction is scheduled, and only then is the
    /// result sent to the waiters.
    fn spawn_computation<F, Fut>(
        &self,
        key: K,
        slot: &Slot<T, E>,
        supplier: F,
        sender: oneshot::Sender<Result<T, E>>,
    ) where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let generation = slot.generation;
        let eviction = Arc::clone(&slot.eviction);
        let evictions = self.evictions.clone();
        let entries = self.entries.clone();
        let name = Arc::clone(&self.name);

        // Evicts this generation unless a time to live takes over. This also covers a supplier
        // that panics and a computation that is dropped before it settles.
        let evict_now = {
            let entries = entries.clone();
            let key = key.clone();
            defer(move || {
                evict_generation(&entries, &key, generation);
            })
        };

        let computation = supplier();

        let task = async move {
            let result = computation.await;

            // The error has to be checked before the value is inspected.
            let time_to_live = match &result {
                Err(_) => None,
                Ok(value) => value.time_to_live(),
            };

            match time_to_live {
                // An entry invalidated while pending is no longer in the index and gets no timer.
                Some(time_to_live) if is_current(&entries, &key, generation) => {
                    evict_now.disarm();
                    tracing::trace!(cache = %name, ?key, ?time_to_live, "Scheduling eviction");
                    let timer = {
                        let entries = entries.clone();
                        let key = key.clone();
                        evictions.schedule(time_to_live, move || {
                            if evict_generation(&entries, &key, generation) {
                                tracing::trace!(cache = %name, ?key, "Evicted expired entry");
                            }
                        })
                    };
                    eviction.set(timer).ok();

                    // `invalidate` removes the entry before it looks for the timer, so an
                    // invalidation racing with the above either finds the timer or is seen here.
                    if !is_current(&entries, &key, generation) {
                        if let Some(timer) = eviction.get() {
                            timer.abort();
                        }
                    }
                }
                Some(_) => evict_now.disarm(),
                None => drop(evict_now),
            }

            sender.send(result).ok();
        };

        tokio::spawn(task);
    }
}

/// Returns `true` if the entry for `key` still belongs to `generation`.
fn is_current<K, T, E>(entries: &Entries<K, T, E>, key: &K, generation: u64) -> bool
where
    K: Hash + Eq + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    entries
        .get(key)
        .is_some_and(|slot| slot.generation == generation)
}

/// Removes the entry for `key` if it still belongs to `generation`.
///
/// Returns `true` if an entry was removed.
fn evict_generation<K, T, E>(entries: &Entries<K, T, E>, key: &K, generation: u64) -> bool
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let result = entries
        .entry(key.clone())
        .and_compute_with(|current| match current {
            Some(entry) if entry.value().generation == generation => Op::Remove,
            _ => Op::Nop,
        });
    matches!(result, CompResult::Removed(_))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use tokio::time;

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Value {
        call: usize,
        time_to_live: Option<Duration>,
    }

    impl CacheEntry for Value {
        fn time_to_live(&self) -> Option<Duration> {
            self.time_to_live
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    enum TestError {
        Failed(usize),
        Interrupted,
    }

    impl From<Interrupted> for TestError {
        fn from(_: Interrupted) -> Self {
            Self::Interrupted
        }
    }

    type TestCache = CoalescingCache<&'static str, Value, TestError>;

    /// Counts supplier invocations and produces values after a short delay.
    #[derive(Clone, Default)]
    struct Supplier {
        calls: Arc<AtomicUsize>,
    }

    impl Supplier {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn value(
            &self,
            time_to_live: Option<Duration>,
        ) -> BoxFuture<'static, Result<Value, TestError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                time::sleep(Duration::from_millis(10)).await;
                Ok(Value { call, time_to_live })
            }
            .boxed()
        }

        fn failure(&self) -> BoxFuture<'static, Result<Value, TestError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                time::sleep(Duration::from_millis(10)).await;
                Err(TestError::Failed(call))
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();

        let computations: Vec<_> = (0..16)
            .map(|_| cache.get_or_create("svc", || supplier.value(Some(Duration::from_secs(30)))))
            .collect();
        let results = futures::future::join_all(computations).await;

        assert_eq!(supplier.calls(), 1);
        for result in results {
            assert_eq!(result.unwrap().call, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_across_tasks() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let supplier = supplier.clone();
                tokio::spawn(async move {
                    cache.get_or_create("svc", || supplier.value(None)).await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().call, 0);
        }
        assert_eq!(supplier.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_to_live() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();
        let ttl = Some(Duration::from_secs(30));

        let first = cache.get_or_create("svc", || supplier.value(ttl)).await;
        assert_eq!(first.unwrap().call, 0);
        assert!(cache.contains_key(&"svc"));
        assert_eq!(cache.pending_evictions(), 1);

        time::sleep(Duration::from_secs(10)).await;
        let second = cache.get_or_create("svc", || supplier.value(ttl)).await;
        assert_eq!(second.unwrap().call, 0);
        assert_eq!(supplier.calls(), 1);

        time::sleep(Duration::from_secs(25)).await;
        assert!(!cache.contains_key(&"svc"));
        assert_eq!(cache.pending_evictions(), 0);

        let third = cache.get_or_create("svc", || supplier.value(ttl)).await;
        assert_eq!(third.unwrap().call, 1);
        assert_eq!(supplier.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_time_to_live() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();

        let first = cache.get_or_create("svc", || supplier.value(None)).await;
        assert_eq!(first.unwrap().call, 0);
        assert!(!cache.contains_key(&"svc"));
        assert_eq!(cache.pending_evictions(), 0);

        let second = cache.get_or_create("svc", || supplier.value(None)).await;
        assert_eq!(second.unwrap().call, 1);
        assert_eq!(supplier.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_retained() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();

        let (first, second) = futures::join!(
            cache.get_or_create("svc", || supplier.failure()),
            cache.get_or_create("svc", || supplier.failure()),
        );
        assert_eq!(first, Err(TestError::Failed(0)));
        assert_eq!(second, Err(TestError::Failed(0)));
        assert!(!cache.contains_key(&"svc"));

        let third = cache
            .get_or_create("svc", || supplier.value(Some(Duration::from_secs(30))))
            .await;
        assert_eq!(third.unwrap().call, 1);
        assert_eq!(supplier.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();
        let ttl = Some(Duration::from_secs(30));

        let (a, b) = futures::join!(
            cache.get_or_create("a", || supplier.value(ttl)),
            cache.get_or_create("b", || supplier.value(ttl)),
        );
        assert_ne!(a.unwrap().call, b.unwrap().call);
        assert_eq!(supplier.calls(), 2);

        cache.invalidate(&"a");
        assert!(cache.contains_key(&"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_missing() {
        let cache = TestCache::new("test");
        assert!(cache.invalidate(&"svc").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_settled() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();
        let ttl = Some(Duration::from_secs(30));

        cache.get_or_create("svc", || supplier.value(ttl)).await.unwrap();
        assert_eq!(cache.pending_evictions(), 1);

        let removed = cache.invalidate(&"svc").unwrap();
        assert_eq!(removed.await.unwrap().call, 0);
        assert!(!cache.contains_key(&"svc"));

        // the aborted timer is released on the next turn of the runtime
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cache.pending_evictions(), 0);

        let fresh = cache.get_or_create("svc", || supplier.value(ttl)).await;
        assert_eq!(fresh.unwrap().call, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_pending() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, released) = oneshot::channel::<()>();

        let pending = cache.get_or_create("svc", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                released.await.ok();
                Ok(Value {
                    call: 0,
                    time_to_live: None,
                })
            }
        });

        let removed = cache.invalidate(&"svc").unwrap();

        let supplier = Supplier::default();
        let replacement =
            cache.get_or_create("svc", || supplier.value(Some(Duration::from_secs(30))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(supplier.calls(), 1);

        // settling the invalidated computation must not evict its replacement
        release.send(()).unwrap();
        assert_eq!(removed.await.unwrap().call, 0);
        assert_eq!(pending.await.unwrap().call, 0);
        assert!(cache.contains_key(&"svc"));

        replacement.await.unwrap();
        assert!(cache.contains_key(&"svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_pending_entries_schedule_no_timers() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();
        let year = Some(Duration::from_secs(365 * 24 * 60 * 60));

        for call in 0..100 {
            let pending = cache.get_or_create("svc", || supplier.value(year));
            let removed = cache.invalidate(&"svc").unwrap();

            assert_eq!(removed.await.unwrap().call, call);
            assert_eq!(pending.await.unwrap().call, call);
            assert!(!cache.contains_key(&"svc"));
        }

        assert_eq!(supplier.calls(), 100);
        assert_eq!(cache.pending_evictions(), 0);

        // a settled entry that is not invalidated still gets its timer
        cache.get_or_create("svc", || supplier.value(year)).await.unwrap();
        assert_eq!(cache.pending_evictions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_eviction_keeps_newer_entry() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();

        cache
            .get_or_create("svc", || supplier.value(Some(Duration::from_secs(30))))
            .await
            .unwrap();

        // Settle a newer generation under the same key while the old timer is still running.
        let old = cache.entries.get(&"svc").unwrap();
        cache.entries.remove(&"svc");
        let newer = cache
            .get_or_create("svc", || supplier.value(Some(Duration::from_secs(60))))
            .await;
        assert_eq!(newer.unwrap().call, 1);
        assert!(old.eviction.get().is_some());

        time::sleep(Duration::from_secs(40)).await;
        assert!(cache.contains_key(&"svc"));
        let cached = cache.get_or_create("svc", || supplier.value(None)).await;
        assert_eq!(cached.unwrap().call, 1);
        assert_eq!(supplier.calls(), 2);

        time::sleep(Duration::from_secs(30)).await;
        assert!(!cache.contains_key(&"svc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_does_not_cancel() {
        locator_test::setup();

        let cache = TestCache::new("test");
        let supplier = Supplier::default();
        let ttl = Some(Duration::from_secs(30));

        drop(cache.get_or_create("svc", || supplier.value(ttl)));
        let joined = cache.get_or_create("svc", || supplier.value(ttl)).await;

        assert_eq!(joined.unwrap().call, 0);
        assert_eq!(supplier.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_computation() {
        locator_test::setup();

        let cache = TestCache::new("test");

        async fn explode() -> Result<Value, TestError> {
            time::sleep(Duration::from_millis(10)).await;
            panic!("computation failed");
        }

        let computation = cache.get_or_create("svc", explode);
        assert_eq!(computation.await, Err(TestError::Interrupted));
        assert!(!cache.contains_key(&"svc"));
    }
}

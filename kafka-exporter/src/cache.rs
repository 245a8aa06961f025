//! Metadata cache and refresh scheduler.
//!
//! The cache owns the latest good [`ClusterSnapshot`] and replaces it
//! wholesale on every successful fetch. Callers that race on an expired
//! or missing snapshot all join the same in-flight fetch instead of issuing
//! their own, and a failed fetch falls back to the previous snapshot when
//! there is one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::fetcher::SnapshotFetcher;
use crate::metrics_consts::{SNAPSHOT_AGE_SECONDS, STALE_SNAPSHOTS_SERVED};
use crate::types::ClusterSnapshot;

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<ClusterSnapshot>, FetchError>>>;

#[derive(Clone)]
struct Published {
    snapshot: Arc<ClusterSnapshot>,
    at: Instant,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

struct CacheInner {
    fetcher: SnapshotFetcher,
    refresh_interval: Duration,
    current: RwLock<Option<Published>>,
    in_flight: Mutex<Option<InFlight>>,
    next_fetch_id: AtomicU64,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Nothing panics while holding these locks, but don't cascade if it ever does
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CacheInner {
    fn published(&self) -> Option<Published> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current(&self, published: Option<Published>) {
        let mut current = match self.current.write() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Checked under the write lock so a close can't be overtaken
        if published.is_some() && self.closed.load(Ordering::SeqCst) {
            return;
        }
        *current = published;
    }

    fn publish(&self, snapshot: Arc<ClusterSnapshot>) {
        self.set_current(Some(Published {
            snapshot,
            at: Instant::now(),
        }));
    }

    /// Empties the in-flight slot if it still belongs to fetch `id`.
    fn finish(&self, id: u64) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.as_ref().is_some_and(|f| f.id == id) {
            in_flight.take();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_current(None);
        lock(&self.in_flight).take();
    }
}

#[derive(Clone)]
pub struct MetadataCache {
    inner: Arc<CacheInner>,
}

impl MetadataCache {
    pub fn new(fetcher: SnapshotFetcher, refresh_interval: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                fetcher,
                refresh_interval,
                current: RwLock::new(None),
                in_flight: Mutex::new(None),
                next_fetch_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.inner.refresh_interval
    }

    /// The last published snapshot, however old.
    pub fn current(&self) -> Option<Arc<ClusterSnapshot>> {
        self.inner.published().map(|p| p.snapshot)
    }

    /// Returns a snapshot no older than the refresh interval when possible.
    ///
    /// Within the refresh window this never touches the cluster. Outside of
    /// it, the caller triggers (or joins) a fetch; if that fetch fails the
    /// previous snapshot is served stale, and only without one does the
    /// error reach the caller.
    pub async fn get(&self) -> Result<Arc<ClusterSnapshot>, FetchError> {
        if let Some(published) = self.inner.published() {
            let age = published.at.elapsed();
            if age < self.inner.refresh_interval {
                gauge!(SNAPSHOT_AGE_SECONDS).set(age.as_secs_f64());
                return Ok(published.snapshot);
            }
        }

        match self.refresh().await {
            Ok(snapshot) => {
                gauge!(SNAPSHOT_AGE_SECONDS).set(0.0);
                Ok(snapshot)
            }
            Err(e) => match self.inner.published() {
                Some(stale) => {
                    let age = stale.at.elapsed();
                    warn!(error = %e, age_secs = age.as_secs(), "serving stale cluster snapshot");
                    counter!(STALE_SNAPSHOTS_SERVED).increment(1);
                    gauge!(SNAPSHOT_AGE_SECONDS).set(age.as_secs_f64());
                    Ok(stale.snapshot)
                }
                None => Err(e),
            },
        }
    }

    /// Fetches a new snapshot, or joins the fetch already in flight.
    pub async fn refresh(&self) -> Result<Arc<ClusterSnapshot>, FetchError> {
        if self.is_closed() {
            return Err(FetchError::Unavailable("metadata cache is closed".to_string()));
        }
        let fetch = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.as_ref() {
                Some(running) => {
                    debug!(fetch_id = running.id, "joining in-flight cluster fetch");
                    running.fetch.clone()
                }
                None => {
                    let id = self.inner.next_fetch_id.fetch_add(1, Ordering::SeqCst);
                    let fetch = Self::start_fetch(Arc::clone(&self.inner), id);
                    *in_flight = Some(InFlight {
                        id,
                        fetch: fetch.clone(),
                    });
                    fetch
                }
            }
        };
        fetch.await
    }

    fn start_fetch(inner: Arc<CacheInner>, id: u64) -> SharedFetch {
        async move {
            let result = inner.fetcher.fetch().await.map(Arc::new);
            if let Ok(snapshot) = &result {
                inner.publish(Arc::clone(snapshot));
            }
            inner.finish(id);
            result
        }
        .boxed()
        .shared()
    }

    /// Refreshes on a fixed interval until `cancel` fires. The first tick
    /// completes immediately, which warms the cache at startup.
    pub fn spawn_refresh_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.inner.refresh_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = cache.refresh() => {
                        if let Err(e) = result {
                            warn!(error = %e, "scheduled metadata refresh failed");
                        }
                    }
                }
            }
            info!("metadata refresh loop stopped");
        })
    }

    /// Drops the published snapshot and any in-flight fetch. A fetch that
    /// completes afterwards is not published, and later refreshes fail.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

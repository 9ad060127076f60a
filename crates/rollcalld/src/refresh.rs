use rollcall_core::reference::{ReferenceError, ReferenceSource, ReferenceStore, RefreshReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Pulls the roster from a [`ReferenceSource`] into a [`ReferenceStore`].
pub struct Refresher {
    store: Arc<ReferenceStore>,
    source: Arc<dyn ReferenceSource>,
    timeout: Duration,
    /// Held across fetch and install so refreshes land in the order they started.
    in_flight: Mutex<()>,
}

impl Refresher {
    pub fn new(store: Arc<ReferenceStore>, source: Arc<dyn ReferenceSource>, timeout: Duration) -> Self {
        Self { store, source, timeout, in_flight: Mutex::new(()) }
    }

    /// Fetch once, bounded by the configured timeout, and install on success.
    ///
    /// The blocking fetch runs off the runtime. If it overruns, it is abandoned
    /// and whatever it eventually returns is dropped without touching the store.
    /// A refresh already in flight is waited for first.
    pub async fn refresh_once(&self) -> Result<RefreshReport, ReferenceError> {
        self.refresh_within(self.timeout).await
    }

    async fn refresh_within(&self, bound: Duration) -> Result<RefreshReport, ReferenceError> {
        let _in_flight = self.in_flight.lock().await;
        let source = Arc::clone(&self.source);
        let fetch = tokio::task::spawn_blocking(move || source.fetch());

        let records = match tokio::time::timeout(bound, fetch).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join)) => return Err(ReferenceError::Fetch(format!("fetch task failed: {join}"))),
            Err(_) => return Err(ReferenceError::Timeout(bound)),
        };

        self.store.install(records)
    }

    /// Startup load. Never fails: past `bound`, or on any error, the store keeps
    /// its empty roster and the periodic task fills it later.
    pub async fn load_initial(&self, bound: Duration) -> Option<RefreshReport> {
        match self.refresh_within(bound.min(self.timeout)).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "initial reference load failed; starting with an empty roster"
                );
                None
            }
        }
    }

    /// Refresh every `period` until `shutdown` flips to true or its sender drops.
    ///
    /// The first refresh happens one full period after spawning.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh_once().await {
                            tracing::warn!(
                                source = %self.source.describe(),
                                error = %e,
                                "scheduled reference refresh failed; keeping current roster"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("reference refresh task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a one-person roster, optionally after a delay, counting calls.
    struct CountingSource {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new(delay: Duration) -> Self {
            Self { calls: AtomicUsize::new(0), delay, fail: false }
        }
    }

    impl ReferenceSource for CountingSource {
        fn fetch(&self) -> Result<Vec<Value>, ReferenceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail {
                return Err(ReferenceError::Fetch("service unavailable".into()));
            }
            Ok(vec![json!({"student_id": n, "embedding": [1.0, 0.0]})])
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    fn refresher(source: Arc<CountingSource>, timeout: Duration) -> (Arc<ReferenceStore>, Arc<Refresher>) {
        let store = Arc::new(ReferenceStore::new());
        let refresher = Arc::new(Refresher::new(Arc::clone(&store), source, timeout));
        (store, refresher)
    }

    #[tokio::test]
    async fn test_refresh_once_installs() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let (store, refresher) = refresher(source, Duration::from_secs(5));

        let report = refresher.refresh_once().await.unwrap();
        assert_eq!(report.identities, 1);
        assert_eq!(store.snapshot().set.identity_count(), 1);
    }

    /// The first fetch is slow; every later one returns at once.
    struct SlowFirstSource {
        calls: AtomicUsize,
    }

    impl ReferenceSource for SlowFirstSource {
        fn fetch(&self) -> Result<Vec<Value>, ReferenceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                std::thread::sleep(Duration::from_millis(150));
            }
            Ok(vec![json!({"student_id": n, "embedding": [1.0, 0.0]})])
        }

        fn describe(&self) -> String {
            "slow-first".into()
        }
    }

    #[tokio::test]
    async fn test_overlapping_refreshes_install_in_start_order() {
        let store = Arc::new(ReferenceStore::new());
        let source = Arc::new(SlowFirstSource { calls: AtomicUsize::new(0) });
        let refresher = Refresher::new(Arc::clone(&store), source, Duration::from_secs(5));

        let (first, second) = tokio::join!(refresher.refresh_once(), refresher.refresh_once());
        first.unwrap();
        second.unwrap();

        let snapshot = store.snapshot();
        let ids: Vec<&str> = snapshot.set.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[tokio::test]
    async fn test_timed_out_fetch_never_lands() {
        let slow = Arc::new(CountingSource::new(Duration::from_millis(200)));
        let (store, refresher) = refresher(slow, Duration::from_millis(20));

        let err = refresher.refresh_once().await.unwrap_err();
        assert!(matches!(err, ReferenceError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.snapshot().set.is_empty());
        assert!(store.last_refresh().is_none());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_loaded_roster() {
        let mut source = CountingSource::new(Duration::ZERO);
        source.fail = true;
        let source = Arc::new(source);
        let (store, refresher) = refresher(source, Duration::from_secs(5));
        store.install(vec![json!({"student_id": 99, "embedding": [0.0, 1.0]})]).unwrap();

        assert!(refresher.refresh_once().await.is_err());
        assert_eq!(store.snapshot().set.identity_count(), 1);
    }

    #[tokio::test]
    async fn test_initial_load_is_bounded() {
        let slow = Arc::new(CountingSource::new(Duration::from_millis(500)));
        let (store, refresher) = refresher(slow, Duration::from_secs(5));

        let started = std::time::Instant::now();
        assert!(refresher.load_initial(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(store.snapshot().set.is_empty());
    }

    #[tokio::test]
    async fn test_periodic_refresh_runs_and_stops() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let (store, refresher) = refresher(Arc::clone(&source), Duration::from_secs(5));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = Arc::clone(&refresher).spawn_periodic(Duration::from_millis(25), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(140)).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        let calls = source.calls.load(Ordering::SeqCst);
        assert!(calls >= 2, "only {calls} refreshes ran");
        assert!(store.last_refresh().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_periodic_skips_immediate_tick() {
        let source = Arc::new(CountingSource::new(Duration::ZERO));
        let (_store, refresher) = refresher(Arc::clone(&source), Duration::from_secs(5));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = Arc::clone(&refresher).spawn_periodic(Duration::from_secs(3600), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}

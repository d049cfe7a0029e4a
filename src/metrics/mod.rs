//! MetricsAggregator (spec.md §4.5): atomic per-minute counters rolled up to
//! hour/day resolution on a 60s cadence, retention-pruned in-memory deques,
//! persisted via Store. Grounded in the teacher's use of `tokio::sync`
//! primitives and a supervised scheduled task (spec.md §9 "Fire-and-forget
//! task submission" — the rollup loop logs and continues rather than
//! propagating a `?` that would kill the task).

use crate::model::MetricPoint;
use crate::store::Store;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 86_400_000;

const MINUTE_RETENTION: usize = 60;
const HOUR_RETENTION: usize = 24;
const DAY_RETENTION: usize = 30;

#[derive(Debug, Default)]
struct Counters {
    transfers: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    files: AtomicU64,
}

impl Counters {
    fn snapshot_and_reset(&self, timestamp_millis: i64) -> MetricPoint {
        MetricPoint {
            timestamp_millis,
            transfers: self.transfers.swap(0, Ordering::Relaxed),
            successful: self.successful.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            bytes: self.bytes.swap(0, Ordering::Relaxed),
            files: self.files.swap(0, Ordering::Relaxed),
        }
    }
}

fn floor_bucket(timestamp_millis: i64, bucket_width: i64) -> i64 {
    (timestamp_millis / bucket_width) * bucket_width
}

fn sum_points(points: &VecDeque<MetricPoint>, bucket_start: i64, bucket_width: i64) -> MetricPoint {
    let mut out = MetricPoint {
        timestamp_millis: bucket_start,
        transfers: 0,
        successful: 0,
        failed: 0,
        bytes: 0,
        files: 0,
    };
    for p in points {
        if p.timestamp_millis >= bucket_start && p.timestamp_millis < bucket_start + bucket_width {
            out.transfers += p.transfers;
            out.successful += p.successful;
            out.failed += p.failed;
            out.bytes += p.bytes;
            out.files += p.files;
        }
    }
    out
}

struct RouteState {
    counters: Counters,
    minute: RwLock<VecDeque<MetricPoint>>,
    hour: RwLock<VecDeque<MetricPoint>>,
    day: RwLock<VecDeque<MetricPoint>>,
    last_hour_bucket: AtomicI64,
    last_day_bucket: AtomicI64,
}

impl RouteState {
    fn new() -> Self {
        Self {
            counters: Counters::default(),
            minute: RwLock::new(VecDeque::new()),
            hour: RwLock::new(VecDeque::new()),
            day: RwLock::new(VecDeque::new()),
            last_hour_bucket: AtomicI64::new(-1),
            last_day_bucket: AtomicI64::new(-1),
        }
    }
}

pub struct MetricsAggregator {
    store: Arc<Store>,
    global: RouteState,
    routes: RwLock<HashMap<String, Arc<RouteState>>>,
}

impl MetricsAggregator {
    pub async fn new(store: Arc<Store>) -> Self {
        let agg = Self {
            store,
            global: RouteState::new(),
            routes: RwLock::new(HashMap::new()),
        };
        agg.hydrate().await;
        agg
    }

    async fn hydrate(&self) {
        if let Err(e) = self.hydrate_route(crate::store::GLOBAL_ROUTE, &self.global).await {
            error!("failed to hydrate global metrics: {e}");
        }
    }

    async fn hydrate_route(&self, ae_title: &str, state: &RouteState) -> Result<(), crate::store::StoreError> {
        let minute = self.store.get_minute_metrics(ae_title, MINUTE_RETENTION as i64).await?;
        let hour = self.store.get_hour_metrics(ae_title, HOUR_RETENTION as i64).await?;
        let day = self.store.get_day_metrics(ae_title, DAY_RETENTION as i64).await?;
        if let Some(last) = hour.last() {
            state.last_hour_bucket.store(last.timestamp_millis, Ordering::Relaxed);
        }
        if let Some(last) = day.last() {
            state.last_day_bucket.store(last.timestamp_millis, Ordering::Relaxed);
        }
        *state.minute.write().await = minute.into();
        *state.hour.write().await = hour.into();
        *state.day.write().await = day.into();
        Ok(())
    }

    async fn route_state(&self, ae_title: &str) -> Arc<RouteState> {
        if let Some(s) = self.routes.read().await.get(ae_title) {
            return s.clone();
        }
        let mut write = self.routes.write().await;
        if let Some(s) = write.get(ae_title) {
            return s.clone();
        }
        let state = Arc::new(RouteState::new());
        write.insert(ae_title.to_string(), state.clone());
        state
    }

    pub async fn record_transfer_received(&self, ae_title: &str) {
        self.global.counters.transfers.fetch_add(1, Ordering::Relaxed);
        self.route_state(ae_title)
            .await
            .counters
            .transfers
            .fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_transfer_success(&self, ae_title: &str, bytes: u64, files: u64) {
        self.global.counters.successful.fetch_add(1, Ordering::Relaxed);
        self.global.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.global.counters.files.fetch_add(files, Ordering::Relaxed);
        let route = self.route_state(ae_title).await;
        route.counters.successful.fetch_add(1, Ordering::Relaxed);
        route.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        route.counters.files.fetch_add(files, Ordering::Relaxed);
        if let Err(e) = self.store.update_route_stats(ae_title, true, bytes, files).await {
            error!("failed to persist route stats for {ae_title}: {e}");
        }
    }

    pub async fn record_transfer_failed(&self, ae_title: &str) {
        self.global.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.route_state(ae_title)
            .await
            .counters
            .failed
            .fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.store.update_route_stats(ae_title, false, 0, 0).await {
            error!("failed to persist route stats for {ae_title}: {e}");
        }
    }

    /// Rolls the current minute counters into a `MetricPoint`, detects hour/
    /// day boundary crossings, and prunes retention. Intended to be driven by
    /// a 60s `tokio::time::interval`; never panics or propagates — any
    /// backend failure is logged and the in-memory state is still advanced so
    /// subsequent ticks are unaffected.
    pub async fn roll_minute(&self, now_millis: i64) {
        self.roll_route(crate::store::GLOBAL_ROUTE, &self.global, now_millis).await;
        let routes: Vec<(String, Arc<RouteState>)> = self
            .routes
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (ae_title, state) in routes {
            self.roll_route(&ae_title, &state, now_millis).await;
        }
    }

    async fn roll_route(&self, ae_title: &str, state: &RouteState, now_millis: i64) {
        let minute_bucket = floor_bucket(now_millis - MINUTE_MS, MINUTE_MS);
        let point = state.counters.snapshot_and_reset(minute_bucket);

        {
            let mut deque = state.minute.write().await;
            deque.push_back(point);
            while deque.len() > MINUTE_RETENTION {
                deque.pop_front();
            }
        }
        if let Err(e) = self.store.record_minute_metric(ae_title, &point).await {
            error!("failed to persist minute metric for {ae_title}: {e}");
        }

        let hour_bucket = floor_bucket(minute_bucket, HOUR_MS);
        let prev_hour = state.last_hour_bucket.swap(hour_bucket, Ordering::Relaxed);
        if prev_hour != -1 && prev_hour != hour_bucket {
            let hour_point = {
                let deque = state.minute.read().await;
                sum_points(&deque, prev_hour, HOUR_MS)
            };
            {
                let mut deque = state.hour.write().await;
                deque.push_back(hour_point);
                while deque.len() > HOUR_RETENTION {
                    deque.pop_front();
                }
            }
            if let Err(e) = self.store.record_hour_metric(ae_title, &hour_point).await {
                error!("failed to persist hour metric for {ae_title}: {e}");
            }

            let day_bucket = floor_bucket(prev_hour, DAY_MS);
            let prev_day = state.last_day_bucket.swap(day_bucket, Ordering::Relaxed);
            if prev_day != -1 && prev_day != day_bucket {
                let day_point = {
                    let deque = state.hour.read().await;
                    sum_points(&deque, prev_day, DAY_MS)
                };
                {
                    let mut deque = state.day.write().await;
                    deque.push_back(day_point);
                    while deque.len() > DAY_RETENTION {
                        deque.pop_front();
                    }
                }
                if let Err(e) = self.store.record_day_metric(ae_title, &day_point).await {
                    error!("failed to persist day metric for {ae_title}: {e}");
                }
            }
        }
    }

    /// Spawns the supervised 60s rollup loop plus the retention-cleanup pass.
    /// A logged failure never kills the loop (spec.md §9).
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let now = chrono::Utc::now().timestamp_millis();
                self.roll_minute(now).await;
                if let Err(e) = self.cleanup_old_metrics(now).await {
                    error!("metrics cleanup failed: {e}");
                }
            }
        })
    }

    pub async fn cleanup_old_metrics(&self, now_millis: i64) -> Result<(), crate::store::StoreError> {
        let minute_cutoff = now_millis - MINUTE_RETENTION as i64 * MINUTE_MS;
        let hour_cutoff = now_millis - HOUR_RETENTION as i64 * HOUR_MS;
        let day_cutoff = now_millis - DAY_RETENTION as i64 * DAY_MS;
        self.store
            .cleanup_old_metrics(minute_cutoff, hour_cutoff, day_cutoff)
            .await
    }

    pub async fn minute_points(&self, ae_title: Option<&str>) -> Vec<MetricPoint> {
        let state = match ae_title {
            Some(a) => self.route_state(a).await,
            None => return self.global.minute.read().await.iter().copied().collect(),
        };
        state.minute.read().await.iter().copied().collect()
    }

    pub async fn hour_points(&self, ae_title: Option<&str>) -> Vec<MetricPoint> {
        let state = match ae_title {
            Some(a) => self.route_state(a).await,
            None => return self.global.hour.read().await.iter().copied().collect(),
        };
        state.hour.read().await.iter().copied().collect()
    }

    pub async fn day_points(&self, ae_title: Option<&str>) -> Vec<MetricPoint> {
        let state = match ae_title {
            Some(a) => self.route_state(a).await,
            None => return self.global.day.read().await.iter().copied().collect(),
        };
        state.day.read().await.iter().copied().collect()
    }

    /// Transfers per minute, averaged over the last 5 minute buckets.
    pub async fn current_throughput(&self, ae_title: Option<&str>) -> f64 {
        let points = self.minute_points(ae_title).await;
        let last5: Vec<_> = points.iter().rev().take(5).collect();
        if last5.is_empty() {
            return 0.0;
        }
        last5.iter().map(|p| p.transfers as f64).sum::<f64>() / last5.len() as f64
    }

    /// Bytes per minute, averaged over the last 5 minute buckets.
    pub async fn current_bytes_per_minute(&self, ae_title: Option<&str>) -> f64 {
        let points = self.minute_points(ae_title).await;
        let last5: Vec<_> = points.iter().rev().take(5).collect();
        if last5.is_empty() {
            return 0.0;
        }
        last5.iter().map(|p| p.bytes as f64).sum::<f64>() / last5.len() as f64
    }

    pub async fn route_summaries(&self) -> Result<Vec<crate::model::RouteStats>, crate::store::StoreError> {
        self.store.get_all_route_stats().await
    }
}

impl std::fmt::Debug for MetricsAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsAggregator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        std::mem::forget(dir);
        Arc::new(Store::open(&path).await.unwrap())
    }

    #[tokio::test]
    async fn rollup_emits_zeroed_point_when_idle() {
        let store = test_store().await;
        let agg = MetricsAggregator::new(store).await;
        agg.roll_minute(120_000).await;
        let points = agg.minute_points(None).await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].transfers, 0);
        assert_eq!(points[0].timestamp_millis % MINUTE_MS, 0);
    }

    #[tokio::test]
    async fn rollup_sums_recorded_activity() {
        let store = test_store().await;
        let agg = MetricsAggregator::new(store).await;
        for _ in 0..3 {
            agg.record_transfer_received("RTE_A").await;
            agg.record_transfer_success("RTE_A", 1000, 1).await;
        }
        agg.record_transfer_received("RTE_A").await;
        agg.record_transfer_failed("RTE_A").await;

        agg.roll_minute(2 * MINUTE_MS).await;
        let points = agg.minute_points(None).await;
        let last = points.last().unwrap();
        assert_eq!(last.transfers, 4);
        assert_eq!(last.successful, 3);
        assert_eq!(last.failed, 1);
        assert_eq!(last.bytes, 3000);
        assert_eq!(last.timestamp_millis, MINUTE_MS);
    }
}

use super::dispatcher::merge_point;
use super::merger::BatchMerger;
use super::types::Sample;
use crate::points::{MetricSource, Point, PointDirectory, UpstreamError};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub points_seen: usize,
    pub points_merged: usize,
    pub points_skipped: usize,
    pub samples: usize,
    pub merges_failed: usize,
}

/// Backfill pass: re-feeds historical metrics of every known point through
/// the weekday merge path, one point at a time.
pub struct CatchUpScanner {
    directory: Arc<dyn PointDirectory>,
    source: Arc<dyn MetricSource>,
    merger: BatchMerger,
    page_size: u32,
    request_timeout: Duration,
}

impl CatchUpScanner {
    pub fn new(
        directory: Arc<dyn PointDirectory>,
        source: Arc<dyn MetricSource>,
        merger: BatchMerger,
        page_size: u32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            source,
            merger,
            page_size: page_size.max(1),
            request_timeout,
        }
    }

    /// Scans every point from `offset` up to now. A point whose metric fetch
    /// fails or times out is skipped; a failed directory page ends the scan.
    pub async fn run_from(
        &self,
        offset: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, UpstreamError> {
        let started = Instant::now();
        let to = Utc::now();
        let mut summary = ScanSummary::default();
        let mut page_offset = 0u32;

        tracing::info!(from = %offset, to = %to, "starting catch-up scan");

        loop {
            if cancel.is_cancelled() {
                tracing::info!("catch-up scan cancelled");
                break;
            }
            let page = self
                .with_timeout(self.directory.list_points(self.page_size, page_offset))
                .await?;
            let fetched = page.len();

            for point in page {
                if cancel.is_cancelled() {
                    break;
                }
                self.scan_point(&point, offset, to, cancel, &mut summary)
                    .await;
            }

            if fetched < self.page_size as usize {
                break;
            }
            page_offset = page_offset.saturating_add(self.page_size);
        }

        tracing::info!(
            points = summary.points_seen,
            merged = summary.points_merged,
            skipped = summary.points_skipped,
            samples = summary.samples,
            failed_merges = summary.merges_failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "catch-up scan finished"
        );
        Ok(summary)
    }

    /// Single-point variant; the point must exist in the directory.
    pub async fn run_point_from(
        &self,
        point_id: u32,
        offset: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, UpstreamError> {
        let point = self
            .with_timeout(self.directory.get_point(point_id))
            .await?
            .ok_or(UpstreamError::UnknownPoint(point_id))?;
        let mut summary = ScanSummary::default();
        self.scan_point(&point, offset, Utc::now(), cancel, &mut summary)
            .await;
        Ok(summary)
    }

    async fn scan_point(
        &self,
        point: &Point,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
        summary: &mut ScanSummary,
    ) {
        summary.points_seen += 1;

        let metrics = match self
            .with_timeout(self.source.select_metrics(point.id, from, to))
            .await
        {
            Ok(metrics) => metrics,
            Err(err) => {
                tracing::warn!(point_id = point.id, point = %point.name, error = %err, "skipping point; metric fetch failed");
                summary.points_skipped += 1;
                return;
            }
        };

        let samples: Vec<Sample> = metrics
            .into_iter()
            .filter(|metric| metric.point_id == point.id && metric.value.is_finite())
            .map(|metric| Sample {
                value: metric.value,
                timestamp: metric.timestamp,
            })
            .collect();
        if samples.is_empty() {
            return;
        }

        let outcome = merge_point(&self.merger, point.id, samples, cancel).await;
        summary.samples += outcome.samples;
        summary.merges_failed += outcome.failed;
        if outcome.merged > 0 {
            summary.points_merged += 1;
        }
    }

    async fn with_timeout<T>(
        &self,
        request: impl Future<Output = Result<T, UpstreamError>>,
    ) -> Result<T, UpstreamError> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| UpstreamError::Timeout(self.request_timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::memory::MemoryAggregateStore;
    use crate::telemetry::Metric;
    use async_trait::async_trait;
    use chrono::{TimeZone, Weekday};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    struct FakePoints {
        points: Vec<Point>,
        failing: HashSet<u32>,
        slow: HashSet<u32>,
        pages: Mutex<Vec<(u32, u32)>>,
    }

    impl FakePoints {
        fn new(count: u32) -> Self {
            Self {
                points: (1..=count)
                    .map(|id| Point {
                        id,
                        name: format!("point-{id}"),
                    })
                    .collect(),
                failing: HashSet::new(),
                slow: HashSet::new(),
                pages: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PointDirectory for FakePoints {
        async fn list_points(&self, limit: u32, offset: u32) -> Result<Vec<Point>, UpstreamError> {
            self.pages.lock().unwrap().push((limit, offset));
            Ok(self
                .points
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn get_point(&self, id: u32) -> Result<Option<Point>, UpstreamError> {
            Ok(self.points.iter().find(|point| point.id == id).cloned())
        }
    }

    #[async_trait]
    impl MetricSource for FakePoints {
        async fn select_metrics(
            &self,
            point_id: u32,
            from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<Metric>, UpstreamError> {
            if self.failing.contains(&point_id) {
                return Err(tonic::Status::unavailable("metric store offline").into());
            }
            if self.slow.contains(&point_id) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            let history = [
                (at(1, 1), 1.0),
                (at(1, 2), 3.0),
                (at(2, 1), 5.0),
                (at(3, 1), 7.0),
            ];
            Ok(history
                .iter()
                .filter(|(timestamp, _)| *timestamp >= from)
                .map(|(timestamp, value)| Metric {
                    point_id,
                    timestamp: *timestamp,
                    value: *value * point_id as f64,
                })
                .collect())
        }
    }

    fn scanner(points: Arc<FakePoints>, store: Arc<MemoryAggregateStore>, page: u32) -> CatchUpScanner {
        CatchUpScanner::new(
            points.clone(),
            points,
            BatchMerger::new(store),
            page,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn scan_pages_through_every_point() {
        let points = Arc::new(FakePoints::new(5));
        let store = Arc::new(MemoryAggregateStore::new());
        let summary = scanner(points.clone(), store.clone(), 2)
            .run_from(at(1, 0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.points_seen, 5);
        assert_eq!(summary.points_merged, 5);
        assert_eq!(summary.samples, 20);
        assert_eq!(summary.merges_failed, 0);
        assert_eq!(*points.pages.lock().unwrap(), vec![(2, 0), (2, 2), (2, 4)]);

        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 15);
        let monday = rows
            .iter()
            .find(|row| row.point_id == 2 && row.day_of_week == Weekday::Mon)
            .unwrap();
        assert_eq!(monday.count, 2);
        assert_eq!(monday.sum, Some(8.0));
        assert_eq!(monday.min, Some(2.0));
        assert_eq!(monday.max, Some(6.0));
    }

    #[tokio::test]
    async fn offset_limits_history() {
        let points = Arc::new(FakePoints::new(1));
        let store = Arc::new(MemoryAggregateStore::new());
        let summary = scanner(points, store.clone(), 10)
            .run_from(at(2, 0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.samples, 2);
        let days: Vec<Weekday> = store
            .snapshot()
            .await
            .iter()
            .map(|row| row.day_of_week)
            .collect();
        assert_eq!(days, vec![Weekday::Tue, Weekday::Wed]);
    }

    #[tokio::test]
    async fn failing_and_slow_points_are_skipped() {
        let mut fake = FakePoints::new(4);
        fake.failing.insert(2);
        fake.slow.insert(3);
        let points = Arc::new(fake);
        let store = Arc::new(MemoryAggregateStore::new());

        let summary = scanner(points, store.clone(), 1000)
            .run_from(at(1, 0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.points_seen, 4);
        assert_eq!(summary.points_skipped, 2);
        assert_eq!(summary.points_merged, 2);
        let touched: HashSet<u32> = store
            .snapshot()
            .await
            .iter()
            .map(|row| row.point_id)
            .collect();
        assert_eq!(touched, HashSet::from([1, 4]));
    }

    #[tokio::test]
    async fn single_point_scan_validates_point() {
        let points = Arc::new(FakePoints::new(3));
        let store = Arc::new(MemoryAggregateStore::new());
        let scanner = scanner(points, store.clone(), 10);

        let summary = scanner
            .run_point_from(3, at(1, 0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.points_merged, 1);
        assert_eq!(store.snapshot().await.len(), 3);

        let err = scanner
            .run_point_from(99, at(1, 0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::UnknownPoint(99)));
    }

    #[tokio::test]
    async fn cancelled_scan_stops_before_listing() {
        let points = Arc::new(FakePoints::new(3));
        let store = Arc::new(MemoryAggregateStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = scanner(points.clone(), store.clone(), 10)
            .run_from(at(1, 0), &cancel)
            .await
            .unwrap();

        assert_eq!(summary, ScanSummary::default());
        assert!(points.pages.lock().unwrap().is_empty());
        assert!(store.snapshot().await.is_empty());
    }
}

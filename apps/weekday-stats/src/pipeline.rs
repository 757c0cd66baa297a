use crate::context::AppContext;
use crate::telemetry::Metric;
use anyhow::Result;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum BatchCommand {
    Metric(Metric),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<BatchCommand>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<BatchCommand>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn enqueue(&self, metric: Metric) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, point_id = metric.point_id, "queued metric");
        if let Err(err) = self.tx.send(BatchCommand::Metric(metric)).await {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(err.into());
        }
        Ok(())
    }

    /// Waits until everything queued before this call has been dispatched.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(BatchCommand::Flush(tx)).await?;
        rx.await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_dispatch_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_dispatch_micros: AtomicU64,
    pub inflight_dispatches: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

pub fn spawn_worker(
    ctx: AppContext,
    mut rx: mpsc::Receiver<BatchCommand>,
    stats: Arc<IngestStats>,
    batch_size: usize,
    flush_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let batch_size = batch_size.max(1);
        let mut buffer: Vec<Metric> = Vec::with_capacity(batch_size);
        // First tick one full period out; the buffer is empty at start.
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    dispatch(&ctx, &mut buffer, &stats).await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(BatchCommand::Metric(metric)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(metric);
                            if buffer.len() >= batch_size {
                                dispatch(&ctx, &mut buffer, &stats).await;
                            }
                        }
                        Some(BatchCommand::Flush(done)) => {
                            dispatch(&ctx, &mut buffer, &stats).await;
                            let _ = done.send(());
                        }
                        None => {
                            dispatch(&ctx, &mut buffer, &stats).await;
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("pipeline worker stopped");
    })
}

/// Hands the buffered batch to the engine. A failed batch is not re-queued:
/// some of its keys may already be merged, and merging is not idempotent.
async fn dispatch(ctx: &AppContext, buffer: &mut Vec<Metric>, stats: &IngestStats) {
    if buffer.is_empty() {
        return;
    }

    let started = Instant::now();
    stats.inflight_dispatches.fetch_add(1, Ordering::Relaxed);
    let items = std::mem::take(buffer);
    let len = items.len();

    let result = ctx.process(items).await;
    stats.inflight_dispatches.fetch_sub(1, Ordering::Relaxed);
    stats.last_batch_len.store(len as u64, Ordering::Relaxed);
    stats
        .last_dispatch_unix_ms
        .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::Relaxed);

    match result {
        Ok(summary) => {
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_dispatch_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_dispatch_micros.store(avg, Ordering::Relaxed);
            stats.clear_error();
            tracing::debug!(
                len,
                micros,
                points = summary.points,
                merges = summary.merges,
                "dispatched metrics batch"
            );
        }
        Err(err) => {
            stats.record_error(err.to_string());
            tracing::warn!(len, error = %err, "metrics batch dispatch failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::memory::MemoryAggregateStore;
    use crate::aggregate::AggregateStore;
    use crate::context::EngineSettings;
    use crate::points::{MetricSource, Point, PointDirectory, UpstreamError};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Weekday};
    use tokio_util::sync::CancellationToken;

    struct NoPoints;

    #[async_trait]
    impl PointDirectory for NoPoints {
        async fn list_points(&self, _limit: u32, _offset: u32) -> Result<Vec<Point>, UpstreamError> {
            Ok(Vec::new())
        }

        async fn get_point(&self, _id: u32) -> Result<Option<Point>, UpstreamError> {
            Ok(None)
        }
    }

    #[async_trait]
    impl MetricSource for NoPoints {
        async fn select_metrics(
            &self,
            _point_id: u32,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<Metric>, UpstreamError> {
            Ok(Vec::new())
        }
    }

    fn start(
        store: Arc<MemoryAggregateStore>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> (PipelineHandle, JoinHandle<()>) {
        let ctx = AppContext::new(
            store,
            Arc::new(NoPoints),
            Arc::new(NoPoints),
            &EngineSettings {
                max_concurrent_points: 2,
                catchup_page_size: 100,
                catchup_timeout: Duration::from_secs(1),
            },
            CancellationToken::new(),
        );
        let stats = Arc::new(IngestStats::new());
        let (tx, rx) = mpsc::channel(16);
        let worker = spawn_worker(ctx, rx, stats.clone(), batch_size, flush_interval);
        (PipelineHandle::new(tx, stats), worker)
    }

    fn metric(point_id: u32, value: f64) -> Metric {
        Metric {
            point_id,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            value,
        }
    }

    #[tokio::test]
    async fn flush_dispatches_partial_batch() {
        let store = Arc::new(MemoryAggregateStore::new());
        let (pipeline, _worker) = start(store.clone(), 100, Duration::from_secs(3600));

        pipeline.enqueue(metric(1, 2.0)).await.unwrap();
        pipeline.enqueue(metric(1, 4.0)).await.unwrap();
        pipeline.flush().await.unwrap();

        let aggregate = store.get(1, Weekday::Mon).await.unwrap().unwrap();
        assert_eq!(aggregate.count, 2);
        assert_eq!(aggregate.evaluations, 1);

        let stats = pipeline.stats();
        assert_eq!(stats.queue_depth.load(Ordering::Relaxed), 0);
        assert_eq!(stats.last_batch_len.load(Ordering::Relaxed), 2);
        assert!(stats.last_error().is_none());
    }

    #[tokio::test]
    async fn full_batch_dispatches_without_flush() {
        let store = Arc::new(MemoryAggregateStore::new());
        let (pipeline, _worker) = start(store.clone(), 2, Duration::from_secs(3600));

        pipeline.enqueue(metric(1, 2.0)).await.unwrap();
        pipeline.enqueue(metric(2, 4.0)).await.unwrap();
        pipeline.enqueue(metric(3, 6.0)).await.unwrap();
        // The flush marker is handled after the first two metrics were dispatched.
        pipeline.flush().await.unwrap();

        let rows = store.snapshot().await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.evaluations == 1));
        assert_eq!(pipeline.stats().last_batch_len.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn closing_the_channel_drains_the_buffer() {
        let store = Arc::new(MemoryAggregateStore::new());
        let (pipeline, worker) = start(store.clone(), 100, Duration::from_secs(3600));

        pipeline.enqueue(metric(4, 1.0)).await.unwrap();
        drop(pipeline);
        worker.await.unwrap();

        assert_eq!(store.get(4, Weekday::Mon).await.unwrap().unwrap().count, 1);
    }
}

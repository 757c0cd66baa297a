use crate::aggregate::{
    AggregateStore, BatchMerger, CatchUpScanner, DispatchError, DispatchSummary, Dispatcher,
    ScanSummary, StoreError, WeekdayAggregate,
};
use crate::config::Config;
use crate::points::{MetricSource, PointDirectory, UpstreamError};
use crate::telemetry::Metric;
use chrono::{DateTime, Utc, Weekday};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "dow";
pub const PLUGIN_VERSION: &str = "v1.0";

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub max_concurrent_points: usize,
    pub catchup_page_size: u32,
    pub catchup_timeout: Duration,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_points: config.max_concurrent_points,
            catchup_page_size: config.catchup_page_size,
            catchup_timeout: config.catchup_timeout(),
        }
    }
}

/// Everything the engine needs, wired once at startup and shared by the
/// MQTT pipeline, the gRPC server and the startup catch-up.
#[derive(Clone)]
pub struct AppContext {
    store: Arc<dyn AggregateStore>,
    dispatcher: Dispatcher,
    scanner: Arc<CatchUpScanner>,
    shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        directory: Arc<dyn PointDirectory>,
        source: Arc<dyn MetricSource>,
        settings: &EngineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let merger = BatchMerger::new(store.clone());
        let dispatcher = Dispatcher::new(merger.clone(), settings.max_concurrent_points);
        let scanner = Arc::new(CatchUpScanner::new(
            directory,
            source,
            merger,
            settings.catchup_page_size,
            settings.catchup_timeout,
        ));
        Self {
            store,
            dispatcher,
            scanner,
            shutdown,
        }
    }

    pub fn name() -> String {
        format!("{PLUGIN_NAME}@{PLUGIN_VERSION}")
    }

    /// Per-event entry point: folds one batch of metrics into the weekday aggregates.
    pub async fn process(&self, metrics: Vec<Metric>) -> Result<DispatchSummary, DispatchError> {
        if metrics.is_empty() {
            tracing::info!("no metrics to process");
            return Ok(DispatchSummary::default());
        }

        let len = metrics.len();
        tracing::debug!(plugin = %Self::name(), len, "running");
        let started = Instant::now();

        match self.dispatcher.run(metrics, &self.shutdown).await {
            Ok(summary) => {
                tracing::info!(
                    "{}, processed [{}] in [{:?}]",
                    Self::name(),
                    len,
                    started.elapsed()
                );
                Ok(summary)
            }
            Err(err) => {
                tracing::error!(plugin = %Self::name(), error = %err, "failed to process metrics");
                Err(err)
            }
        }
    }

    pub async fn run_catch_up(
        &self,
        from: DateTime<Utc>,
        point_id: Option<u32>,
    ) -> Result<ScanSummary, UpstreamError> {
        match point_id {
            Some(point_id) => {
                self.scanner
                    .run_point_from(point_id, from, &self.shutdown)
                    .await
            }
            None => self.scanner.run_from(from, &self.shutdown).await,
        }
    }

    pub async fn aggregate(
        &self,
        point_id: u32,
        day_of_week: Weekday,
    ) -> Result<Option<WeekdayAggregate>, StoreError> {
        self.store.get(point_id, day_of_week).await
    }
}

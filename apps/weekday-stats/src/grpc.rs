use crate::aggregate::{weekday_from_index, weekday_index, ScanSummary, WeekdayAggregate};
use crate::context::AppContext;
use crate::pipeline::{IngestStats, PipelineHandle};
use crate::points::UpstreamError;
use crate::telemetry::Metric;
use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::atomic::Ordering;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("weekday_stats");
}

use proto::weekday_stats_server::{WeekdayStats, WeekdayStatsServer};
use proto::{
    Aggregate as RpcAggregate, CatchUpRequest, CatchUpResponse, GetAggregateRequest,
    GetAggregateResponse, HealthRequest, HealthResponse, Metric as RpcMetric, WriteBatchRequest,
    WriteBatchResponse,
};

#[derive(Clone)]
pub struct WeekdayStatsService {
    ctx: AppContext,
    pipeline: PipelineHandle,
}

impl WeekdayStatsService {
    pub fn new(ctx: AppContext, pipeline: PipelineHandle) -> Self {
        Self { ctx, pipeline }
    }

    fn map_metric(metric: RpcMetric) -> Result<Metric, Status> {
        let timestamp = Utc
            .timestamp_millis_opt(metric.timestamp_ms)
            .single()
            .ok_or_else(|| Status::invalid_argument("invalid timestamp"))?;
        if !metric.value.is_finite() {
            return Err(Status::invalid_argument(format!(
                "non-finite value for point {}",
                metric.point_id
            )));
        }

        Ok(Metric {
            point_id: metric.point_id,
            timestamp,
            value: metric.value,
        })
    }

    fn to_health(stats: &IngestStats) -> HealthResponse {
        HealthResponse {
            queue_depth: stats.queue_depth.load(Ordering::Relaxed),
            last_dispatch_unix_ms: stats.last_dispatch_unix_ms.load(Ordering::Relaxed),
            last_batch_len: stats.last_batch_len.load(Ordering::Relaxed),
            average_dispatch_ms: stats.average_dispatch_micros.load(Ordering::Relaxed) as f64
                / 1000.0,
            mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
            inflight_dispatches: stats.inflight_dispatches.load(Ordering::Relaxed),
            last_error: stats.last_error().unwrap_or_default(),
            build: format!("{} ({})", AppContext::name(), env!("CARGO_PKG_VERSION")),
        }
    }
}

fn map_aggregate(aggregate: WeekdayAggregate) -> RpcAggregate {
    RpcAggregate {
        id: aggregate.id,
        point_id: aggregate.point_id,
        day_of_week: weekday_index(aggregate.day_of_week) as u32,
        last_updated_ms: aggregate.last_updated.timestamp_millis(),
        start_ms: aggregate.start.map(|ts| ts.timestamp_millis()),
        end_ms: aggregate.end.map(|ts| ts.timestamp_millis()),
        evaluations: aggregate.evaluations,
        count: aggregate.count,
        sum: aggregate.sum,
        mean: aggregate.mean,
        std_dev: aggregate.std_dev,
        min: aggregate.min,
        max: aggregate.max,
    }
}

fn map_scan(summary: ScanSummary) -> CatchUpResponse {
    CatchUpResponse {
        points_seen: summary.points_seen as u64,
        points_merged: summary.points_merged as u64,
        points_skipped: summary.points_skipped as u64,
        samples: summary.samples as u64,
        merges_failed: summary.merges_failed as u64,
    }
}

fn upstream_status(err: UpstreamError) -> Status {
    match err {
        UpstreamError::UnknownPoint(id) => Status::not_found(format!("unknown point {id}")),
        UpstreamError::Timeout(_) => Status::deadline_exceeded(err.to_string()),
        UpstreamError::Status(status) => {
            Status::unavailable(format!("point service unavailable: {}", status.message()))
        }
    }
}

#[tonic::async_trait]
impl WeekdayStats for WeekdayStatsService {
    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(Self::to_health(&self.pipeline.stats())))
    }

    async fn push_metrics(
        &self,
        request: Request<WriteBatchRequest>,
    ) -> Result<Response<WriteBatchResponse>, Status> {
        let payload = request.into_inner();
        let metrics = payload
            .metrics
            .into_iter()
            .map(Self::map_metric)
            .collect::<Result<Vec<_>, _>>()?;

        let mut accepted = 0u64;
        for metric in metrics {
            self.pipeline
                .enqueue(metric)
                .await
                .map_err(|err| Status::unavailable(format!("failed to enqueue: {err}")))?;
            accepted += 1;
        }

        if payload.force_flush {
            self.pipeline
                .flush()
                .await
                .map_err(|err| Status::unavailable(format!("failed to flush: {err}")))?;
        }

        let stats = self.pipeline.stats();
        Ok(Response::new(WriteBatchResponse {
            accepted,
            queued: stats.queue_depth.load(Ordering::Relaxed),
            last_batch_len: stats.last_batch_len.load(Ordering::Relaxed),
        }))
    }

    async fn flush(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        self.pipeline
            .flush()
            .await
            .map_err(|err| Status::unavailable(format!("failed to flush: {err}")))?;
        Ok(Response::new(Self::to_health(&self.pipeline.stats())))
    }

    async fn run_catch_up(
        &self,
        request: Request<CatchUpRequest>,
    ) -> Result<Response<CatchUpResponse>, Status> {
        let payload = request.into_inner();
        let from = Utc
            .timestamp_millis_opt(payload.from_ms)
            .single()
            .ok_or_else(|| Status::invalid_argument("invalid from_ms"))?;

        let summary = self
            .ctx
            .run_catch_up(from, payload.point_id)
            .await
            .map_err(upstream_status)?;
        Ok(Response::new(map_scan(summary)))
    }

    async fn get_aggregate(
        &self,
        request: Request<GetAggregateRequest>,
    ) -> Result<Response<GetAggregateResponse>, Status> {
        let payload = request.into_inner();
        let day_of_week = weekday_from_index(payload.day_of_week as i64).ok_or_else(|| {
            Status::invalid_argument(format!(
                "day_of_week must be 0 (Monday) to 6 (Sunday), got {}",
                payload.day_of_week
            ))
        })?;

        let aggregate = self
            .ctx
            .aggregate(payload.point_id, day_of_week)
            .await
            .map_err(|err| Status::unavailable(err.to_string()))?;
        Ok(Response::new(GetAggregateResponse {
            aggregate: aggregate.map(map_aggregate),
        }))
    }
}

pub async fn serve_uds(
    socket_path: &str,
    service: WeekdayStatsService,
    shutdown: CancellationToken,
) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<WeekdayStatsServer<WeekdayStatsService>>()
        .await;

    let incoming = UnixListenerStream::new(uds);
    tracing::info!(socket = socket_path, "gRPC control plane listening");

    Server::builder()
        .add_service(health_service)
        .add_service(WeekdayStatsServer::new(service))
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
        .await?;

    Ok(())
}

use crate::telemetry::Metric;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

pub mod proto {
    tonic::include_proto!("sabal.points");
}

use proto::point_service_client::PointServiceClient;
use proto::{GetPointRequest, ListPointsRequest, SelectMetricsRequest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Point {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("point service request failed: {0}")]
    Status(#[from] tonic::Status),
    #[error("point service request timed out after {0:?}")]
    Timeout(Duration),
    #[error("point {0} is not known to the point service")]
    UnknownPoint(u32),
}

#[async_trait]
pub trait PointDirectory: Send + Sync {
    async fn list_points(&self, limit: u32, offset: u32) -> Result<Vec<Point>, UpstreamError>;

    async fn get_point(&self, id: u32) -> Result<Option<Point>, UpstreamError>;
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Metrics for `point_id` in `[from, to]`, oldest first.
    async fn select_metrics(
        &self,
        point_id: u32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Metric>, UpstreamError>;
}

/// gRPC client for the remote point service, which serves both the point
/// directory and historical metrics.
#[derive(Clone)]
pub struct RemotePointService {
    client: PointServiceClient<Channel>,
}

impl RemotePointService {
    pub fn connect_lazy(url: &str, timeout: Duration) -> Result<Self> {
        let channel = Endpoint::from_shared(url.to_string())
            .with_context(|| format!("invalid point service url {url}"))?
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self {
            client: PointServiceClient::new(channel),
        })
    }
}

fn map_point(point: proto::Point) -> Point {
    Point {
        id: point.id,
        name: point.name,
    }
}

#[async_trait]
impl PointDirectory for RemotePointService {
    async fn list_points(&self, limit: u32, offset: u32) -> Result<Vec<Point>, UpstreamError> {
        let mut client = self.client.clone();
        let response = client
            .list_points(ListPointsRequest { limit, offset })
            .await?
            .into_inner();
        Ok(response.points.into_iter().map(map_point).collect())
    }

    async fn get_point(&self, id: u32) -> Result<Option<Point>, UpstreamError> {
        let mut client = self.client.clone();
        match client.get_point(GetPointRequest { id }).await {
            Ok(response) => Ok(response.into_inner().point.map(map_point)),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(status.into()),
        }
    }
}

#[async_trait]
impl MetricSource for RemotePointService {
    async fn select_metrics(
        &self,
        point_id: u32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Metric>, UpstreamError> {
        let mut client = self.client.clone();
        let response = client
            .select_metrics(SelectMetricsRequest {
                point_id,
                from_ms: from.timestamp_millis(),
                to_ms: to.timestamp_millis(),
            })
            .await?
            .into_inner();

        let metrics = response
            .metrics
            .into_iter()
            .filter_map(|metric| {
                let Some(timestamp) = Utc.timestamp_millis_opt(metric.timestamp_ms).single() else {
                    tracing::warn!(
                        point_id,
                        timestamp_ms = metric.timestamp_ms,
                        "dropping historical metric with invalid timestamp"
                    );
                    return None;
                };
                Some(Metric {
                    point_id: metric.point_id,
                    timestamp,
                    value: metric.value,
                })
            })
            .collect();
        Ok(metrics)
    }
}

mod aggregate;
mod config;
mod context;
mod grpc;
mod mqtt;
mod pipeline;
mod points;
mod telemetry;

use crate::aggregate::{build_pool, PgAggregateStore};
use crate::config::Config;
use crate::context::{AppContext, EngineSettings};
use crate::grpc::{serve_uds, WeekdayStatsService};
use crate::pipeline::{spawn_worker, BatchCommand, IngestStats, PipelineHandle};
use crate::points::RemotePointService;
use anyhow::{Context, Result};
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,weekday_stats=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "weekday-stats"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    tracing::info!(plugin = %AppContext::name(), "starting weekday-stats");

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = PgAggregateStore::new(pool);
    store.ensure_schema().await?;

    let points = Arc::new(
        RemotePointService::connect_lazy(&config.point_service_url, config.catchup_timeout())
            .context("failed to configure point service client")?,
    );

    let shutdown = CancellationToken::new();
    let ctx = AppContext::new(
        Arc::new(store),
        points.clone(),
        points,
        &EngineSettings::from(&config),
        shutdown.clone(),
    );

    let stats = Arc::new(IngestStats::new());
    let (tx, rx) = mpsc::channel::<BatchCommand>(config.max_queue.max(1));
    let pipeline = PipelineHandle::new(tx, stats.clone());
    let worker_handle = spawn_worker(
        ctx.clone(),
        rx,
        stats,
        config.batch_size,
        config.flush_interval(),
    );

    let grpc_service = WeekdayStatsService::new(ctx.clone(), pipeline.clone());
    let grpc_path = config.grpc_socket_path.clone();
    let grpc_shutdown = shutdown.clone();
    let grpc_handle =
        tokio::spawn(async move { serve_uds(&grpc_path, grpc_service, grpc_shutdown).await });

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let pipeline_clone = pipeline.clone();
        let mqtt_shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, pipeline_clone, mqtt_shutdown).await
        }))
    } else {
        None
    };

    let catch_up_handle = config.catchup_from.map(|from| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match ctx.run_catch_up(from, None).await {
                Ok(summary) => tracing::info!(
                    points = summary.points_seen,
                    merged = summary.points_merged,
                    skipped = summary.points_skipped,
                    "startup catch-up finished"
                ),
                Err(err) => tracing::error!(error=%err, "startup catch-up failed"),
            }
        })
    });

    tokio::select! {
        res = grpc_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "gRPC server exited"),
                Err(err) => tracing::error!(error=%err, "gRPC task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = async {
            if let Some(handle) = mqtt_handle {
                match handle.await {
                    Ok(Err(err)) => tracing::warn!(error=%err, "MQTT listener exited"),
                    Err(err) => tracing::warn!(error=%err, "MQTT task failed"),
                    Ok(Ok(())) => {}
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Drain buffered metrics before cancelling, otherwise the final batch
    // would be dropped as a cancelled dispatch.
    if let Err(err) = pipeline.flush().await {
        tracing::warn!(error=%err, "final flush failed");
    }
    shutdown.cancel();
    drop(pipeline);
    if let Some(handle) = catch_up_handle {
        let _ = handle.await;
    }
    if tokio::time::timeout(Duration::from_secs(5), worker_handle)
        .await
        .is_err()
    {
        tracing::warn!("pipeline worker did not stop in time");
    }
    tracing::info!(plugin = %AppContext::name(), "stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}

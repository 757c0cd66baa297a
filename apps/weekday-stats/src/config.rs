use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_POINT_SERVICE_URL: &str = "http://127.0.0.1:50051";
const DEFAULT_GRPC_SOCKET: &str = "/tmp/weekday_stats.sock";

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|value| value.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_value(key).map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

fn setup_config_path() -> Option<PathBuf> {
    env_value("DOW_SETUP_CONFIG_PATH").map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    point_service_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    dow_mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    dow_enable_mqtt_listener: Option<bool>,
    #[serde(default)]
    dow_batch_size: Option<usize>,
    #[serde(default)]
    dow_flush_interval_ms: Option<u64>,
    #[serde(default)]
    dow_max_concurrent_points: Option<usize>,
    #[serde(default)]
    dow_catchup_page_size: Option<u32>,
    #[serde(default)]
    dow_catchup_timeout_ms: Option<u64>,
}

fn parse_setup_overrides(mut bytes: Vec<u8>) -> Result<SetupConfigOverrides> {
    simd_json::serde::from_slice(&mut bytes).context("invalid setup config json")
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "weekday-stats failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match parse_setup_overrides(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "weekday-stats failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Applies file overrides for every setting whose env variable is unset.
fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("DOW_POINT_SERVICE_URL") {
        if let Some(url) = non_empty(overrides.point_service_url.as_deref()) {
            config.point_service_url = url;
        }
    }
    if env_allows("DOW_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("DOW_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("DOW_MQTT_USERNAME") && overrides.mqtt_username.is_some() {
        config.mqtt_username = non_empty(overrides.mqtt_username.as_deref());
    }
    if env_allows("DOW_MQTT_PASSWORD") && overrides.mqtt_password.is_some() {
        config.mqtt_password = non_empty(overrides.mqtt_password.as_deref());
    }
    if env_allows("DOW_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = non_empty(overrides.dow_mqtt_topic_prefix.as_deref()) {
            config.mqtt_topic_prefix = prefix;
        }
    }
    if env_allows("DOW_ENABLE_MQTT") {
        if let Some(value) = overrides.dow_enable_mqtt_listener {
            config.enable_mqtt_listener = value;
        }
    }

    let mut batch_overridden = false;
    if env_allows("DOW_BATCH_SIZE") {
        if let Some(value) = overrides.dow_batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
            batch_overridden = true;
        }
    }
    if env_allows("DOW_MAX_QUEUE") && batch_overridden {
        config.max_queue = config.batch_size.saturating_mul(10);
    }
    if env_allows("DOW_FLUSH_INTERVAL_MS") {
        if let Some(value) = overrides.dow_flush_interval_ms.filter(|v| *v != 0) {
            config.flush_interval_ms = value;
        }
    }
    if env_allows("DOW_MAX_CONCURRENT_POINTS") {
        if let Some(value) = overrides.dow_max_concurrent_points.filter(|v| *v != 0) {
            config.max_concurrent_points = value;
        }
    }
    if env_allows("DOW_CATCHUP_PAGE_SIZE") {
        if let Some(value) = overrides.dow_catchup_page_size.filter(|v| *v != 0) {
            config.catchup_page_size = value;
        }
    }
    if env_allows("DOW_CATCHUP_TIMEOUT_MS") {
        if let Some(value) = overrides.dow_catchup_timeout_ms.filter(|v| *v != 0) {
            config.catchup_timeout_ms = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub point_service_url: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue: usize,
    pub grpc_socket_path: String,
    pub enable_mqtt_listener: bool,
    pub max_concurrent_points: usize,
    pub catchup_page_size: u32,
    pub catchup_timeout_ms: u64,
    pub catchup_from: Option<DateTime<Utc>>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = setup_config_path()
            .as_deref()
            .and_then(load_setup_config_overrides);

        let database_url = env_value("DOW_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| non_empty(ov.database_url.as_deref()))
            })
            .context("DOW_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let batch_size = env_parse::<usize>("DOW_BATCH_SIZE")
            .filter(|v| *v != 0)
            .unwrap_or(500);
        let catchup_from = match env_value("DOW_CATCHUP_FROM") {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("DOW_CATCHUP_FROM is not RFC3339: {raw}"))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("DOW_DB_POOL_SIZE").unwrap_or(10),
            point_service_url: env_value("DOW_POINT_SERVICE_URL")
                .unwrap_or_else(|| DEFAULT_POINT_SERVICE_URL.to_string()),
            mqtt_host: env_value("DOW_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: env_parse("DOW_MQTT_PORT").unwrap_or(1883),
            mqtt_username: env_value("DOW_MQTT_USERNAME"),
            mqtt_password: env_value("DOW_MQTT_PASSWORD"),
            mqtt_topic_prefix: env_value("DOW_MQTT_TOPIC_PREFIX")
                .unwrap_or_else(|| "iot".to_string()),
            mqtt_keepalive_secs: env_parse("DOW_MQTT_KEEPALIVE_SECS").unwrap_or(30),
            mqtt_client_id: env_value("DOW_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("weekday-stats-{}", std::process::id())),
            batch_size,
            flush_interval_ms: env_parse("DOW_FLUSH_INTERVAL_MS").unwrap_or(1000),
            max_queue: env_parse("DOW_MAX_QUEUE").unwrap_or(batch_size.saturating_mul(10)),
            grpc_socket_path: env_value("DOW_GRPC_SOCKET")
                .unwrap_or_else(|| DEFAULT_GRPC_SOCKET.to_string()),
            enable_mqtt_listener: env_flag("DOW_ENABLE_MQTT").unwrap_or(true),
            max_concurrent_points: env_parse("DOW_MAX_CONCURRENT_POINTS")
                .filter(|v| *v != 0)
                .unwrap_or_else(default_concurrency),
            catchup_page_size: env_parse("DOW_CATCHUP_PAGE_SIZE")
                .filter(|v| *v != 0)
                .unwrap_or(1000),
            catchup_timeout_ms: env_parse("DOW_CATCHUP_TIMEOUT_MS").unwrap_or(10_000),
            catchup_from,
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides, |key| env_value(key).is_none());
        }

        Ok(config)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn catchup_timeout(&self) -> Duration {
        Duration::from_millis(self.catchup_timeout_ms)
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

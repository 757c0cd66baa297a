use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

/// One measurement for a point, as delivered by MQTT, gRPC or the point service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    pub point_id: u32,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
struct BorrowedTelemetry<'a> {
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
    value: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            BorrowedTimestamp::Str(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            BorrowedTimestamp::Int(ms) => Utc.timestamp_millis_opt(*ms).single(),
            BorrowedTimestamp::Float(ts) => Utc.timestamp_millis_opt((*ts * 1000.0) as i64).single(),
        }
    }
}

/// Parses `{prefix}/{source}/{point_id}/telemetry` publishes.
///
/// Returns `Ok(None)` for topics that are not point telemetry and for
/// samples that cannot be folded into statistics. A missing or unreadable
/// timestamp falls back to the receive time.
pub fn parse_mqtt_payload(
    topic_prefix: &str,
    topic: &str,
    payload: &mut [u8],
    received_at: DateTime<Utc>,
) -> Result<Option<Metric>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != topic_prefix || parts[3] != "telemetry" {
        return Ok(None);
    }
    let Ok(point_id) = parts[2].parse::<u32>() else {
        tracing::debug!(topic, "ignoring telemetry for non-numeric point id");
        return Ok(None);
    };

    let telemetry: BorrowedTelemetry = simd_json::from_slice(payload)?;
    if !telemetry.value.is_finite() {
        return Ok(None);
    }

    let timestamp = telemetry
        .timestamp
        .as_ref()
        .and_then(|t| t.to_datetime())
        .unwrap_or(received_at);

    Ok(Some(Metric {
        point_id,
        timestamp,
        value: telemetry.value,
    }))
}

use crate::config::Config;
use crate::pipeline::PipelineHandle;
use crate::telemetry::parse_mqtt_payload;
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

fn telemetry_filter(prefix: &str) -> String {
    format!("{prefix}/+/+/telemetry")
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

/// Feeds live telemetry into the pipeline until `shutdown` fires,
/// reconnecting whenever the broker connection drops.
pub async fn run_listener(
    config: Config,
    pipeline: PipelineHandle,
    shutdown: CancellationToken,
) -> Result<()> {
    let filter = telemetry_filter(&config.mqtt_topic_prefix);
    let stats = pipeline.stats();

    while !shutdown.is_cancelled() {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 32);

        if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
            stats.set_mqtt_connected(false);
            sleep(RECONNECT_DELAY).await;
            continue;
        }

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    stats.set_mqtt_connected(false);
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::SubAck(_))) => {
                    tracing::info!(topic=%filter, "subscribed to telemetry feed");
                    stats.set_mqtt_connected(true);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let received_at = Utc::now();
                    let mut payload = publish.payload.to_vec();
                    match parse_mqtt_payload(
                        &config.mqtt_topic_prefix,
                        &publish.topic,
                        &mut payload,
                        received_at,
                    ) {
                        Ok(Some(metric)) => {
                            if let Err(err) = pipeline.enqueue(metric).await {
                                tracing::warn!(error=%err, "failed to enqueue MQTT metric");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::telemetry_filter;

    #[test]
    fn filter_matches_point_telemetry_topics() {
        assert_eq!(telemetry_filter("iot"), "iot/+/+/telemetry");
        assert_eq!(telemetry_filter("farm"), "farm/+/+/telemetry");
    }
}

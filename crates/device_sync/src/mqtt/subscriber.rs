use anyhow::anyhow;
use chrono::{DateTime, Utc};
use common::domain::{DomainError, DomainResult};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

use super::{decode_announcement, decode_telemetry, parse_topic, InboundTopic};
use super::{ANNOUNCE_TOPIC, TELEMETRY_TOPIC_FILTER};
use crate::domain::{DeviceSyncConfig, ReconcileOutcome, StateReconciler, TransportStatus};

const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Build the MQTT client and its event loop. Nothing connects until the
/// event loop is polled.
pub fn create_mqtt_transport(config: &DeviceSyncConfig) -> DomainResult<(AsyncClient, EventLoop)> {
    let (host, port) = parse_broker_url(&config.transport_address)?;

    let mut mqtt_options = MqttOptions::new(&config.mqtt_client_id, host, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
}

/// Drive the MQTT event loop, feeding announcements and telemetry to the reconciler
///
/// rumqttc reconnects on the next poll after a connection error, so the
/// loop backs off and polls again. Subscriptions are renewed on every
/// ConnAck because sessions are clean. Gives up after
/// `mqtt_max_retry_attempts` consecutive failures.
#[instrument(
    name = "mqtt_subscriber",
    skip_all,
    fields(transport_address = %config.transport_address)
)]
pub async fn run_mqtt_subscriber(
    client: AsyncClient,
    mut eventloop: EventLoop,
    reconciler: Arc<StateReconciler>,
    config: DeviceSyncConfig,
    status: TransportStatus,
    shutdown_token: CancellationToken,
) -> anyhow::Result<()> {
    info!("starting MQTT subscriber");
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                debug!("shutdown signal received");
                status.set_connected(false);
                let _ = client.try_disconnect();
                break;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Utc::now();
                        let reconciler = Arc::clone(&reconciler);
                        tokio::spawn(async move {
                            handle_mqtt_message(
                                &publish.topic,
                                &publish.payload,
                                received_at,
                                reconciler,
                            )
                            .await;
                        });
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                        status.set_connected(true);
                        failures = 0;
                        subscribe(&client);
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("broker sent disconnect");
                        status.set_connected(false);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        status.set_connected(false);
                        failures += 1;
                        error!(error = %e, "MQTT connection error");

                        if failures >= config.mqtt_max_retry_attempts {
                            error!(
                                max_retries = config.mqtt_max_retry_attempts,
                                "max retry attempts reached, stopping MQTT subscriber"
                            );
                            return Err(anyhow!(
                                "MQTT broker {} unreachable after {} attempts: {}",
                                config.transport_address,
                                failures,
                                e
                            ));
                        }

                        warn!(
                            attempt = failures,
                            max_attempts = config.mqtt_max_retry_attempts,
                            "retrying MQTT connection"
                        );

                        tokio::select! {
                            _ = shutdown_token.cancelled() => {
                                status.set_connected(false);
                                break;
                            }
                            _ = tokio::time::sleep(config.mqtt_retry_delay()) => {}
                        }
                    }
                }
            }
        }
    }

    info!("MQTT subscriber stopped");
    Ok(())
}

fn subscribe(client: &AsyncClient) {
    for topic in [ANNOUNCE_TOPIC, TELEMETRY_TOPIC_FILTER] {
        match client.try_subscribe(topic, QoS::AtLeastOnce) {
            Ok(()) => info!(topic = %topic, "subscribed to MQTT topic"),
            Err(e) => error!(topic = %topic, error = %e, "failed to subscribe"),
        }
    }
}

/// Handle one inbound message in its own trace
pub(crate) async fn handle_mqtt_message(
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
    reconciler: Arc<StateReconciler>,
) {
    let span = info_span!(
        parent: Span::none(),
        "mqtt_message",
        topic = %topic,
        payload_size = payload.len(),
        device_id = tracing::field::Empty,
    );

    async {
        let parsed = match parse_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "unexpected MQTT topic, skipping message");
                return;
            }
        };

        match parsed {
            InboundTopic::Announce => {
                let announcement = match decode_announcement(payload, received_at) {
                    Ok(announcement) => announcement,
                    Err(e) => {
                        warn!(error = %e, "invalid announcement, skipping message");
                        return;
                    }
                };
                Span::current().record("device_id", announcement.device_id.as_str());

                match reconciler.ingest_announcement(announcement).await {
                    Ok(observation) => debug!(created = observation.created, "announcement handled"),
                    Err(e) => error!(error = %e, "failed to handle announcement"),
                }
            }
            InboundTopic::Telemetry { device_id } => {
                Span::current().record("device_id", device_id.as_str());
                let telemetry = match decode_telemetry(&device_id, payload, received_at) {
                    Ok(telemetry) => telemetry,
                    Err(e) => {
                        warn!(error = %e, "invalid telemetry, skipping message");
                        return;
                    }
                };

                match reconciler.ingest_telemetry(telemetry).await {
                    Ok(ReconcileOutcome::Applied(applied)) => debug!(
                        changed = applied.changed,
                        sync_status = ?applied.sync_status,
                        "telemetry applied"
                    ),
                    Ok(outcome) => debug!(?outcome, "telemetry ignored"),
                    Err(e) => error!(error = %e, "failed to reconcile telemetry"),
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
pub fn parse_broker_url(url: &str) -> DomainResult<(&str, u16)> {
    let stripped = url.trim_start_matches("mqtt://").trim_start_matches("tcp://");

    match stripped.split(':').collect::<Vec<_>>().as_slice() {
        [host] if !host.is_empty() => Ok((*host, 1883)),
        [host, port] if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DomainError::InvalidTransportConfig(format!("Invalid port in broker URL: {}", port))
            })?;
            Ok((*host, port))
        }
        _ => Err(DomainError::InvalidTransportConfig(format!(
            "Invalid broker URL format: {}",
            url
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CommandStatusBook, CommandTimers, DeviceRegistry, FeedNotifier, InMemoryDeviceStore,
        MockFeedNotifier,
    };
    use common::domain::{DeviceRepository, DeviceStateStore};

    fn reconciler_over(store: Arc<InMemoryDeviceStore>) -> Arc<StateReconciler> {
        let mut notifier = MockFeedNotifier::new();
        notifier.expect_publish().returning(|_| ());
        let notifier: Arc<dyn FeedNotifier> = Arc::new(notifier);
        let registry = Arc::new(DeviceRegistry::new(
            store.clone(),
            notifier.clone(),
            Duration::from_secs(300),
        ));
        Arc::new(StateReconciler::new(
            store,
            registry,
            CommandTimers::new(),
            Arc::new(CommandStatusBook::new(notifier.clone())),
            notifier,
        ))
    }

    #[test]
    fn test_parse_broker_url_with_port() {
        let (host, port) = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_without_scheme() {
        let (host, port) = parse_broker_url("mosquitto:8883").unwrap();
        assert_eq!(host, "mosquitto");
        assert_eq!(port, 8883);
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        let (host, port) = parse_broker_url("tcp://broker.local").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_invalid() {
        assert!(matches!(
            parse_broker_url("mqtt://broker:notaport"),
            Err(DomainError::InvalidTransportConfig(_))
        ));
        assert!(parse_broker_url("mqtt://a:1:2").is_err());
        assert!(parse_broker_url("").is_err());
    }

    #[test]
    fn test_create_transport_rejects_bad_address() {
        let config = DeviceSyncConfig {
            transport_address: "mqtt://broker:99999".to_string(),
            ..Default::default()
        };
        assert!(create_mqtt_transport(&config).is_err());
    }

    fn unreachable_config(max_attempts: u32) -> DeviceSyncConfig {
        DeviceSyncConfig {
            transport_address: "mqtt://127.0.0.1:1".to_string(),
            mqtt_max_retry_attempts: max_attempts,
            mqtt_retry_delay_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_clears_connected_flag() {
        let config = unreachable_config(1);
        let (client, eventloop) = create_mqtt_transport(&config).unwrap();
        let status = TransportStatus::new();
        status.set_connected(true);

        let result = run_mqtt_subscriber(
            client,
            eventloop,
            reconciler_over(Arc::new(InMemoryDeviceStore::new())),
            config,
            status.clone(),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn test_shutdown_clears_connected_flag() {
        let config = unreachable_config(10);
        let (client, eventloop) = create_mqtt_transport(&config).unwrap();
        let status = TransportStatus::new();
        status.set_connected(true);
        let token = CancellationToken::new();
        token.cancel();

        let result = run_mqtt_subscriber(
            client,
            eventloop,
            reconciler_over(Arc::new(InMemoryDeviceStore::new())),
            config,
            status.clone(),
            token,
        )
        .await;

        assert!(result.is_ok());
        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn test_announcement_registers_device() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store.clone());

        handle_mqtt_message(
            "devices/announce",
            br#"{"device_id": "esp32-a", "type": "led_strip"}"#,
            Utc::now(),
            reconciler,
        )
        .await;

        let device = store.get_device("esp32-a").await.unwrap().unwrap();
        assert_eq!(device.device_type, "led_strip");
    }

    #[tokio::test]
    async fn test_telemetry_updates_state() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store.clone());

        handle_mqtt_message(
            "lights/esp32-a/state",
            br#"{"device_id": "esp32-a", "power": true, "effect": "fire", "timestamp": 1700000000000}"#,
            Utc::now(),
            reconciler,
        )
        .await;

        let state = store.get_device_state("esp32-a").await.unwrap().unwrap();
        assert!(state.power);
        assert_eq!(state.effect.as_str(), "fire");
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store.clone());

        handle_mqtt_message("lights/esp32-a/state", b"{", Utc::now(), reconciler.clone()).await;
        handle_mqtt_message("lights/esp32-a/set", b"{}", Utc::now(), reconciler).await;

        assert!(store.get_device("esp32-a").await.unwrap().is_none());
    }
}

mod config;

use common::domain::{DeviceRepository, DeviceStateStore};
use common::postgres::{PostgresClient, PostgresDeviceRepository, PostgresDeviceStateRepository};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use config::ServiceConfig;
use device_sync::mqtt::{create_mqtt_transport, MqttCommandPublisher};
use device_sync::{BroadcastNotifier, DeviceSync, DeviceSyncConfig, FeedEvent};
use goose::MigrationRunner;
use lumina_runner::Runner;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        mqtt_broker_url = %config.mqtt_broker_url,
        "Starting lumina-all-in-one service"
    );
    debug!("Configuration: {:?}", config);

    let sync_config = config.device_sync_config();
    let (devices, states) = match initialize_store(&sync_config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to initialize PostgreSQL: {:#}", e);
            std::process::exit(1);
        }
    };

    let (client, eventloop) = match create_mqtt_transport(&sync_config) {
        Ok(transport) => transport,
        Err(e) => {
            error!("Failed to configure MQTT transport: {}", e);
            std::process::exit(1);
        }
    };

    // One token for the runner and the command supervisors
    let shutdown_token = CancellationToken::new();
    let notifier = Arc::new(BroadcastNotifier::new(config.feed_capacity));
    let feed_events = notifier.subscribe();

    let device_sync = DeviceSync::new(
        sync_config,
        devices,
        states,
        Arc::new(MqttCommandPublisher::new(client.clone())),
        notifier,
        shutdown_token.clone(),
    );

    if let Err(e) = device_sync.start().await {
        error!("Failed to load device registry: {}", e);
        std::process::exit(1);
    }

    let runner = Runner::new()
        .with_cancellation_token(shutdown_token)
        .with_named_process(
            "mqtt_subscriber",
            device_sync.mqtt_subscriber_process(client, eventloop),
        )
        .with_named_process("liveness_monitor", device_sync.liveness_process())
        .with_named_process(
            "feed_logger",
            Box::new(move |ctx| Box::pin(run_feed_logger(feed_events, ctx))),
        )
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            shutdown_telemetry(telemetry_providers);
            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(config.shutdown_timeout_secs));

    runner.run().await;
}

async fn initialize_store(
    config: &DeviceSyncConfig,
) -> anyhow::Result<(Arc<dyn DeviceRepository>, Arc<dyn DeviceStateStore>)> {
    let postgres = &config.store_connection;

    info!("Running PostgreSQL migrations...");
    MigrationRunner::postgres(
        postgres.goose_binary_path.clone(),
        postgres.migrations_dir.clone(),
        postgres.dsn(),
    )
    .run_migrations()
    .await?;

    let client = PostgresClient::from_config(postgres)?;
    client.ping().await?;

    Ok((
        Arc::new(PostgresDeviceRepository::new(client.clone())),
        Arc::new(PostgresDeviceStateRepository::new(client)),
    ))
}

/// Mirrors the live feed into the log until shutdown
async fn run_feed_logger(
    mut events: Receiver<FeedEvent>,
    shutdown_token: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => info!(device_id = %event.device_id(), event = ?event, "feed event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "feed logger fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

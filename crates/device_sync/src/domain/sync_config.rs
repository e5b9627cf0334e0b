use common::postgres::PostgresConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of the synchronization core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSyncConfig {
    /// MQTT broker, `mqtt://host:port`, `tcp://host:port` or `host:port`
    pub transport_address: String,

    pub store_connection: PostgresConfig,

    /// Devices not heard from within this window are reported offline (default: 300 seconds)
    pub staleness_window_secs: u64,

    /// How long a command waits for confirming telemetry (default: 5 seconds)
    pub command_timeout_secs: u64,

    /// Automatic republishes before a command is failed (default: 1)
    pub retry_count: u32,

    /// MQTT client id; must be unique per broker
    pub mqtt_client_id: String,

    /// Delay between MQTT reconnect attempts (default: 5 seconds)
    pub mqtt_retry_delay_secs: u64,

    /// Consecutive failed MQTT connection attempts before giving up (default: 10)
    pub mqtt_max_retry_attempts: u32,

    /// How often liveness is re-evaluated (default: 30 seconds)
    pub liveness_sweep_interval_secs: u64,
}

impl Default for DeviceSyncConfig {
    fn default() -> Self {
        Self {
            transport_address: "mqtt://localhost:1883".to_string(),
            store_connection: PostgresConfig::default(),
            staleness_window_secs: 300,
            command_timeout_secs: 5,
            retry_count: 1,
            mqtt_client_id: "lumina-device-sync".to_string(),
            mqtt_retry_delay_secs: 5,
            mqtt_max_retry_attempts: 10,
            liveness_sweep_interval_secs: 30,
        }
    }
}

impl DeviceSyncConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn mqtt_retry_delay(&self) -> Duration {
        Duration::from_secs(self.mqtt_retry_delay_secs)
    }

    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_sweep_interval_secs)
    }
}

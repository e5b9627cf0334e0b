use common::garde::validate_struct;
use common::postgres::PostgresConfig;
use config::{Config, ConfigError, Environment};
use device_sync::DeviceSyncConfig;
use garde::Validate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Validate)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[garde(skip)]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // MQTT configuration
    /// Broker address, e.g. mqtt://localhost:1883
    #[garde(length(min = 1))]
    #[serde(default = "default_mqtt_broker_url")]
    pub mqtt_broker_url: String,

    #[garde(length(min = 1))]
    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    #[garde(skip)]
    #[serde(default = "default_mqtt_retry_delay_secs")]
    pub mqtt_retry_delay_secs: u64,

    #[garde(range(min = 1))]
    #[serde(default = "default_mqtt_max_retry_attempts")]
    pub mqtt_max_retry_attempts: u32,

    // Synchronization
    /// Devices silent for longer than this are offline
    #[garde(range(min = 1))]
    #[serde(default = "default_staleness_window_secs")]
    pub staleness_window_secs: u64,

    /// How long a command waits for a confirming echo
    #[garde(range(min = 1))]
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Republishes after the first timeout before a command fails
    #[garde(skip)]
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[garde(range(min = 1))]
    #[serde(default = "default_liveness_sweep_interval_secs")]
    pub liveness_sweep_interval_secs: u64,

    /// Buffered live feed events per subscriber
    #[garde(range(min = 1))]
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,

    // PostgreSQL configuration
    #[garde(skip)]
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[garde(range(min = 1))]
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[garde(skip)]
    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[garde(skip)]
    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[garde(skip)]
    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[garde(range(min = 1))]
    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    #[garde(skip)]
    #[serde(default = "default_postgres_migrations_dir")]
    pub postgres_migrations_dir: String,

    #[garde(skip)]
    #[serde(default = "default_postgres_goose_binary_path")]
    pub postgres_goose_binary_path: String,

    // OpenTelemetry configuration
    #[garde(skip)]
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[garde(skip)]
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    #[garde(skip)]
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    /// Seconds the shutdown closers may take
    #[garde(range(min = 1))]
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_mqtt_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_client_id() -> String {
    "lumina-device-sync".to_string()
}

fn default_mqtt_retry_delay_secs() -> u64 {
    5
}

fn default_mqtt_max_retry_attempts() -> u32 {
    10
}

fn default_staleness_window_secs() -> u64 {
    300
}

fn default_command_timeout_secs() -> u64 {
    5
}

fn default_retry_count() -> u32 {
    1
}

fn default_liveness_sweep_interval_secs() -> u64 {
    30
}

fn default_feed_capacity() -> usize {
    256
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "lumina".to_string()
}

fn default_postgres_username() -> String {
    "lumina".to_string()
}

fn default_postgres_password() -> String {
    "changeme".to_string()
}

fn default_postgres_max_pool_size() -> usize {
    10
}

fn default_postgres_migrations_dir() -> String {
    "crates/common/migrations/postgres".to_string()
}

fn default_postgres_goose_binary_path() -> String {
    "goose".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "lumina-all-in-one".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    /// Load from `LUMINA_*` variables; zero counts, intervals and capacities are rejected
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(Environment::with_prefix("LUMINA"))
            .build()?
            .try_deserialize()?;

        validate_struct(&config).map_err(|e| ConfigError::Message(e.to_string()))?;
        Ok(config)
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            max_pool_size: self.postgres_max_pool_size,
            migrations_dir: self.postgres_migrations_dir.clone(),
            goose_binary_path: self.postgres_goose_binary_path.clone(),
        }
    }

    pub fn device_sync_config(&self) -> DeviceSyncConfig {
        DeviceSyncConfig {
            transport_address: self.mqtt_broker_url.clone(),
            store_connection: self.postgres_config(),
            staleness_window_secs: self.staleness_window_secs,
            command_timeout_secs: self.command_timeout_secs,
            retry_count: self.retry_count,
            mqtt_client_id: self.mqtt_client_id.clone(),
            mqtt_retry_delay_secs: self.mqtt_retry_delay_secs,
            mqtt_max_retry_attempts: self.mqtt_max_retry_attempts,
            liveness_sweep_interval_secs: self.liveness_sweep_interval_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 5] = [
        "LUMINA_LOG_LEVEL",
        "LUMINA_COMMAND_TIMEOUT_SECS",
        "LUMINA_MQTT_BROKER_URL",
        "LUMINA_FEED_CAPACITY",
        "LUMINA_LIVENESS_SWEEP_INTERVAL_SECS",
    ];

    fn load_with(var: &str, value: &str) -> Result<ServiceConfig, ConfigError> {
        clear_vars();
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var(var, value);
        }
        let result = ServiceConfig::from_env();
        clear_vars();
        result
    }

    fn clear_vars() {
        for var in VARS {
            // SAFETY: Test runs with mutex lock to prevent concurrent env access
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_vars();

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.command_timeout_secs, 5);
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.staleness_window_secs, 300);
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("LUMINA_LOG_LEVEL", "debug");
            std::env::set_var("LUMINA_COMMAND_TIMEOUT_SECS", "9");
            std::env::set_var("LUMINA_MQTT_BROKER_URL", "mqtt://broker:1884");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.command_timeout_secs, 9);

        let sync = config.device_sync_config();
        assert_eq!(sync.transport_address, "mqtt://broker:1884");
        assert_eq!(sync.command_timeout_secs, 9);

        clear_vars();
    }

    #[test]
    fn test_postgres_config_carries_migrations() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_vars();

        let config = ServiceConfig::from_env().unwrap();
        let postgres = config.postgres_config();
        assert_eq!(postgres.migrations_dir, "crates/common/migrations/postgres");
        assert_eq!(postgres.port, 5432);
    }

    #[test]
    fn test_zero_feed_capacity_rejected() {
        let _lock = TEST_LOCK.lock().unwrap();
        let err = load_with("LUMINA_FEED_CAPACITY", "0").unwrap_err();
        assert!(err.to_string().contains("feed_capacity"));
    }

    #[test]
    fn test_zero_liveness_interval_rejected() {
        let _lock = TEST_LOCK.lock().unwrap();
        let err = load_with("LUMINA_LIVENESS_SWEEP_INTERVAL_SECS", "0").unwrap_err();
        assert!(err.to_string().contains("liveness_sweep_interval_secs"));
    }

    #[test]
    fn test_zero_command_timeout_rejected() {
        let _lock = TEST_LOCK.lock().unwrap();
        let err = load_with("LUMINA_COMMAND_TIMEOUT_SECS", "0").unwrap_err();
        assert!(err.to_string().contains("command_timeout_secs"));
    }
}

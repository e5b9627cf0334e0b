use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const DEFAULT_DEVICE_TYPE: &str = "led_strip";

/// Device known to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub device_id: String,
    pub friendly_name: Option<String>,
    pub device_type: String,
    pub last_seen: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Input for registering a device on first sight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDeviceInput {
    pub device_id: String,
    pub device_type: String,
    pub seen_at: DateTime<Utc>,
}

/// Outcome of a registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredDevice {
    pub device: Device,
    /// False when the device already existed
    pub created: bool,
}

/// Repository trait for device persistence operations
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Get a device by ID
    async fn get_device(&self, device_id: &str) -> DomainResult<Option<Device>>;

    /// Create a device together with its default state in one transaction.
    /// Registering an existing device returns it unchanged.
    async fn register_device(&self, input: RegisterDeviceInput) -> DomainResult<RegisteredDevice>;

    /// Advance last_seen; never moves it backwards
    async fn touch_last_seen(&self, device_id: &str, seen_at: DateTime<Utc>) -> DomainResult<()>;

    /// Set or clear the user-assigned name
    async fn rename_device(
        &self,
        device_id: &str,
        friendly_name: Option<String>,
    ) -> DomainResult<Device>;

    /// List all devices, including ones that have gone offline
    async fn list_devices(&self) -> DomainResult<Vec<Device>>;
}

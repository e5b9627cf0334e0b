use chrono::{DateTime, Utc};
use common::domain::{
    Device, DeviceRepository, DomainError, DomainResult, RegisterDeviceInput, DEFAULT_DEVICE_TYPE,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use super::{FeedEvent, FeedNotifier};

/// Result of recording that a device was heard from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    /// True when this observation registered the device
    pub created: bool,
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_seen: DateTime<Utc>,
    /// Online flag as of the last sweep
    online: bool,
}

/// Known devices and their liveness
///
/// The device table is the source of truth; this keeps a cache of
/// `last_seen` so liveness checks do not hit the store.
pub struct DeviceRegistry {
    repository: Arc<dyn DeviceRepository>,
    notifier: Arc<dyn FeedNotifier>,
    staleness_window: chrono::Duration,
    liveness: RwLock<HashMap<String, Liveness>>,
}

impl DeviceRegistry {
    pub fn new(
        repository: Arc<dyn DeviceRepository>,
        notifier: Arc<dyn FeedNotifier>,
        staleness_window: Duration,
    ) -> Self {
        Self {
            repository,
            notifier,
            staleness_window: chrono::Duration::from_std(staleness_window)
                .unwrap_or(chrono::Duration::MAX),
            liveness: RwLock::new(HashMap::new()),
        }
    }

    /// Warm the liveness cache from the store
    #[instrument(skip(self))]
    pub async fn load(&self) -> DomainResult<usize> {
        let devices = self.repository.list_devices().await?;
        let now = Utc::now();

        let mut liveness = self.liveness.write().await;
        for device in &devices {
            liveness.insert(
                device.device_id.clone(),
                Liveness {
                    last_seen: device.last_seen,
                    online: self.within_window(device.last_seen, now),
                },
            );
        }

        info!(count = devices.len(), "loaded devices into registry");
        Ok(devices.len())
    }

    /// Record that a device was heard from, registering it on first sight
    pub async fn observe(
        &self,
        device_id: &str,
        timestamp: DateTime<Utc>,
    ) -> DomainResult<Observation> {
        self.observe_as(device_id, DEFAULT_DEVICE_TYPE, timestamp)
            .await
    }

    /// Like `observe`, recording the announced device type on registration
    pub async fn announce(
        &self,
        device_id: &str,
        device_type: &str,
        timestamp: DateTime<Utc>,
    ) -> DomainResult<Observation> {
        self.observe_as(device_id, device_type, timestamp).await
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn observe_as(
        &self,
        device_id: &str,
        device_type: &str,
        timestamp: DateTime<Utc>,
    ) -> DomainResult<Observation> {
        validate_device_id(device_id)?;

        let created = if self.is_known(device_id).await {
            self.repository.touch_last_seen(device_id, timestamp).await?;
            false
        } else {
            let registered = self
                .repository
                .register_device(RegisterDeviceInput {
                    device_id: device_id.to_string(),
                    device_type: device_type.to_string(),
                    seen_at: timestamp,
                })
                .await?;
            if !registered.created {
                self.repository.touch_last_seen(device_id, timestamp).await?;
            } else {
                info!(device_type = %device_type, "new device registered");
            }
            registered.created
        };

        let (last_seen, came_online) = {
            let mut liveness = self.liveness.write().await;
            let entry = liveness
                .entry(device_id.to_string())
                .or_insert(Liveness {
                    last_seen: timestamp,
                    online: true,
                });
            entry.last_seen = entry.last_seen.max(timestamp);
            let came_online = !entry.online;
            entry.online = true;
            (entry.last_seen, came_online)
        };

        if came_online {
            info!("device back online");
            self.notifier
                .publish(FeedEvent::LivenessChanged {
                    device_id: device_id.to_string(),
                    online: true,
                    last_seen,
                })
                .await;
        }

        debug!(created, %last_seen, "device observed");
        Ok(Observation {
            device_id: device_id.to_string(),
            last_seen,
            created,
        })
    }

    pub async fn is_known(&self, device_id: &str) -> bool {
        self.liveness.read().await.contains_key(device_id)
    }

    pub async fn last_seen(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.liveness
            .read()
            .await
            .get(device_id)
            .map(|entry| entry.last_seen)
    }

    /// Whether the device was heard from within the staleness window
    pub async fn is_online(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        self.last_seen(device_id)
            .await
            .is_some_and(|last_seen| self.within_window(last_seen, now))
    }

    /// Online check for a device row, preferring the fresher cached `last_seen`
    pub async fn device_online(&self, device: &Device, now: DateTime<Utc>) -> bool {
        let cached = self.last_seen(&device.device_id).await;
        let last_seen = cached.map_or(device.last_seen, |seen| seen.max(device.last_seen));
        self.within_window(last_seen, now)
    }

    pub async fn get_device(&self, device_id: &str) -> DomainResult<Device> {
        self.repository
            .get_device(device_id)
            .await?
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))
    }

    /// Every registered device, online or not
    pub async fn list_devices(&self) -> DomainResult<Vec<Device>> {
        self.repository.list_devices().await
    }

    /// Set the user-facing name; blank clears it
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn rename(&self, device_id: &str, friendly_name: Option<&str>) -> DomainResult<Device> {
        let friendly_name = friendly_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        if let Some(name) = &friendly_name {
            if name.chars().count() > MAX_DEVICE_FIELD_LEN {
                return Err(DomainError::ValidationError(format!(
                    "friendly name longer than {} characters",
                    MAX_DEVICE_FIELD_LEN
                )));
            }
        }

        let device = self
            .repository
            .rename_device(device_id, friendly_name)
            .await?;

        self.notifier
            .publish(FeedEvent::DeviceRenamed {
                device_id: device.device_id.clone(),
                friendly_name: device.friendly_name.clone(),
            })
            .await;

        Ok(device)
    }

    /// Re-evaluate liveness, returning `(device_id, online)` for each device
    /// whose flag flipped since the previous sweep
    pub async fn sweep_liveness(&self, now: DateTime<Utc>) -> Vec<(String, bool)> {
        let mut flipped = Vec::new();
        {
            let mut liveness = self.liveness.write().await;
            for (device_id, entry) in liveness.iter_mut() {
                let online = self.within_window(entry.last_seen, now);
                if online != entry.online {
                    entry.online = online;
                    flipped.push((device_id.clone(), online, entry.last_seen));
                }
            }
        }

        for (device_id, online, last_seen) in &flipped {
            info!(device_id = %device_id, online, "device liveness changed");
            self.notifier
                .publish(FeedEvent::LivenessChanged {
                    device_id: device_id.clone(),
                    online: *online,
                    last_seen: *last_seen,
                })
                .await;
        }

        flipped
            .into_iter()
            .map(|(device_id, online, _)| (device_id, online))
            .collect()
    }

    fn within_window(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(last_seen) <= self.staleness_window
    }
}

/// Longest device id or friendly name the devices table stores
pub const MAX_DEVICE_FIELD_LEN: usize = 100;

/// Device ids become MQTT topic segments, so wildcards and separators are refused
pub fn validate_device_id(device_id: &str) -> DomainResult<()> {
    if device_id.trim().is_empty() {
        return Err(DomainError::InvalidDeviceId(
            "device ID cannot be empty".to_string(),
        ));
    }
    if device_id.chars().count() > MAX_DEVICE_FIELD_LEN {
        return Err(DomainError::InvalidDeviceId(format!(
            "device ID longer than {} characters",
            MAX_DEVICE_FIELD_LEN
        )));
    }
    if device_id.contains(['/', '+', '#']) {
        return Err(DomainError::InvalidDeviceId(format!(
            "device ID '{}' contains a topic separator or wildcard",
            device_id
        )));
    }
    Ok(())
}

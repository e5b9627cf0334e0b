use chrono::{DateTime, Utc};
use common::domain::{CommandStatus, Device, DeviceState, DeviceStateStore, DomainError, DomainResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{instrument, warn};

use super::{CommandStatusBook, CommandStatusEntry, DeviceRegistry};

/// A device as presented to one reader
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub friendly_name: Option<String>,
    pub device_type: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub state: DeviceState,
    /// Status of the viewing session's most recent command to this device
    pub pending_status: Option<CommandStatus>,
    pub last_command_id: Option<String>,
}

/// Query side over registry, state store and command statuses
pub struct ReadSideFeed {
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn DeviceStateStore>,
    status_book: Arc<CommandStatusBook>,
}

impl ReadSideFeed {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<dyn DeviceStateStore>,
        status_book: Arc<CommandStatusBook>,
    ) -> Self {
        Self {
            registry,
            store,
            status_book,
        }
    }

    /// All devices with their current state, offline ones included
    #[instrument(skip(self))]
    pub async fn list_devices(&self, session_id: Option<&str>) -> DomainResult<Vec<DeviceView>> {
        let devices = self.registry.list_devices().await?;
        let mut states: HashMap<String, DeviceState> = self
            .store
            .list_device_states()
            .await?
            .into_iter()
            .map(|state| (state.device_id.clone(), state))
            .collect();

        let now = Utc::now();
        let mut views = Vec::with_capacity(devices.len());
        for device in devices {
            match states.remove(&device.device_id) {
                Some(state) => views.push(self.view(device, state, session_id, now).await),
                None => warn!(device_id = %device.device_id, "device has no state row, skipping"),
            }
        }

        Ok(views)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn get_device(
        &self,
        device_id: &str,
        session_id: Option<&str>,
    ) -> DomainResult<DeviceView> {
        let device = self.registry.get_device(device_id).await?;
        let state = self
            .store
            .get_device_state(device_id)
            .await?
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;

        Ok(self.view(device, state, session_id, Utc::now()).await)
    }

    pub async fn command_status(&self, command_id: &str) -> Option<CommandStatusEntry> {
        self.status_book.status(command_id).await
    }

    async fn view(
        &self,
        device: Device,
        state: DeviceState,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> DeviceView {
        let online = self.registry.device_online(&device, now).await;
        let last_seen = self
            .registry
            .last_seen(&device.device_id)
            .await
            .map_or(device.last_seen, |seen| seen.max(device.last_seen));
        let latest = self
            .status_book
            .latest_for(session_id, &device.device_id)
            .await;

        DeviceView {
            device_id: device.device_id,
            friendly_name: device.friendly_name,
            device_type: device.device_type,
            online,
            last_seen,
            state,
            pending_status: latest.as_ref().map(|entry| entry.status),
            last_command_id: latest.map(|entry| entry.command_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FeedNotifier, InMemoryDeviceStore, MockFeedNotifier};
    use common::domain::{
        DeviceCommand, DeviceRepository, PendingCommand, RegisterDeviceInput, DEFAULT_DEVICE_TYPE,
    };
    use std::time::Duration;

    async fn feed_with(device_ids: &[&str]) -> (ReadSideFeed, Arc<CommandStatusBook>) {
        let mut notifier = MockFeedNotifier::new();
        notifier.expect_publish().returning(|_| ());
        let notifier: Arc<dyn FeedNotifier> = Arc::new(notifier);

        let store = Arc::new(InMemoryDeviceStore::new());
        for device_id in device_ids {
            store
                .register_device(RegisterDeviceInput {
                    device_id: device_id.to_string(),
                    device_type: DEFAULT_DEVICE_TYPE.to_string(),
                    seen_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let registry = Arc::new(DeviceRegistry::new(
            store.clone(),
            notifier.clone(),
            Duration::from_secs(300),
        ));
        registry.load().await.unwrap();
        let book = Arc::new(CommandStatusBook::new(notifier));

        (ReadSideFeed::new(registry, store, book.clone()), book)
    }

    #[tokio::test]
    async fn test_list_devices_shows_default_state() {
        let (feed, _) = feed_with(&["esp32-a", "esp32-b"]).await;

        let views = feed.list_devices(None).await.unwrap();
        assert_eq!(views.len(), 2);
        for view in views {
            assert!(view.online);
            assert!(!view.state.power);
            assert_eq!(view.state.brightness, 100);
            assert_eq!(view.pending_status, None);
        }
    }

    #[tokio::test]
    async fn test_pending_status_visible_only_to_issuing_session() {
        let (feed, book) = feed_with(&["esp32-a"]).await;
        let now = Utc::now();
        book.record(
            &PendingCommand {
                command_id: "cmd-1".to_string(),
                device_id: "esp32-a".to_string(),
                command: DeviceCommand::SetPower(true),
                session_id: Some("session-1".to_string()),
                attempts: 1,
                issued_at: now,
                deadline: now,
            },
            CommandStatus::Pending,
        )
        .await;

        let mine = feed.get_device("esp32-a", Some("session-1")).await.unwrap();
        assert_eq!(mine.pending_status, Some(CommandStatus::Pending));
        assert_eq!(mine.last_command_id.as_deref(), Some("cmd-1"));

        let theirs = feed.get_device("esp32-a", Some("session-2")).await.unwrap();
        assert_eq!(theirs.pending_status, None);
    }

    #[tokio::test]
    async fn test_get_unknown_device() {
        let (feed, _) = feed_with(&[]).await;
        let result = feed.get_device("ghost", None).await;
        assert!(matches!(result, Err(DomainError::DeviceNotFound(_))));
    }
}

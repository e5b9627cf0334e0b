use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::domain::{
    Device, DeviceRepository, DeviceState, DeviceStateStore, DomainError, DomainResult,
    PendingCommand, RegisterDeviceInput, RegisteredDevice, UpsertDeviceStateInput,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    devices: HashMap<String, Device>,
    states: HashMap<String, DeviceState>,
    pending: HashMap<String, PendingCommand>,
}

/// In-memory implementation of DeviceRepository and DeviceStateStore
///
/// One lock guards all tables, so every operation is atomic.
#[derive(Clone, Default)]
pub struct InMemoryDeviceStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_into(tables: &mut Tables, input: &UpsertDeviceStateInput) -> DomainResult<DeviceState> {
    let state = tables
        .states
        .get_mut(&input.device_id)
        .ok_or_else(|| DomainError::DeviceNotFound(input.device_id.clone()))?;
    state.merge(&input.fields, input.updated_at);
    Ok(state.clone())
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceStore {
    async fn get_device(&self, device_id: &str) -> DomainResult<Option<Device>> {
        Ok(self.tables.read().await.devices.get(device_id).cloned())
    }

    async fn register_device(&self, input: RegisterDeviceInput) -> DomainResult<RegisteredDevice> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables.devices.get(&input.device_id) {
            return Ok(RegisteredDevice {
                device: existing.clone(),
                created: false,
            });
        }

        let device = Device {
            device_id: input.device_id.clone(),
            friendly_name: None,
            device_type: input.device_type,
            last_seen: input.seen_at,
            created_at: Some(Utc::now()),
        };
        tables
            .devices
            .insert(input.device_id.clone(), device.clone());
        tables.states.insert(
            input.device_id.clone(),
            DeviceState::initial(input.device_id, input.seen_at),
        );

        Ok(RegisteredDevice {
            device,
            created: true,
        })
    }

    async fn touch_last_seen(&self, device_id: &str, seen_at: DateTime<Utc>) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let device = tables
            .devices
            .get_mut(device_id)
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;
        device.last_seen = device.last_seen.max(seen_at);
        Ok(())
    }

    async fn rename_device(
        &self,
        device_id: &str,
        friendly_name: Option<String>,
    ) -> DomainResult<Device> {
        let mut tables = self.tables.write().await;
        let device = tables
            .devices
            .get_mut(device_id)
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;
        device.friendly_name = friendly_name;
        Ok(device.clone())
    }

    async fn list_devices(&self) -> DomainResult<Vec<Device>> {
        let tables = self.tables.read().await;
        let mut devices: Vec<Device> = tables.devices.values().cloned().collect();
        devices.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        Ok(devices)
    }
}

#[async_trait]
impl DeviceStateStore for InMemoryDeviceStore {
    async fn get_device_state(&self, device_id: &str) -> DomainResult<Option<DeviceState>> {
        Ok(self.tables.read().await.states.get(device_id).cloned())
    }

    async fn list_device_states(&self) -> DomainResult<Vec<DeviceState>> {
        let tables = self.tables.read().await;
        let mut states: Vec<DeviceState> = tables.states.values().cloned().collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(states)
    }

    async fn upsert_device_state(
        &self,
        input: UpsertDeviceStateInput,
    ) -> DomainResult<DeviceState> {
        let mut tables = self.tables.write().await;
        merge_into(&mut tables, &input)
    }

    async fn get_pending_command(&self, device_id: &str) -> DomainResult<Option<PendingCommand>> {
        Ok(self.tables.read().await.pending.get(device_id).cloned())
    }

    async fn put_pending_command(
        &self,
        command: PendingCommand,
    ) -> DomainResult<Option<PendingCommand>> {
        let mut tables = self.tables.write().await;
        if !tables.devices.contains_key(&command.device_id) {
            return Err(DomainError::DeviceNotFound(command.device_id));
        }

        let command_id = command.command_id.clone();
        let previous = tables.pending.insert(command.device_id.clone(), command);
        Ok(previous.filter(|prev| prev.command_id != command_id))
    }

    async fn delete_pending_command(
        &self,
        device_id: &str,
        command_id: &str,
    ) -> DomainResult<bool> {
        let mut tables = self.tables.write().await;
        let is_current = tables
            .pending
            .get(device_id)
            .is_some_and(|pending| pending.command_id == command_id);
        if is_current {
            tables.pending.remove(device_id);
        }
        Ok(is_current)
    }

    async fn commit_reconciliation(
        &self,
        input: UpsertDeviceStateInput,
        resolved_command_id: Option<String>,
    ) -> DomainResult<DeviceState> {
        let mut tables = self.tables.write().await;
        let state = merge_into(&mut tables, &input)?;

        if let Some(command_id) = resolved_command_id {
            let is_current = tables
                .pending
                .get(&input.device_id)
                .is_some_and(|pending| pending.command_id == command_id);
            if is_current {
                tables.pending.remove(&input.device_id);
            }
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{DeviceCommand, StateFields, DEFAULT_DEVICE_TYPE};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    async fn store_with_device(device_id: &str) -> InMemoryDeviceStore {
        let store = InMemoryDeviceStore::new();
        store
            .register_device(RegisterDeviceInput {
                device_id: device_id.to_string(),
                device_type: DEFAULT_DEVICE_TYPE.to_string(),
                seen_at: at(0),
            })
            .await
            .unwrap();
        store
    }

    fn pending(command_id: &str) -> PendingCommand {
        PendingCommand {
            command_id: command_id.to_string(),
            device_id: "esp32-a".to_string(),
            command: DeviceCommand::SetPower(true),
            session_id: None,
            attempts: 1,
            issued_at: at(0),
            deadline: at(5),
        }
    }

    #[tokio::test]
    async fn test_register_creates_default_state_once() {
        let store = store_with_device("esp32-a").await;

        let again = store
            .register_device(RegisterDeviceInput {
                device_id: "esp32-a".to_string(),
                device_type: "other".to_string(),
                seen_at: at(10),
            })
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.device.device_type, DEFAULT_DEVICE_TYPE);

        let state = store.get_device_state("esp32-a").await.unwrap().unwrap();
        assert_eq!(state, DeviceState::initial("esp32-a", at(0)));
    }

    #[tokio::test]
    async fn test_upsert_rejects_stale_fields() {
        let store = store_with_device("esp32-a").await;
        let upsert = |brightness: u8, secs: i64| UpsertDeviceStateInput {
            device_id: "esp32-a".to_string(),
            fields: StateFields {
                brightness: Some(brightness),
                ..Default::default()
            },
            updated_at: at(secs),
        };

        store.upsert_device_state(upsert(40, 20)).await.unwrap();
        let state = store.upsert_device_state(upsert(90, 10)).await.unwrap();
        assert_eq!(state.brightness, 40);
    }

    #[tokio::test]
    async fn test_put_pending_returns_superseded() {
        let store = store_with_device("esp32-a").await;

        assert!(store.put_pending_command(pending("cmd-1")).await.unwrap().is_none());
        // same id is a retry, not a supersession
        assert!(store.put_pending_command(pending("cmd-1")).await.unwrap().is_none());
        let superseded = store.put_pending_command(pending("cmd-2")).await.unwrap();
        assert_eq!(superseded.map(|p| p.command_id), Some("cmd-1".to_string()));
    }

    #[tokio::test]
    async fn test_put_pending_unknown_device() {
        let store = InMemoryDeviceStore::new();
        let result = store.put_pending_command(pending("cmd-1")).await;
        assert!(matches!(result, Err(DomainError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_pending_only_if_current() {
        let store = store_with_device("esp32-a").await;
        store.put_pending_command(pending("cmd-2")).await.unwrap();

        assert!(!store.delete_pending_command("esp32-a", "cmd-1").await.unwrap());
        assert!(store.delete_pending_command("esp32-a", "cmd-2").await.unwrap());
        assert!(store.get_pending_command("esp32-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_reconciliation_unknown_device_changes_nothing() {
        let store = InMemoryDeviceStore::new();
        let result = store
            .commit_reconciliation(
                UpsertDeviceStateInput {
                    device_id: "ghost".to_string(),
                    fields: StateFields::default(),
                    updated_at: at(0),
                },
                Some("cmd-1".to_string()),
            )
            .await;
        assert!(matches!(result, Err(DomainError::DeviceNotFound(_))));
    }
}

use crate::domain::{
    Device, DeviceRepository, DeviceState, DomainError, DomainResult, RegisterDeviceInput,
    RegisteredDevice,
};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::Row;
use tracing::{debug, info, instrument};

const DEVICE_COLUMNS: &str = "device_id, friendly_name, device_type, last_seen, created_at";

/// Device row for PostgreSQL storage with timestamp metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRow {
    pub device_id: String,
    pub friendly_name: Option<String>,
    pub device_type: String,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<&Row> for DeviceRow {
    fn from(row: &Row) -> Self {
        DeviceRow {
            device_id: row.get(0),
            friendly_name: row.get(1),
            device_type: row.get(2),
            last_seen: row.get(3),
            created_at: row.get(4),
        }
    }
}

/// Convert database DeviceRow to domain Device
impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            device_id: row.device_id,
            friendly_name: row.friendly_name,
            device_type: row.device_type,
            last_seen: row.last_seen,
            created_at: Some(row.created_at),
        }
    }
}

/// PostgreSQL implementation of DeviceRepository trait
#[derive(Clone)]
pub struct PostgresDeviceRepository {
    client: PostgresClient,
}

impl PostgresDeviceRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn get_device(&self, device_id: &str) -> DomainResult<Option<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let row = conn
            .query_opt(
                &format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS),
                &[&device_id],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        Ok(row.map(|row| DeviceRow::from(&row).into()))
    }

    #[instrument(skip(self, input), fields(device_id = %input.device_id))]
    async fn register_device(&self, input: RegisterDeviceInput) -> DomainResult<RegisteredDevice> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        let inserted = tx
            .query_opt(
                &format!(
                    "INSERT INTO devices (device_id, device_type, last_seen, created_at)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (device_id) DO NOTHING
                     RETURNING {}",
                    DEVICE_COLUMNS
                ),
                &[
                    &input.device_id,
                    &input.device_type,
                    &input.seen_at,
                    &Utc::now(),
                ],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        let registered = match inserted {
            Some(row) => {
                let state = DeviceState::initial(input.device_id.clone(), input.seen_at);
                tx.execute(
                    "INSERT INTO device_state
                        (device_id, power, brightness, color_r, color_g, color_b, effect, updated_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                    &[
                        &state.device_id,
                        &state.power,
                        &(state.brightness as i16),
                        &(state.color.r as i16),
                        &(state.color.g as i16),
                        &(state.color.b as i16),
                        &state.effect.as_str(),
                        &state.updated_at,
                    ],
                )
                .await
                .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

                RegisteredDevice {
                    device: DeviceRow::from(&row).into(),
                    created: true,
                }
            }
            None => {
                let row = tx
                    .query_one(
                        &format!("SELECT {} FROM devices WHERE device_id = $1", DEVICE_COLUMNS),
                        &[&input.device_id],
                    )
                    .await
                    .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

                RegisteredDevice {
                    device: DeviceRow::from(&row).into(),
                    created: false,
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        if registered.created {
            info!(device_id = %input.device_id, "Device registered in database");
        }
        Ok(registered)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn touch_last_seen(&self, device_id: &str, seen_at: DateTime<Utc>) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let rows_affected = conn
            .execute(
                "UPDATE devices SET last_seen = GREATEST(last_seen, $2) WHERE device_id = $1",
                &[&device_id, &seen_at],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        if rows_affected == 0 {
            return Err(DomainError::DeviceNotFound(device_id.to_string()));
        }

        debug!("Device last_seen advanced");
        Ok(())
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn rename_device(
        &self,
        device_id: &str,
        friendly_name: Option<String>,
    ) -> DomainResult<Device> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let row = conn
            .query_opt(
                &format!(
                    "UPDATE devices SET friendly_name = $2 WHERE device_id = $1 RETURNING {}",
                    DEVICE_COLUMNS
                ),
                &[&device_id, &friendly_name],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        match row {
            Some(row) => {
                info!("Device renamed in database");
                Ok(DeviceRow::from(&row).into())
            }
            None => Err(DomainError::DeviceNotFound(device_id.to_string())),
        }
    }

    async fn list_devices(&self) -> DomainResult<Vec<Device>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM devices ORDER BY created_at ASC, device_id ASC",
                    DEVICE_COLUMNS
                ),
                &[],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        let devices: Vec<Device> = rows
            .iter()
            .map(|row| DeviceRow::from(row).into())
            .collect();

        debug!(count = devices.len(), "Listed devices from database");
        Ok(devices)
    }
}

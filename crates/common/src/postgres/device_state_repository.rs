use crate::domain::{
    Color, DeviceCommand, DeviceState, DeviceStateStore, DomainError, DomainResult, Effect,
    FieldTimestamps, PendingCommand, UpsertDeviceStateInput,
};
use crate::postgres::PostgresClient;
use anyhow::Context;
use async_trait::async_trait;
use deadpool_postgres::Transaction;
use tokio_postgres::Row;
use tracing::{debug, instrument};

const STATE_COLUMNS: &str = "device_id, power, brightness, color_r, color_g, color_b, effect, \
     power_at, brightness_at, color_at, effect_at, updated_at";

const PENDING_COLUMNS: &str =
    "command_id, device_id, command, session_id, attempts, issued_at, deadline";

/// Convert a device_state row into the domain state
fn state_from_row(row: &Row) -> DomainResult<DeviceState> {
    let effect: String = row.get(6);
    let effect: Effect = effect.parse().map_err(|_| {
        DomainError::PersistenceFailure(anyhow::anyhow!("stored effect '{}' is unknown", effect))
    })?;

    Ok(DeviceState {
        device_id: row.get(0),
        power: row.get(1),
        brightness: row.get::<_, i16>(2) as u8,
        color: Color::new(
            row.get::<_, i16>(3) as u8,
            row.get::<_, i16>(4) as u8,
            row.get::<_, i16>(5) as u8,
        ),
        effect,
        field_timestamps: FieldTimestamps {
            power_at: row.get(7),
            brightness_at: row.get(8),
            color_at: row.get(9),
            effect_at: row.get(10),
        },
        updated_at: row.get(11),
    })
}

fn pending_from_row(row: &Row) -> DomainResult<PendingCommand> {
    let command: serde_json::Value = row.get(2);
    let command: DeviceCommand = serde_json::from_value(command)
        .context("stored pending command is not decodable")
        .map_err(DomainError::PersistenceFailure)?;
    let attempts: i32 = row.get(4);

    Ok(PendingCommand {
        command_id: row.get(0),
        device_id: row.get(1),
        command,
        session_id: row.get(3),
        attempts: attempts.max(0) as u32,
        issued_at: row.get(5),
        deadline: row.get(6),
    })
}

/// Lock the state row, merge the fields and write the row back.
/// Stale fields are filtered by the merge itself.
async fn merge_state_locked(
    tx: &Transaction<'_>,
    input: &UpsertDeviceStateInput,
) -> DomainResult<DeviceState> {
    let row = tx
        .query_opt(
            &format!(
                "SELECT {} FROM device_state WHERE device_id = $1 FOR UPDATE",
                STATE_COLUMNS
            ),
            &[&input.device_id],
        )
        .await
        .map_err(|e| DomainError::PersistenceFailure(e.into()))?
        .ok_or_else(|| DomainError::DeviceNotFound(input.device_id.clone()))?;

    let mut state = state_from_row(&row)?;
    let merge = state.merge(&input.fields, input.updated_at);

    if merge.accepted.is_empty() {
        debug!(device_id = %input.device_id, "no fields newer than stored state");
        return Ok(state);
    }

    tx.execute(
        "UPDATE device_state
         SET power = $2, brightness = $3, color_r = $4, color_g = $5, color_b = $6, effect = $7,
             power_at = $8, brightness_at = $9, color_at = $10, effect_at = $11, updated_at = $12
         WHERE device_id = $1",
        &[
            &state.device_id,
            &state.power,
            &(state.brightness as i16),
            &(state.color.r as i16),
            &(state.color.g as i16),
            &(state.color.b as i16),
            &state.effect.as_str(),
            &state.field_timestamps.power_at,
            &state.field_timestamps.brightness_at,
            &state.field_timestamps.color_at,
            &state.field_timestamps.effect_at,
            &state.updated_at,
        ],
    )
    .await
    .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

    Ok(state)
}

/// PostgreSQL implementation of DeviceStateStore
#[derive(Clone)]
pub struct PostgresDeviceStateRepository {
    client: PostgresClient,
}

impl PostgresDeviceStateRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceStateStore for PostgresDeviceStateRepository {
    async fn get_device_state(&self, device_id: &str) -> DomainResult<Option<DeviceState>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let row = conn
            .query_opt(
                &format!("SELECT {} FROM device_state WHERE device_id = $1", STATE_COLUMNS),
                &[&device_id],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        row.as_ref().map(state_from_row).transpose()
    }

    async fn list_device_states(&self) -> DomainResult<Vec<DeviceState>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let rows = conn
            .query(
                &format!("SELECT {} FROM device_state ORDER BY device_id", STATE_COLUMNS),
                &[],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        rows.iter().map(state_from_row).collect()
    }

    #[instrument(skip(self, input), fields(device_id = %input.device_id))]
    async fn upsert_device_state(
        &self,
        input: UpsertDeviceStateInput,
    ) -> DomainResult<DeviceState> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        let state = merge_state_locked(&tx, &input).await?;

        tx.commit()
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;
        Ok(state)
    }

    async fn get_pending_command(&self, device_id: &str) -> DomainResult<Option<PendingCommand>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM pending_commands WHERE device_id = $1",
                    PENDING_COLUMNS
                ),
                &[&device_id],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        row.as_ref().map(pending_from_row).transpose()
    }

    #[instrument(skip(self, command), fields(device_id = %command.device_id, command_id = %command.command_id))]
    async fn put_pending_command(
        &self,
        command: PendingCommand,
    ) -> DomainResult<Option<PendingCommand>> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        let previous = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM pending_commands WHERE device_id = $1 FOR UPDATE",
                    PENDING_COLUMNS
                ),
                &[&command.device_id],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?
            .as_ref()
            .map(pending_from_row)
            .transpose()?;

        let command_json = serde_json::to_value(command.command)
            .context("pending command is not encodable")
            .map_err(DomainError::PersistenceFailure)?;
        let attempts = command.attempts as i32;

        tx.execute(
            "INSERT INTO pending_commands
                (device_id, command_id, command, session_id, attempts, issued_at, deadline)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (device_id) DO UPDATE
             SET command_id = EXCLUDED.command_id, command = EXCLUDED.command,
                 session_id = EXCLUDED.session_id, attempts = EXCLUDED.attempts,
                 issued_at = EXCLUDED.issued_at, deadline = EXCLUDED.deadline",
            &[
                &command.device_id,
                &command.command_id,
                &command_json,
                &command.session_id,
                &attempts,
                &command.issued_at,
                &command.deadline,
            ],
        )
        .await
        .map_err(|e| {
            if let Some(db_err) = e.as_db_error() {
                // foreign key violation: no such device
                if db_err.code().code() == "23503" {
                    return DomainError::DeviceNotFound(command.device_id.clone());
                }
            }
            DomainError::PersistenceFailure(e.into())
        })?;

        tx.commit()
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        // Re-putting the same command (a retry) is not a supersession
        Ok(previous.filter(|prev| prev.command_id != command.command_id))
    }

    async fn delete_pending_command(
        &self,
        device_id: &str,
        command_id: &str,
    ) -> DomainResult<bool> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;

        let rows_affected = conn
            .execute(
                "DELETE FROM pending_commands WHERE device_id = $1 AND command_id = $2",
                &[&device_id, &command_id],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        Ok(rows_affected > 0)
    }

    #[instrument(skip(self, input), fields(device_id = %input.device_id, resolved = ?resolved_command_id))]
    async fn commit_reconciliation(
        &self,
        input: UpsertDeviceStateInput,
        resolved_command_id: Option<String>,
    ) -> DomainResult<DeviceState> {
        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::PersistenceFailure)?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        // Any early return drops the transaction and rolls both writes back
        let state = merge_state_locked(&tx, &input).await?;

        if let Some(command_id) = &resolved_command_id {
            tx.execute(
                "DELETE FROM pending_commands WHERE device_id = $1 AND command_id = $2",
                &[&input.device_id, command_id],
            )
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;
        }

        tx.commit()
            .await
            .map_err(|e| DomainError::PersistenceFailure(e.into()))?;

        debug!("reconciliation committed");
        Ok(state)
    }
}

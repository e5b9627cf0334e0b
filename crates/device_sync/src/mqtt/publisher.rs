use async_trait::async_trait;
use common::domain::{DomainError, DomainResult, PendingCommand};
use rumqttc::{AsyncClient, QoS};
use tracing::{debug, instrument};

use super::{command_topic, encode_command};
use crate::domain::CommandPublisher;

/// Publishes commands through the shared rumqttc client
///
/// Uses the non-blocking `try_publish`, so a full request queue surfaces
/// as `TransportUnavailable` instead of stalling the caller.
#[derive(Clone)]
pub struct MqttCommandPublisher {
    client: AsyncClient,
}

impl MqttCommandPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommandPublisher for MqttCommandPublisher {
    #[instrument(skip_all, fields(device_id = %command.device_id, command_id = %command.command_id))]
    async fn publish_command(&self, command: &PendingCommand) -> DomainResult<()> {
        let topic = command_topic(&command.device_id);
        let payload = encode_command(command)?;

        self.client
            .try_publish(&topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| DomainError::TransportUnavailable(e.to_string()))?;

        debug!(topic = %topic, attempt = command.attempts, "command queued for broker");
        Ok(())
    }
}

use chrono::Utc;
use common::domain::{CommandHandle, DeviceCommand, DomainResult, IssueCommandInput, PendingCommand};
use common::garde::validate_struct;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use super::{CommandPublisher, CommandTimers, StateReconciler};

/// Turns user intents into published commands and tracks them to resolution
#[derive(Clone)]
pub struct CommandDispatcher {
    reconciler: Arc<StateReconciler>,
    publisher: Arc<dyn CommandPublisher>,
    timers: CommandTimers,
    command_timeout: Duration,
    retry_count: u32,
    shutdown_token: CancellationToken,
}

impl CommandDispatcher {
    pub fn new(
        reconciler: Arc<StateReconciler>,
        publisher: Arc<dyn CommandPublisher>,
        timers: CommandTimers,
        command_timeout: Duration,
        retry_count: u32,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            publisher,
            timers,
            command_timeout,
            retry_count,
            shutdown_token,
        }
    }

    /// Validate and send a command.
    ///
    /// The returned handle is `Pending`; the issuing session already sees
    /// that status in the feed. Publish failures do not fail the call.
    #[instrument(skip_all, fields(device_id = %input.device_id, command_id = tracing::field::Empty))]
    pub async fn issue(&self, input: IssueCommandInput) -> DomainResult<CommandHandle> {
        validate_struct(&input)?;
        let command = DeviceCommand::try_from(input.command)?;

        let issued_at = Utc::now();
        let pending = PendingCommand {
            command_id: xid::new().to_string(),
            device_id: input.device_id,
            command,
            session_id: input.session_id,
            attempts: 1,
            issued_at,
            deadline: issued_at + self.chrono_timeout(),
        };
        tracing::Span::current().record("command_id", pending.command_id.as_str());

        // Armed before registration so a confirmation can always cancel it
        let token = self.timers.arm(&pending.command_id).await;
        if let Err(e) = self.reconciler.register_command(&pending).await {
            self.timers.disarm(&pending.command_id).await;
            return Err(e);
        }

        let supervisor = self.clone();
        let watched = pending.clone();
        tokio::spawn(
            async move { supervisor.supervise(watched, token).await }
                .instrument(tracing::Span::current()),
        );

        self.publish(&pending).await;
        info!(command = ?pending.command, "command issued");

        Ok(CommandHandle::from(&pending))
    }

    /// Wait out each deadline, republishing until the retries are spent
    async fn supervise(self, pending: PendingCommand, token: CancellationToken) {
        let mut current = pending;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(command_id = %current.command_id, "command timer cancelled");
                    return;
                }
                _ = self.shutdown_token.cancelled() => {
                    debug!(command_id = %current.command_id, "shutdown, abandoning command timer");
                    break;
                }
                _ = tokio::time::sleep(self.command_timeout) => {}
            }

            if current.attempts <= self.retry_count {
                let deadline = Utc::now() + self.chrono_timeout();
                match self
                    .reconciler
                    .retry_command(&current.device_id, &current.command_id, deadline)
                    .await
                {
                    Ok(Some(next)) => {
                        warn!(
                            command_id = %next.command_id,
                            attempt = next.attempts,
                            "command unconfirmed, retrying"
                        );
                        self.publish(&next).await;
                        current = next;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(command_id = %current.command_id, error = %e, "failed to record retry");
                        current.attempts += 1;
                    }
                }
            } else {
                if let Err(e) = self.reconciler.expire_command(&current).await {
                    error!(command_id = %current.command_id, error = %e, "failed to expire command");
                }
                break;
            }
        }

        self.timers.disarm(&current.command_id).await;
    }

    async fn publish(&self, pending: &PendingCommand) {
        match self.publisher.publish_command(pending).await {
            Ok(()) => debug!(command_id = %pending.command_id, "command published"),
            Err(e) if e.is_transient() => warn!(
                command_id = %pending.command_id,
                error = %e,
                "transport unavailable, command stays pending"
            ),
            Err(e) => error!(command_id = %pending.command_id, error = %e, "failed to publish command"),
        }
    }

    fn chrono_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.command_timeout).unwrap_or(chrono::Duration::days(1))
    }
}

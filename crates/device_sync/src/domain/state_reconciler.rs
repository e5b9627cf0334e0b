use chrono::{DateTime, Utc};
use common::domain::{
    CommandStatus, DeviceState, DeviceStateStore, DomainError, DomainResult, PendingCommand,
    StateFields, UpsertDeviceStateInput,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{
    Announcement, CommandStatusBook, CommandTimers, DeviceLocks, DeviceRegistry, FeedEvent,
    FeedNotifier, Observation, Telemetry,
};

/// How a state transition relates to the device's pending command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No command was pending
    Reported,
    /// The transition resolved the pending command
    Confirmed,
    /// A command is still pending and this report did not satisfy it
    Unconfirmed,
}

/// Effect of a telemetry message that changed or resolved something
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub state: DeviceState,
    /// Fields taken from the message
    pub accepted: StateFields,
    /// Whether any stored value differs afterwards
    pub changed: bool,
    pub sync_status: SyncStatus,
    pub resolved_command_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied(Reconciliation),
    /// Every reported field was already written by a message with this timestamp
    Duplicate,
    /// Every reported field is older than what is stored
    StaleIgnored,
}

/// Sole writer of device state and pending commands
///
/// All operations on one device run under that device's lock, so a
/// telemetry message, a new command and a timeout never interleave for
/// the same device.
pub struct StateReconciler {
    store: Arc<dyn DeviceStateStore>,
    registry: Arc<DeviceRegistry>,
    locks: DeviceLocks,
    timers: CommandTimers,
    status_book: Arc<CommandStatusBook>,
    notifier: Arc<dyn FeedNotifier>,
}

impl StateReconciler {
    pub fn new(
        store: Arc<dyn DeviceStateStore>,
        registry: Arc<DeviceRegistry>,
        timers: CommandTimers,
        status_book: Arc<CommandStatusBook>,
        notifier: Arc<dyn FeedNotifier>,
    ) -> Self {
        Self {
            store,
            registry,
            locks: DeviceLocks::new(),
            timers,
            status_book,
            notifier,
        }
    }

    /// Merge a state report into the stored state
    #[instrument(
        skip_all,
        fields(device_id = %telemetry.device_id, message_timestamp = %telemetry.message_timestamp)
    )]
    pub async fn ingest_telemetry(&self, telemetry: Telemetry) -> DomainResult<ReconcileOutcome> {
        let _guard = self.locks.lock(&telemetry.device_id).await;

        let observation = self
            .registry
            .observe(&telemetry.device_id, telemetry.received_at)
            .await?;
        let state = self.current_state(&telemetry.device_id).await?;
        if observation.created {
            self.publish_state(&state, SyncStatus::Reported).await;
        }

        let fields = telemetry.reported.normalize();
        let at = telemetry.message_timestamp;

        // Dry-run the merge to learn which fields win; the store repeats it atomically
        let mut preview = state.clone();
        let merge = preview.merge(&fields, at);

        if merge.accepted.is_empty() && !fields.is_empty() {
            let duplicate = fields
                .fields()
                .into_iter()
                .all(|field| state.field_timestamps.get(field) == Some(at));
            if duplicate {
                debug!("duplicate telemetry ignored");
                return Ok(ReconcileOutcome::Duplicate);
            }
            debug!("stale telemetry ignored");
            return Ok(ReconcileOutcome::StaleIgnored);
        }

        let pending = self
            .store
            .get_pending_command(&telemetry.device_id)
            .await?;
        // Only a report taken after issuance reflects the device acting on the command
        let resolved = pending.as_ref().filter(|command| {
            at >= command.issued_at && command.command.is_satisfied_by(&merge.accepted)
        });
        let sync_status = match (&pending, resolved) {
            (None, _) => SyncStatus::Reported,
            (Some(_), Some(_)) => SyncStatus::Confirmed,
            (Some(_), None) => SyncStatus::Unconfirmed,
        };

        if merge.accepted.is_empty() {
            // Report without recognizable fields; liveness was still recorded
            return Ok(ReconcileOutcome::Applied(Reconciliation {
                state,
                accepted: merge.accepted,
                changed: false,
                sync_status,
                resolved_command_id: None,
            }));
        }

        let committed = self
            .store
            .commit_reconciliation(
                UpsertDeviceStateInput {
                    device_id: telemetry.device_id.clone(),
                    fields,
                    updated_at: at,
                },
                resolved.map(|command| command.command_id.clone()),
            )
            .await?;

        if let Some(command) = resolved {
            self.timers.cancel(&command.command_id).await;
            self.status_book
                .record(command, CommandStatus::Confirmed)
                .await;
            info!(command_id = %command.command_id, "command confirmed by telemetry");
        }

        if merge.changed || resolved.is_some() {
            self.publish_state(&committed, sync_status).await;
        }

        Ok(ReconcileOutcome::Applied(Reconciliation {
            state: committed,
            accepted: merge.accepted,
            changed: merge.changed,
            sync_status,
            resolved_command_id: resolved.map(|command| command.command_id.clone()),
        }))
    }

    /// Register or refresh an announcing device
    #[instrument(skip_all, fields(device_id = %announcement.device_id))]
    pub async fn ingest_announcement(
        &self,
        announcement: Announcement,
    ) -> DomainResult<Observation> {
        let _guard = self.locks.lock(&announcement.device_id).await;

        let observation = self
            .registry
            .announce(
                &announcement.device_id,
                &announcement.device_type,
                announcement.received_at,
            )
            .await?;

        if observation.created {
            let state = self.current_state(&announcement.device_id).await?;
            self.publish_state(&state, SyncStatus::Reported).await;
        }

        Ok(observation)
    }

    /// Make `command` the device's pending command.
    ///
    /// A different command still pending for the device is superseded: its
    /// timer is cancelled and its status becomes `Superseded`.
    #[instrument(skip_all, fields(device_id = %command.device_id, command_id = %command.command_id))]
    pub async fn register_command(&self, command: &PendingCommand) -> DomainResult<()> {
        let _guard = self.locks.lock(&command.device_id).await;

        if !self.registry.is_known(&command.device_id).await {
            return Err(DomainError::DeviceNotFound(command.device_id.clone()));
        }

        if let Some(previous) = self.store.put_pending_command(command.clone()).await? {
            self.timers.cancel(&previous.command_id).await;
            self.status_book
                .record(&previous, CommandStatus::Superseded)
                .await;
            info!(superseded = %previous.command_id, "pending command superseded");
        }

        self.status_book
            .record(command, CommandStatus::Pending)
            .await;
        Ok(())
    }

    /// Count another publish attempt of a still-pending command.
    /// Returns `None` once the command was resolved or superseded.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn retry_command(
        &self,
        device_id: &str,
        command_id: &str,
        deadline: DateTime<Utc>,
    ) -> DomainResult<Option<PendingCommand>> {
        let _guard = self.locks.lock(device_id).await;

        match self.store.get_pending_command(device_id).await? {
            Some(mut pending) if pending.command_id == command_id => {
                pending.attempts += 1;
                pending.deadline = deadline;
                self.store.put_pending_command(pending.clone()).await?;
                Ok(Some(pending))
            }
            _ => Ok(None),
        }
    }

    /// Drop a command that ran out of attempts and mark it failed.
    /// Returns false when it was no longer pending.
    #[instrument(skip_all, fields(device_id = %command.device_id, command_id = %command.command_id))]
    pub async fn expire_command(&self, command: &PendingCommand) -> DomainResult<bool> {
        let _guard = self.locks.lock(&command.device_id).await;

        let removed = self
            .store
            .delete_pending_command(&command.device_id, &command.command_id)
            .await?;
        if removed {
            warn!(
                attempts = command.attempts,
                error = %DomainError::CommandTimeout(command.command_id.clone()),
                "command failed"
            );
            self.status_book
                .record(command, CommandStatus::Failed)
                .await;
        }
        Ok(removed)
    }

    pub async fn pending_command(&self, device_id: &str) -> DomainResult<Option<PendingCommand>> {
        self.store.get_pending_command(device_id).await
    }

    async fn current_state(&self, device_id: &str) -> DomainResult<DeviceState> {
        self.store
            .get_device_state(device_id)
            .await?
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))
    }

    async fn publish_state(&self, state: &DeviceState, sync_status: SyncStatus) {
        self.notifier
            .publish(FeedEvent::StateChanged {
                state: state.clone(),
                sync_status,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InMemoryDeviceStore, MockFeedNotifier};
    use common::domain::{
        Color, DeviceCommand, DeviceRepository, MockDeviceStateStore, ReportedState,
    };
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn quiet_notifier() -> Arc<dyn FeedNotifier> {
        let mut notifier = MockFeedNotifier::new();
        notifier.expect_publish().returning(|_| ());
        Arc::new(notifier)
    }

    fn reconciler_over(store: Arc<InMemoryDeviceStore>) -> StateReconciler {
        let notifier = quiet_notifier();
        let registry = Arc::new(DeviceRegistry::new(
            store.clone(),
            notifier.clone(),
            Duration::from_secs(300),
        ));
        StateReconciler::new(
            store,
            registry,
            CommandTimers::new(),
            Arc::new(CommandStatusBook::new(notifier.clone())),
            notifier,
        )
    }

    fn telemetry(reported: ReportedState, secs: i64) -> Telemetry {
        Telemetry {
            device_id: "esp32-a".to_string(),
            reported,
            message_timestamp: at(secs),
            received_at: Utc::now(),
        }
    }

    fn brightness(value: i64) -> ReportedState {
        ReportedState {
            brightness: Some(value),
            ..Default::default()
        }
    }

    fn pending(command: DeviceCommand) -> PendingCommand {
        PendingCommand {
            command_id: xid::new().to_string(),
            device_id: "esp32-a".to_string(),
            command,
            session_id: Some("session-1".to_string()),
            attempts: 1,
            issued_at: at(0),
            deadline: at(5),
        }
    }

    #[tokio::test]
    async fn test_unknown_device_is_created_by_telemetry() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store.clone());

        let outcome = reconciler
            .ingest_telemetry(telemetry(brightness(40), 10))
            .await
            .unwrap();

        let ReconcileOutcome::Applied(applied) = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(applied.state.brightness, 40);
        assert_eq!(applied.sync_status, SyncStatus::Reported);
        assert!(store.get_device("esp32-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_classification() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store);

        reconciler
            .ingest_telemetry(telemetry(brightness(40), 10))
            .await
            .unwrap();

        let replay = reconciler
            .ingest_telemetry(telemetry(brightness(40), 10))
            .await
            .unwrap();
        assert_eq!(replay, ReconcileOutcome::Duplicate);

        let stale = reconciler
            .ingest_telemetry(telemetry(brightness(90), 5))
            .await
            .unwrap();
        assert_eq!(stale, ReconcileOutcome::StaleIgnored);
    }

    #[tokio::test]
    async fn test_brightness_clamped_before_merge() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store);

        let outcome = reconciler
            .ingest_telemetry(telemetry(brightness(250), 10))
            .await
            .unwrap();
        let ReconcileOutcome::Applied(applied) = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(applied.state.brightness, 100);
    }

    #[tokio::test]
    async fn test_matching_telemetry_confirms_pending_command() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store.clone());
        reconciler
            .ingest_announcement(Announcement::new("esp32-a", at(0)))
            .await
            .unwrap();

        let red = Color::new(255, 0, 0);
        let command = pending(DeviceCommand::SetColor(red));
        reconciler.register_command(&command).await.unwrap();

        // A report of some other field leaves the command pending
        let unrelated = reconciler
            .ingest_telemetry(telemetry(brightness(30), 10))
            .await
            .unwrap();
        let ReconcileOutcome::Applied(applied) = unrelated else {
            panic!("expected Applied");
        };
        assert_eq!(applied.sync_status, SyncStatus::Unconfirmed);

        let echo = ReportedState {
            color: Some((255, 0, 0)),
            ..Default::default()
        };
        let outcome = reconciler.ingest_telemetry(telemetry(echo, 11)).await.unwrap();
        let ReconcileOutcome::Applied(applied) = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(applied.sync_status, SyncStatus::Confirmed);
        assert_eq!(applied.resolved_command_id, Some(command.command_id.clone()));
        assert!(reconciler.pending_command("esp32-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_older_than_command_does_not_confirm() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store);
        reconciler
            .ingest_announcement(Announcement::new("esp32-a", at(0)))
            .await
            .unwrap();

        let mut command = pending(DeviceCommand::SetBrightness(30));
        command.issued_at = at(100);
        command.deadline = at(105);
        reconciler.register_command(&command).await.unwrap();

        // taken before issuance, delivered late
        let outcome = reconciler
            .ingest_telemetry(telemetry(brightness(30), 40))
            .await
            .unwrap();
        let ReconcileOutcome::Applied(applied) = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(applied.state.brightness, 30);
        assert_eq!(applied.sync_status, SyncStatus::Unconfirmed);
        assert_eq!(applied.resolved_command_id, None);
        assert!(reconciler.pending_command("esp32-a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_register_command_unknown_device() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store);

        let result = reconciler
            .register_command(&pending(DeviceCommand::SetPower(true)))
            .await;
        assert!(matches!(result, Err(DomainError::DeviceNotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_and_expire_only_current_command() {
        let store = Arc::new(InMemoryDeviceStore::new());
        let reconciler = reconciler_over(store);
        reconciler
            .ingest_announcement(Announcement::new("esp32-a", at(0)))
            .await
            .unwrap();

        let first = pending(DeviceCommand::SetPower(true));
        let second = pending(DeviceCommand::SetPower(false));
        reconciler.register_command(&first).await.unwrap();
        reconciler.register_command(&second).await.unwrap();

        let retried = reconciler
            .retry_command("esp32-a", &first.command_id, at(20))
            .await
            .unwrap();
        assert!(retried.is_none());
        assert!(!reconciler.expire_command(&first).await.unwrap());

        let retried = reconciler
            .retry_command("esp32-a", &second.command_id, at(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.deadline, at(20));
        assert!(reconciler.expire_command(&retried).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_failure_leaves_command_pending() {
        let mut store = MockDeviceStateStore::new();
        store
            .expect_get_device_state()
            .returning(|id| Ok(Some(DeviceState::initial(id, at(0)))));
        let command = pending(DeviceCommand::SetBrightness(40));
        let stored = command.clone();
        store
            .expect_get_pending_command()
            .returning(move |_| Ok(Some(stored.clone())));
        store
            .expect_commit_reconciliation()
            .times(1)
            .returning(|_, _| Err(DomainError::PersistenceFailure(anyhow::anyhow!("deadlock"))));

        let devices = Arc::new(InMemoryDeviceStore::new());
        let notifier = quiet_notifier();
        let registry = Arc::new(DeviceRegistry::new(
            devices,
            notifier.clone(),
            Duration::from_secs(300),
        ));
        let timers = CommandTimers::new();
        let token = timers.arm(&command.command_id).await;
        let book = Arc::new(CommandStatusBook::new(notifier.clone()));
        let reconciler =
            StateReconciler::new(Arc::new(store), registry, timers, book.clone(), notifier);

        let result = reconciler
            .ingest_telemetry(telemetry(brightness(40), 10))
            .await;

        assert!(matches!(result, Err(DomainError::PersistenceFailure(_))));
        assert!(!token.is_cancelled());
        assert!(book.status(&command.command_id).await.is_none());
    }
}

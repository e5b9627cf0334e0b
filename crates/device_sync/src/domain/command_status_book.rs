use chrono::{DateTime, Duration, Utc};
use common::domain::{CommandStatus, DeviceCommand, PendingCommand};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{FeedEvent, FeedNotifier};

/// Entry count above which terminal, no-longer-latest entries are pruned
const PRUNE_THRESHOLD: usize = 4096;

/// How long a resolved command stays visible to its session
const TERMINAL_RETENTION_SECS: i64 = 3600;

/// Minimum spacing of the time-based sweep run from `record`
const SWEEP_INTERVAL_SECS: i64 = 60;

/// Last known status of one issued command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatusEntry {
    pub command_id: String,
    pub device_id: String,
    pub session_id: Option<String>,
    pub command: DeviceCommand,
    pub status: CommandStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Book {
    by_command: HashMap<String, CommandStatusEntry>,
    /// (session, device) -> command id of the session's most recent command
    latest: HashMap<(Option<String>, String), String>,
    last_sweep: Option<DateTime<Utc>>,
}

impl Book {
    /// Drop terminal entries older than `cutoff` together with the session
    /// pointers to them. With `over_capacity`, terminal entries no session
    /// points at go regardless of age.
    fn prune(&mut self, cutoff: DateTime<Utc>, over_capacity: bool) {
        let Book {
            by_command, latest, ..
        } = self;
        let expired =
            |entry: &CommandStatusEntry| entry.status.is_terminal() && entry.updated_at < cutoff;

        latest.retain(|_, command_id| {
            by_command
                .get(command_id)
                .is_some_and(|entry| !expired(entry))
        });

        let referenced: HashSet<&String> = latest.values().collect();
        by_command.retain(|command_id, entry| {
            !entry.status.is_terminal()
                || referenced.contains(command_id)
                || (!over_capacity && !expired(entry))
        });
    }
}

/// Command statuses as seen by the sessions that issued them
///
/// Writes publish a `CommandStatusChanged` event. Entries for commands a
/// session has since replaced are dropped once they are terminal, and
/// terminal entries expire after the retention period.
pub struct CommandStatusBook {
    book: RwLock<Book>,
    notifier: Arc<dyn FeedNotifier>,
    retention: Duration,
}

impl CommandStatusBook {
    pub fn new(notifier: Arc<dyn FeedNotifier>) -> Self {
        Self::with_retention(notifier, Duration::seconds(TERMINAL_RETENTION_SECS))
    }

    pub fn with_retention(notifier: Arc<dyn FeedNotifier>, retention: Duration) -> Self {
        Self {
            book: RwLock::new(Book::default()),
            notifier,
            retention,
        }
    }

    /// Expire terminal entries resolved before `now - retention`
    pub async fn prune_expired(&self, now: DateTime<Utc>) {
        let mut book = self.book.write().await;
        book.prune(now - self.retention, false);
        book.last_sweep = Some(now);
    }

    /// Record a status transition
    pub async fn record(&self, command: &PendingCommand, status: CommandStatus) {
        {
            let mut book = self.book.write().await;
            let key = (command.session_id.clone(), command.device_id.clone());

            match book.latest.get(&key).cloned() {
                Some(latest_id) if latest_id != command.command_id => {
                    // Only the newest command of a session moves the "latest" pointer
                    if status == CommandStatus::Pending {
                        let replaced_terminal = book
                            .by_command
                            .get(&latest_id)
                            .is_some_and(|entry| entry.status.is_terminal());
                        if replaced_terminal {
                            book.by_command.remove(&latest_id);
                        }
                        book.latest.insert(key, command.command_id.clone());
                    }
                }
                Some(_) => {}
                None => {
                    book.latest.insert(key, command.command_id.clone());
                }
            }

            let now = Utc::now();
            book.by_command.insert(
                command.command_id.clone(),
                CommandStatusEntry {
                    command_id: command.command_id.clone(),
                    device_id: command.device_id.clone(),
                    session_id: command.session_id.clone(),
                    command: command.command,
                    status,
                    updated_at: now,
                },
            );

            let over_capacity = book.by_command.len() > PRUNE_THRESHOLD;
            let sweep_due = book
                .last_sweep
                .map_or(true, |last| now - last >= Duration::seconds(SWEEP_INTERVAL_SECS));
            if over_capacity || sweep_due {
                book.prune(now - self.retention, over_capacity);
                book.last_sweep = Some(now);
            }
        }

        debug!(
            command_id = %command.command_id,
            device_id = %command.device_id,
            status = %status,
            "command status recorded"
        );

        self.notifier
            .publish(FeedEvent::CommandStatusChanged {
                command_id: command.command_id.clone(),
                device_id: command.device_id.clone(),
                session_id: command.session_id.clone(),
                status,
            })
            .await;
    }

    pub async fn status(&self, command_id: &str) -> Option<CommandStatusEntry> {
        self.book.read().await.by_command.get(command_id).cloned()
    }

    /// Status of the most recent command `session_id` sent to `device_id`
    pub async fn latest_for(
        &self,
        session_id: Option<&str>,
        device_id: &str,
    ) -> Option<CommandStatusEntry> {
        let book = self.book.read().await;
        let key = (session_id.map(str::to_string), device_id.to_string());
        book.latest
            .get(&key)
            .and_then(|command_id| book.by_command.get(command_id))
            .cloned()
    }
}

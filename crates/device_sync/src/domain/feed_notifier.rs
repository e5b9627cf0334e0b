use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::domain::{CommandStatus, DeviceState};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use super::SyncStatus;

/// Change notification for readers of device state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    StateChanged {
        state: DeviceState,
        sync_status: SyncStatus,
    },
    CommandStatusChanged {
        command_id: String,
        device_id: String,
        session_id: Option<String>,
        status: CommandStatus,
    },
    LivenessChanged {
        device_id: String,
        online: bool,
        last_seen: DateTime<Utc>,
    },
    DeviceRenamed {
        device_id: String,
        friendly_name: Option<String>,
    },
}

impl FeedEvent {
    pub fn device_id(&self) -> &str {
        match self {
            FeedEvent::StateChanged { state, .. } => &state.device_id,
            FeedEvent::CommandStatusChanged { device_id, .. }
            | FeedEvent::LivenessChanged { device_id, .. }
            | FeedEvent::DeviceRenamed { device_id, .. } => device_id,
        }
    }
}

/// Delivery of feed events to readers
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait FeedNotifier: Send + Sync {
    /// Deliver an event; must not fail or block on slow readers
    async fn publish(&self, event: FeedEvent);
}

/// Push delivery over a broadcast channel
///
/// Subscribers that fall behind by more than the channel capacity receive
/// `RecvError::Lagged` and should re-read the device list.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<FeedEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl FeedNotifier for BroadcastNotifier {
    async fn publish(&self, event: FeedEvent) {
        if self.sender.send(event).is_err() {
            debug!("no feed subscribers");
        }
    }
}

/// A batch of events returned to a polling reader
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub events: Vec<FeedEvent>,
    /// Cursor to pass to the next poll
    pub next_cursor: u64,
    /// Events between the given cursor and the first returned one were evicted
    pub truncated: bool,
}

struct PollBuffer {
    events: VecDeque<(u64, FeedEvent)>,
    next_seq: u64,
}

/// Pull delivery: a bounded, sequence-numbered event log
pub struct PollingNotifier {
    capacity: usize,
    buffer: Mutex<PollBuffer>,
}

impl PollingNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(PollBuffer {
                events: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    /// Events with sequence number `>= cursor`. Start from cursor 0.
    pub async fn poll_since(&self, cursor: u64) -> FeedPage {
        let buffer = self.buffer.lock().await;
        let oldest = buffer
            .events
            .front()
            .map(|(seq, _)| *seq)
            .unwrap_or(buffer.next_seq);

        FeedPage {
            events: buffer
                .events
                .iter()
                .filter(|(seq, _)| *seq >= cursor)
                .map(|(_, event)| event.clone())
                .collect(),
            next_cursor: buffer.next_seq.max(cursor),
            truncated: cursor < oldest,
        }
    }
}

#[async_trait]
impl FeedNotifier for PollingNotifier {
    async fn publish(&self, event: FeedEvent) {
        let mut buffer = self.buffer.lock().await;
        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        buffer.events.push_back((seq, event));
        while buffer.events.len() > self.capacity {
            buffer.events.pop_front();
        }
    }
}

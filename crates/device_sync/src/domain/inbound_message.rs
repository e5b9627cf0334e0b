use chrono::{DateTime, Utc};
use common::domain::{ReportedState, DEFAULT_DEVICE_TYPE};

/// A state report published by a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telemetry {
    pub device_id: String,
    pub reported: ReportedState,
    /// Device-assigned time of the report; orders field updates
    pub message_timestamp: DateTime<Utc>,
    /// Local receive time; drives liveness
    pub received_at: DateTime<Utc>,
}

/// A device announcing itself after boot or reconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub device_id: String,
    pub device_type: String,
    pub message_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl Announcement {
    pub fn new(device_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            message_timestamp: at,
            received_at: at,
        }
    }
}

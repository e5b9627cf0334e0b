use chrono::{DateTime, Utc};
use common::domain::{
    Color, DomainError, DomainResult, Effect, PendingCommand, ReportedState, DEFAULT_DEVICE_TYPE,
};
use serde::{Deserialize, Serialize};

use crate::domain::{Announcement, Telemetry};

/// Body of a `devices/announce` message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnnouncementPayload {
    pub device_id: String,
    #[serde(rename = "type", default)]
    pub device_type: Option<String>,
    /// Epoch milliseconds
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ColorPayload {
    #[serde(default)]
    pub r: i64,
    #[serde(default)]
    pub g: i64,
    #[serde(default)]
    pub b: i64,
}

/// Body of a `lights/{device_id}/state` message; every state field is optional
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default)]
    pub brightness: Option<i64>,
    #[serde(default)]
    pub color: Option<ColorPayload>,
    #[serde(default)]
    pub effect: Option<String>,
    /// Epoch milliseconds
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Body of a `lights/{device_id}/set` message. Only the commanded field is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandPayload {
    pub command_id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
}

impl From<&PendingCommand> for CommandPayload {
    fn from(pending: &PendingCommand) -> Self {
        let target = pending.command.target();
        CommandPayload {
            command_id: pending.command_id.clone(),
            timestamp: pending.issued_at.timestamp_millis(),
            power: target.power,
            brightness: target.brightness,
            color: target.color,
            effect: target.effect,
        }
    }
}

/// Message time from an optional epoch-millisecond field, falling back to receive time
fn message_time(timestamp: Option<i64>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or(received_at)
}

fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> DomainResult<T> {
    serde_json::from_slice(payload).map_err(|e| DomainError::MalformedPayload(e.to_string()))
}

pub fn decode_announcement(payload: &[u8], received_at: DateTime<Utc>) -> DomainResult<Announcement> {
    let body: AnnouncementPayload = decode(payload)?;
    if body.device_id.trim().is_empty() {
        return Err(DomainError::MalformedPayload(
            "announcement without device_id".to_string(),
        ));
    }

    Ok(Announcement {
        device_id: body.device_id.trim().to_string(),
        device_type: body
            .device_type
            .filter(|device_type| !device_type.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DEVICE_TYPE.to_string()),
        message_timestamp: message_time(body.timestamp, received_at),
        received_at,
    })
}

/// Decode a state report; the topic's device id wins and must match the body's
pub fn decode_telemetry(
    topic_device_id: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> DomainResult<Telemetry> {
    let body: TelemetryPayload = decode(payload)?;

    if let Some(body_device_id) = body.device_id.as_deref() {
        if body_device_id != topic_device_id {
            return Err(DomainError::MalformedPayload(format!(
                "device_id '{}' does not match topic device '{}'",
                body_device_id, topic_device_id
            )));
        }
    }

    Ok(Telemetry {
        device_id: topic_device_id.to_string(),
        reported: ReportedState {
            power: body.power,
            brightness: body.brightness,
            color: body.color.map(|c| (c.r, c.g, c.b)),
            effect: body.effect,
        },
        message_timestamp: message_time(body.timestamp, received_at),
        received_at,
    })
}

pub fn encode_command(pending: &PendingCommand) -> DomainResult<Vec<u8>> {
    serde_json::to_vec(&CommandPayload::from(pending))
        .map_err(|e| DomainError::MalformedPayload(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::DeviceCommand;
    use serde_json::json;

    fn received() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_100, 0).unwrap()
    }

    #[test]
    fn test_decode_full_telemetry() {
        let payload = json!({
            "device_id": "esp32-a",
            "power": true,
            "brightness": 180,
            "color": {"r": 255, "g": 0, "b": -4},
            "effect": "Rainbow",
            "timestamp": 1_700_000_000_123i64,
        });

        let telemetry =
            decode_telemetry("esp32-a", payload.to_string().as_bytes(), received()).unwrap();

        assert_eq!(telemetry.reported.brightness, Some(180));
        assert_eq!(telemetry.reported.color, Some((255, 0, -4)));
        assert_eq!(
            telemetry.message_timestamp,
            DateTime::from_timestamp_millis(1_700_000_000_123).unwrap()
        );
        // clamping happens during reconciliation
        let fields = telemetry.reported.normalize();
        assert_eq!(fields.brightness, Some(100));
        assert_eq!(fields.color, Some(Color::new(255, 0, 0)));
        assert_eq!(fields.effect, Some(Effect::Rainbow));
    }

    #[test]
    fn test_missing_timestamp_uses_receive_time() {
        let telemetry = decode_telemetry("esp32-a", br#"{"power": false}"#, received()).unwrap();
        assert_eq!(telemetry.message_timestamp, received());
        assert_eq!(telemetry.reported.power, Some(false));
    }

    #[test]
    fn test_device_mismatch_rejected() {
        let result = decode_telemetry("esp32-a", br#"{"device_id": "esp32-b"}"#, received());
        assert!(matches!(result, Err(DomainError::MalformedPayload(_))));
    }

    #[test]
    fn test_invalid_json_rejected() {
        let result = decode_telemetry("esp32-a", b"not json", received());
        assert!(matches!(result, Err(DomainError::MalformedPayload(_))));
    }

    #[test]
    fn test_decode_announcement_defaults_type() {
        let announcement =
            decode_announcement(br#"{"device_id": "esp32-a"}"#, received()).unwrap();
        assert_eq!(announcement.device_type, DEFAULT_DEVICE_TYPE);
        assert_eq!(announcement.message_timestamp, received());

        let typed =
            decode_announcement(br#"{"device_id": "esp32-a", "type": "matrix"}"#, received())
                .unwrap();
        assert_eq!(typed.device_type, "matrix");
    }

    #[test]
    fn test_announcement_requires_device_id() {
        assert!(decode_announcement(br#"{"device_id": ""}"#, received()).is_err());
        assert!(decode_announcement(br#"{"type": "led_strip"}"#, received()).is_err());
    }

    #[test]
    fn test_command_payload_carries_only_target_field() {
        let pending = PendingCommand {
            command_id: "cmd-1".to_string(),
            device_id: "esp32-a".to_string(),
            command: DeviceCommand::SetColor(Color::new(255, 0, 0)),
            session_id: None,
            attempts: 1,
            issued_at: received(),
            deadline: received(),
        };

        let json: serde_json::Value =
            serde_json::from_slice(&encode_command(&pending).unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "command_id": "cmd-1",
                "timestamp": 1_700_000_100_000i64,
                "color": {"r": 255, "g": 0, "b": 0},
            })
        );
    }
}

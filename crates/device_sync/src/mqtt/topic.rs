use common::domain::{DomainError, DomainResult};

/// Topic devices announce themselves on
pub const ANNOUNCE_TOPIC: &str = "devices/announce";

/// Subscription filter for device telemetry
pub const TELEMETRY_TOPIC_FILTER: &str = "lights/+/state";

const LIGHTS_PREFIX: &str = "lights";
const STATE_SUFFIX: &str = "state";
const COMMAND_SUFFIX: &str = "set";

/// Inbound topics the core consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    Announce,
    Telemetry { device_id: String },
}

/// Classify an inbound topic
///
/// ```
/// use device_sync::mqtt::{parse_topic, InboundTopic};
///
/// let topic = parse_topic("lights/esp32-a1b2/state").unwrap();
/// assert_eq!(topic, InboundTopic::Telemetry { device_id: "esp32-a1b2".to_string() });
/// ```
pub fn parse_topic(topic: &str) -> DomainResult<InboundTopic> {
    if topic == ANNOUNCE_TOPIC {
        return Ok(InboundTopic::Announce);
    }

    match topic.split('/').collect::<Vec<_>>().as_slice() {
        [LIGHTS_PREFIX, device_id, STATE_SUFFIX] => {
            let device_id = device_id.trim();
            if device_id.is_empty() {
                return Err(DomainError::InvalidTopic(format!(
                    "device ID cannot be empty in topic '{}'",
                    topic
                )));
            }
            Ok(InboundTopic::Telemetry {
                device_id: device_id.to_string(),
            })
        }
        _ => Err(DomainError::InvalidTopic(format!(
            "unexpected topic '{}': expected '{}' or 'lights/{{device_id}}/state'",
            topic, ANNOUNCE_TOPIC
        ))),
    }
}

/// Topic a device listens on for commands
pub fn command_topic(device_id: &str) -> String {
    format!("{}/{}/{}", LIGHTS_PREFIX, device_id, COMMAND_SUFFIX)
}

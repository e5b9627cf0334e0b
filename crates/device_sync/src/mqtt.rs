mod payload;
mod publisher;
pub(crate) mod subscriber;
mod topic;

pub use payload::*;
pub use publisher::MqttCommandPublisher;
pub use subscriber::{create_mqtt_transport, parse_broker_url, run_mqtt_subscriber};
pub use topic::*;

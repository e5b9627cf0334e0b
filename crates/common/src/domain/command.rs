use crate::domain::device_state::{Color, Effect, StateField, StateFields};
use crate::domain::result::{DomainError, DomainResult};
use crate::garde::validate_struct;
use garde::Validate;
use serde::{Deserialize, Serialize};

/// Command as requested by a user, before validation
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub enum CommandRequest {
    SetPower(#[garde(skip)] bool),
    SetBrightness(#[garde(range(min = 0, max = 100))] i64),
    SetColor {
        #[garde(range(min = 0, max = 255))]
        r: i64,
        #[garde(range(min = 0, max = 255))]
        g: i64,
        #[garde(range(min = 0, max = 255))]
        b: i64,
    },
    SetEffect(#[garde(custom(known_effect))] String),
}

fn known_effect(value: &str, _context: &()) -> garde::Result {
    value
        .parse::<Effect>()
        .map(|_| ())
        .map_err(|_| garde::Error::new(format!("unknown effect '{}'", value)))
}

/// Input for issuing a command to a device
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct IssueCommandInput {
    #[garde(length(min = 1))]
    pub device_id: String,
    /// Session that issued the command; drives read-your-writes
    #[garde(skip)]
    pub session_id: Option<String>,
    #[garde(dive)]
    pub command: CommandRequest,
}

/// A validated desired-state instruction for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeviceCommand {
    SetPower(bool),
    SetBrightness(u8),
    SetColor(Color),
    SetEffect(Effect),
}

impl DeviceCommand {
    /// The single state field this command targets
    pub fn field(&self) -> StateField {
        match self {
            DeviceCommand::SetPower(_) => StateField::Power,
            DeviceCommand::SetBrightness(_) => StateField::Brightness,
            DeviceCommand::SetColor(_) => StateField::Color,
            DeviceCommand::SetEffect(_) => StateField::Effect,
        }
    }

    /// Desired state expressed as a partial field set
    pub fn target(&self) -> StateFields {
        match *self {
            DeviceCommand::SetPower(power) => StateFields {
                power: Some(power),
                ..Default::default()
            },
            DeviceCommand::SetBrightness(brightness) => StateFields {
                brightness: Some(brightness),
                ..Default::default()
            },
            DeviceCommand::SetColor(color) => StateFields {
                color: Some(color),
                ..Default::default()
            },
            DeviceCommand::SetEffect(effect) => StateFields {
                effect: Some(effect),
                ..Default::default()
            },
        }
    }

    /// Whether `fields` carry exactly the commanded value
    pub fn is_satisfied_by(&self, fields: &StateFields) -> bool {
        match *self {
            DeviceCommand::SetPower(power) => fields.power == Some(power),
            DeviceCommand::SetBrightness(brightness) => fields.brightness == Some(brightness),
            DeviceCommand::SetColor(color) => fields.color == Some(color),
            DeviceCommand::SetEffect(effect) => fields.effect == Some(effect),
        }
    }
}

impl TryFrom<CommandRequest> for DeviceCommand {
    type Error = DomainError;

    fn try_from(request: CommandRequest) -> DomainResult<Self> {
        validate_struct(&request)?;

        let command = match request {
            CommandRequest::SetPower(power) => DeviceCommand::SetPower(power),
            CommandRequest::SetBrightness(brightness) => {
                DeviceCommand::SetBrightness(u8::try_from(brightness).map_err(|_| {
                    DomainError::ValidationError(format!("brightness {} out of range", brightness))
                })?)
            }
            CommandRequest::SetColor { r, g, b } => {
                DeviceCommand::SetColor(Color::clamped(r, g, b))
            }
            CommandRequest::SetEffect(name) => DeviceCommand::SetEffect(name.parse()?),
        };

        Ok(command)
    }
}

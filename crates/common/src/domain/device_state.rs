use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::PendingCommand;

pub const MIN_BRIGHTNESS: u8 = 0;
pub const MAX_BRIGHTNESS: u8 = 100;
pub const DEFAULT_BRIGHTNESS: u8 = 100;

/// RGB color with 8-bit channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color {
        r: 255,
        g: 255,
        b: 255,
    };

    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Build a color from untrusted channel values, clamping each into 0..=255
    pub fn clamped(r: i64, g: i64, b: i64) -> Self {
        Self {
            r: clamp_channel(r),
            g: clamp_channel(g),
            b: clamp_channel(b),
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, u8::MAX as i64) as u8
}

/// Clamp an untrusted brightness value into the declared 0..=100 range
pub fn clamp_brightness(value: i64) -> u8 {
    value.clamp(MIN_BRIGHTNESS as i64, MAX_BRIGHTNESS as i64) as u8
}

/// Animation effects supported by the LED strip firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    #[default]
    None,
    Rainbow,
    Breathing,
    Chase,
    Sparkle,
    Fire,
    Confetti,
    Cylon,
    Strobe,
    Ocean,
    Aurora,
    Candle,
    Christmas,
    Usa,
}

impl Effect {
    pub const ALL: [Effect; 14] = [
        Effect::None,
        Effect::Rainbow,
        Effect::Breathing,
        Effect::Chase,
        Effect::Sparkle,
        Effect::Fire,
        Effect::Confetti,
        Effect::Cylon,
        Effect::Strobe,
        Effect::Ocean,
        Effect::Aurora,
        Effect::Candle,
        Effect::Christmas,
        Effect::Usa,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Rainbow => "rainbow",
            Effect::Breathing => "breathing",
            Effect::Chase => "chase",
            Effect::Sparkle => "sparkle",
            Effect::Fire => "fire",
            Effect::Confetti => "confetti",
            Effect::Cylon => "cylon",
            Effect::Strobe => "strobe",
            Effect::Ocean => "ocean",
            Effect::Aurora => "aurora",
            Effect::Candle => "candle",
            Effect::Christmas => "christmas",
            Effect::Usa => "usa",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effect {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Effect::ALL
            .iter()
            .find(|effect| effect.as_str() == wanted)
            .copied()
            .ok_or_else(|| {
                DomainError::ValidationError(format!(
                    "unknown effect '{}', expected one of: {}",
                    s,
                    Effect::ALL
                        .iter()
                        .map(Effect::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Individually reconciled fields of a device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    Power,
    Brightness,
    Color,
    Effect,
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateField::Power => "power",
            StateField::Brightness => "brightness",
            StateField::Color => "color",
            StateField::Effect => "effect",
        };
        f.write_str(name)
    }
}

/// A partial, already-normalized set of state values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateFields {
    pub power: Option<bool>,
    pub brightness: Option<u8>,
    pub color: Option<Color>,
    pub effect: Option<Effect>,
}

impl StateFields {
    pub fn is_empty(&self) -> bool {
        self.power.is_none()
            && self.brightness.is_none()
            && self.color.is_none()
            && self.effect.is_none()
    }

    pub fn contains(&self, field: StateField) -> bool {
        match field {
            StateField::Power => self.power.is_some(),
            StateField::Brightness => self.brightness.is_some(),
            StateField::Color => self.color.is_some(),
            StateField::Effect => self.effect.is_some(),
        }
    }

    pub fn fields(&self) -> Vec<StateField> {
        [
            StateField::Power,
            StateField::Brightness,
            StateField::Color,
            StateField::Effect,
        ]
        .into_iter()
        .filter(|field| self.contains(*field))
        .collect()
    }
}

/// Device-reported values as they arrive off the wire, before clamping
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportedState {
    pub power: Option<bool>,
    pub brightness: Option<i64>,
    pub color: Option<(i64, i64, i64)>,
    pub effect: Option<String>,
}

impl ReportedState {
    /// Clamp numeric values into bounds. Unknown effect names are dropped.
    pub fn normalize(&self) -> StateFields {
        StateFields {
            power: self.power,
            brightness: self.brightness.map(clamp_brightness),
            color: self.color.map(|(r, g, b)| Color::clamped(r, g, b)),
            effect: self
                .effect
                .as_deref()
                .and_then(|name| name.parse::<Effect>().ok()),
        }
    }
}

/// Message timestamp that last wrote each field; `None` until first report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldTimestamps {
    pub power_at: Option<DateTime<Utc>>,
    pub brightness_at: Option<DateTime<Utc>>,
    pub color_at: Option<DateTime<Utc>>,
    pub effect_at: Option<DateTime<Utc>>,
}

impl FieldTimestamps {
    pub fn get(&self, field: StateField) -> Option<DateTime<Utc>> {
        match field {
            StateField::Power => self.power_at,
            StateField::Brightness => self.brightness_at,
            StateField::Color => self.color_at,
            StateField::Effect => self.effect_at,
        }
    }

    fn set(&mut self, field: StateField, at: DateTime<Utc>) {
        match field {
            StateField::Power => self.power_at = Some(at),
            StateField::Brightness => self.brightness_at = Some(at),
            StateField::Color => self.color_at = Some(at),
            StateField::Effect => self.effect_at = Some(at),
        }
    }

    /// Strictly newer wins; an identical timestamp is a duplicate
    pub fn accepts(&self, field: StateField, at: DateTime<Utc>) -> bool {
        self.get(field).is_none_or(|stored| at > stored)
    }
}

/// Authoritative state of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub power: bool,
    pub brightness: u8,
    pub color: Color,
    pub effect: Effect,
    pub field_timestamps: FieldTimestamps,
    pub updated_at: DateTime<Utc>,
}

/// Result of merging a set of fields into a state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateMerge {
    /// Fields whose timestamp won; their values are now stored
    pub accepted: StateFields,
    /// Whether any stored value differs from before the merge
    pub changed: bool,
}

impl DeviceState {
    /// State given to a device on first sight: off, full brightness, white, no effect
    pub fn initial(device_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            power: false,
            brightness: DEFAULT_BRIGHTNESS,
            color: Color::WHITE,
            effect: Effect::None,
            field_timestamps: FieldTimestamps::default(),
            updated_at: created_at,
        }
    }

    /// Per-field last-writer-wins merge keyed by the message timestamp
    pub fn merge(&mut self, fields: &StateFields, at: DateTime<Utc>) -> StateMerge {
        let mut merge = StateMerge::default();

        if let Some(power) = fields.power {
            if self.field_timestamps.accepts(StateField::Power, at) {
                merge.changed |= self.power != power;
                self.power = power;
                self.field_timestamps.set(StateField::Power, at);
                merge.accepted.power = Some(power);
            }
        }
        if let Some(brightness) = fields.brightness {
            if self.field_timestamps.accepts(StateField::Brightness, at) {
                merge.changed |= self.brightness != brightness;
                self.brightness = brightness;
                self.field_timestamps.set(StateField::Brightness, at);
                merge.accepted.brightness = Some(brightness);
            }
        }
        if let Some(color) = fields.color {
            if self.field_timestamps.accepts(StateField::Color, at) {
                merge.changed |= self.color != color;
                self.color = color;
                self.field_timestamps.set(StateField::Color, at);
                merge.accepted.color = Some(color);
            }
        }
        if let Some(effect) = fields.effect {
            if self.field_timestamps.accepts(StateField::Effect, at) {
                merge.changed |= self.effect != effect;
                self.effect = effect;
                self.field_timestamps.set(StateField::Effect, at);
                merge.accepted.effect = Some(effect);
            }
        }

        if !merge.accepted.is_empty() && at > self.updated_at {
            self.updated_at = at;
        }

        merge
    }
}

/// Input for a per-field upsert of a device state
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertDeviceStateInput {
    pub device_id: String,
    pub fields: StateFields,
    /// Message timestamp the fields were reported at
    pub updated_at: DateTime<Utc>,
}

/// Persistence interface for device state and pending commands
///
/// Implementations must apply `upsert_device_state` atomically and reject
/// any field whose stored timestamp is not older than `updated_at`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceStateStore: Send + Sync {
    /// Current state of a device
    async fn get_device_state(&self, device_id: &str) -> DomainResult<Option<DeviceState>>;

    /// States of every known device
    async fn list_device_states(&self) -> DomainResult<Vec<DeviceState>>;

    /// Merge fields into the stored state, skipping stale fields
    async fn upsert_device_state(&self, input: UpsertDeviceStateInput)
        -> DomainResult<DeviceState>;

    /// Pending command of a device, if any
    async fn get_pending_command(&self, device_id: &str) -> DomainResult<Option<PendingCommand>>;

    /// Store a pending command, returning the one it replaced
    async fn put_pending_command(
        &self,
        command: PendingCommand,
    ) -> DomainResult<Option<PendingCommand>>;

    /// Delete the pending command if it is still the one identified by `command_id`
    async fn delete_pending_command(&self, device_id: &str, command_id: &str)
        -> DomainResult<bool>;

    /// Apply a state upsert and resolve a pending command in one transaction
    async fn commit_reconciliation(
        &self,
        input: UpsertDeviceStateInput,
        resolved_command_id: Option<String>,
    ) -> DomainResult<DeviceState>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_initial_state_defaults() {
        let state = DeviceState::initial("esp-01", at(0));
        assert!(!state.power);
        assert_eq!(state.brightness, 100);
        assert_eq!(state.color, Color::WHITE);
        assert_eq!(state.effect, Effect::None);
        assert_eq!(state.field_timestamps, FieldTimestamps::default());
    }

    #[test]
    fn test_clamp_brightness() {
        assert_eq!(clamp_brightness(150), 100);
        assert_eq!(clamp_brightness(-3), 0);
        assert_eq!(clamp_brightness(42), 42);
    }

    #[test]
    fn test_color_clamped() {
        assert_eq!(Color::clamped(300, -1, 128), Color::new(255, 0, 128));
    }

    #[test]
    fn test_effect_parse_is_case_insensitive() {
        assert_eq!("Rainbow".parse::<Effect>().unwrap(), Effect::Rainbow);
        assert_eq!("  usa ".parse::<Effect>().unwrap(), Effect::Usa);
    }

    #[test]
    fn test_effect_parse_unknown() {
        let result = "disco".parse::<Effect>();
        assert!(matches!(result, Err(DomainError::ValidationError(_))));
    }

    #[test]
    fn test_effect_catalog_round_trips_names() {
        for effect in Effect::ALL {
            assert_eq!(effect.as_str().parse::<Effect>().unwrap(), effect);
        }
    }

    #[test]
    fn test_normalize_clamps_and_drops_unknown_effect() {
        let reported = ReportedState {
            power: Some(true),
            brightness: Some(250),
            color: Some((256, 10, -20)),
            effect: Some("disco".to_string()),
        };
        let fields = reported.normalize();
        assert_eq!(fields.power, Some(true));
        assert_eq!(fields.brightness, Some(100));
        assert_eq!(fields.color, Some(Color::new(255, 10, 0)));
        assert_eq!(fields.effect, None);
    }

    #[test]
    fn test_merge_accepts_first_report() {
        let mut state = DeviceState::initial("esp-01", at(0));
        let fields = StateFields {
            brightness: Some(40),
            ..Default::default()
        };
        let merge = state.merge(&fields, at(10));
        assert!(merge.changed);
        assert_eq!(merge.accepted.brightness, Some(40));
        assert_eq!(state.brightness, 40);
        assert_eq!(state.field_timestamps.brightness_at, Some(at(10)));
        assert_eq!(state.updated_at, at(10));
    }

    #[test]
    fn test_merge_ignores_older_field() {
        let mut state = DeviceState::initial("esp-01", at(0));
        state.merge(
            &StateFields {
                brightness: Some(40),
                ..Default::default()
            },
            at(10),
        );
        let merge = state.merge(
            &StateFields {
                brightness: Some(90),
                ..Default::default()
            },
            at(5),
        );
        assert!(!merge.changed);
        assert!(merge.accepted.is_empty());
        assert_eq!(state.brightness, 40);
    }

    #[test]
    fn test_merge_identical_timestamp_is_noop() {
        let mut state = DeviceState::initial("esp-01", at(0));
        let fields = StateFields {
            power: Some(true),
            ..Default::default()
        };
        state.merge(&fields, at(10));
        let before = state.clone();
        let merge = state.merge(&fields, at(10));
        assert!(merge.accepted.is_empty());
        assert_eq!(state, before);
    }

    #[test]
    fn test_merge_is_per_field() {
        let mut state = DeviceState::initial("esp-01", at(0));
        state.merge(
            &StateFields {
                color: Some(Color::new(255, 0, 0)),
                ..Default::default()
            },
            at(20),
        );

        // Older message still wins for a field it is the newest writer of
        let merge = state.merge(
            &StateFields {
                color: Some(Color::new(0, 0, 255)),
                effect: Some(Effect::Fire),
                ..Default::default()
            },
            at(15),
        );
        assert_eq!(merge.accepted.effect, Some(Effect::Fire));
        assert_eq!(merge.accepted.color, None);
        assert_eq!(state.color, Color::new(255, 0, 0));
        assert_eq!(state.effect, Effect::Fire);
        assert_eq!(state.updated_at, at(20));
    }

    #[test]
    fn test_merge_same_value_newer_timestamp_is_accepted_but_unchanged() {
        let mut state = DeviceState::initial("esp-01", at(0));
        let merge = state.merge(
            &StateFields {
                effect: Some(Effect::None),
                ..Default::default()
            },
            at(0) + Duration::seconds(1),
        );
        assert_eq!(merge.accepted.effect, Some(Effect::None));
        assert!(!merge.changed);
    }

    #[test]
    fn test_state_fields_listing() {
        let fields = StateFields {
            power: Some(false),
            effect: Some(Effect::Candle),
            ..Default::default()
        };
        assert_eq!(fields.fields(), vec![StateField::Power, StateField::Effect]);
        assert!(!fields.is_empty());
        assert!(StateFields::default().is_empty());
    }
}

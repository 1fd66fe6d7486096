use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    immediate::ImmediateEventQueue,
    midi::{
        ChannelMessage, MIDI_CMD_BENDER, MIDI_CMD_CHANNEL_PRESSURE, MIDI_CMD_CONTROL,
        MIDI_CMD_PGM_CHANGE, midi_event_type,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    MidiCc,
    MidiPgmChange,
    MidiPitchBender,
    MidiChannelPressure,
}

/// Identity of one MIDI-addressable control: kind, channel and (for
/// controllers) the controller number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub kind: ParameterKind,
    pub channel: u8,
    pub id: u8,
}

impl Parameter {
    #[must_use]
    pub const fn cc(channel: u8, controller: u8) -> Self {
        Self {
            kind: ParameterKind::MidiCc,
            channel,
            id: controller,
        }
    }

    #[must_use]
    pub const fn program_change(channel: u8) -> Self {
        Self {
            kind: ParameterKind::MidiPgmChange,
            channel,
            id: 0,
        }
    }

    #[must_use]
    pub const fn pitch_bender(channel: u8) -> Self {
        Self {
            kind: ParameterKind::MidiPitchBender,
            channel,
            id: 0,
        }
    }

    #[must_use]
    pub const fn channel_pressure(channel: u8) -> Self {
        Self {
            kind: ParameterKind::MidiChannelPressure,
            channel,
            id: 0,
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> ParameterDescriptor {
        match self.kind {
            ParameterKind::MidiPitchBender => ParameterDescriptor {
                lower: 0.0,
                upper: 16_383.0,
                normal: 8_192.0,
            },
            ParameterKind::MidiCc
            | ParameterKind::MidiPgmChange
            | ParameterKind::MidiChannelPressure => ParameterDescriptor {
                lower: 0.0,
                upper: 127.0,
                normal: 0.0,
            },
        }
    }

    /// Encodes `value` as the MIDI message this parameter drives. Returns the
    /// buffer and the number of bytes used.
    #[must_use]
    pub fn encode(&self, value: f64) -> ([u8; 3], usize) {
        let channel = self.channel & 0x0F;
        let value = value as i32;
        match self.kind {
            ParameterKind::MidiCc => (
                [MIDI_CMD_CONTROL | channel, self.id & 0x7F, (value & 0x7F) as u8],
                3,
            ),
            ParameterKind::MidiPgmChange => {
                ([MIDI_CMD_PGM_CHANGE | channel, (value & 0x7F) as u8, 0], 2)
            }
            ParameterKind::MidiChannelPressure => (
                [MIDI_CMD_CHANNEL_PRESSURE | channel, (value & 0x7F) as u8, 0],
                2,
            ),
            ParameterKind::MidiPitchBender => (
                [
                    MIDI_CMD_BENDER | channel,
                    (value & 0x7F) as u8,
                    ((value >> 7) & 0x7F) as u8,
                ],
                3,
            ),
        }
    }
}

/// The parameter a raw MIDI event addresses, and the value it carries.
#[must_use]
pub fn midi_parameter(bytes: &[u8]) -> Option<(Parameter, f64)> {
    match ChannelMessage::parse(bytes) {
        ChannelMessage::Controller {
            channel,
            controller,
            value,
        } => Some((Parameter::cc(channel, controller), f64::from(value))),
        ChannelMessage::ProgramChange { channel, program } => {
            Some((Parameter::program_change(channel), f64::from(program)))
        }
        ChannelMessage::ChannelPressure { channel, pressure } => {
            Some((Parameter::channel_pressure(channel), f64::from(pressure)))
        }
        ChannelMessage::PitchBend { channel, value } => {
            Some((Parameter::pitch_bender(channel), f64::from(value)))
        }
        ChannelMessage::NoteOn { .. } | ChannelMessage::NoteOff { .. } | ChannelMessage::Other => {
            None
        }
    }
}

#[must_use]
pub fn controller_name(controller: u8) -> Option<&'static str> {
    Some(match controller {
        0 => "Bank Select",
        1 => "Modulation",
        2 => "Breath",
        4 => "Foot Controller",
        5 => "Portamento Time",
        7 => "Volume",
        8 => "Balance",
        10 => "Pan",
        11 => "Expression",
        64 => "Sustain",
        65 => "Portamento",
        66 => "Sostenuto",
        67 => "Soft Pedal",
        71 => "Resonance",
        74 => "Brightness",
        91 => "Reverb",
        93 => "Chorus",
        _ => return None,
    })
}

/// Human-readable parameter name. Channels are shown 1-based.
#[must_use]
pub fn describe_parameter(parameter: Parameter) -> String {
    let channel = u16::from(parameter.channel) + 1;
    match parameter.kind {
        ParameterKind::MidiCc => match controller_name(parameter.id) {
            Some(name) => format!("{name} [{channel}]"),
            None => format!("Controller {} [{channel}]", parameter.id),
        },
        ParameterKind::MidiPgmChange => format!("Program [{channel}]"),
        ParameterKind::MidiPitchBender => format!("Bender [{channel}]"),
        ParameterKind::MidiChannelPressure => format!("Pressure [{channel}]"),
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe_parameter(*self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub lower: f64,
    pub upper: f64,
    pub normal: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoState {
    #[default]
    Off,
    Play,
    Write,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationEvent {
    /// Position in beats relative to the owning region's source start.
    pub when: f64,
    pub value: f64,
}

/// Time-indexed value list, linearly interpolated between events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutomationList {
    events: Vec<AutomationEvent>,
}

impl AutomationList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a list from arbitrary points; non-finite points are dropped.
    #[must_use]
    pub fn from_points(points: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut list = Self::new();
        for (when, value) in points {
            list.add(when, value);
        }
        list
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn events(&self) -> &[AutomationEvent] {
        &self.events
    }

    /// Inserts a point, replacing one already at `when`.
    pub fn add(&mut self, when: f64, value: f64) {
        if !when.is_finite() || !value.is_finite() {
            return;
        }
        let event = AutomationEvent { when, value };
        let index = self.events.partition_point(|existing| existing.when < when);
        match self.events.get_mut(index) {
            Some(existing) if (existing.when - when).abs() <= f64::EPSILON => *existing = event,
            _ => self.events.insert(index, event),
        }
    }

    /// Value at `when`. Before the first and after the last event the list
    /// holds the nearest value. `None` for an empty list.
    #[must_use]
    pub fn eval(&self, when: f64) -> Option<f64> {
        let first = self.events.first()?;
        let last = self.events.last()?;
        if when <= first.when {
            return Some(first.value);
        }
        if when >= last.when {
            return Some(last.value);
        }
        let index = self.events.partition_point(|event| event.when <= when);
        let before = self.events[index - 1];
        let after = self.events[index];
        let span = after.when - before.when;
        if span <= 0.0 {
            return Some(after.value);
        }
        let fraction = (when - before.when) / span;
        Some(before.value + (after.value - before.value) * fraction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ControlError {
    #[error("control value is not finite: {0}")]
    NotFinite(f64),
    #[error("control value {value} is below the lower bound {lower}")]
    BelowLower { value: f64, lower: f64 },
    #[error("control value {value} is above the upper bound {upper}")]
    AboveUpper { value: f64, upper: f64 },
    #[error("no MIDI control for {0:?}")]
    UnknownParameter(Parameter),
}

/// A track control driven either live (each value change is sent as an
/// immediate MIDI message) or by automation playback (values are only
/// recorded; the realtime stream already carries them).
#[derive(Debug, Clone, PartialEq)]
pub struct MidiControl {
    parameter: Parameter,
    descriptor: ParameterDescriptor,
    value: f64,
    list: Option<AutomationList>,
    state: AutoState,
}

impl MidiControl {
    #[must_use]
    pub fn new(parameter: Parameter) -> Self {
        let descriptor = parameter.descriptor();
        Self {
            parameter,
            descriptor,
            value: descriptor.normal,
            list: None,
            state: AutoState::Off,
        }
    }

    #[must_use]
    pub fn parameter(&self) -> Parameter {
        self.parameter
    }

    #[must_use]
    pub fn descriptor(&self) -> ParameterDescriptor {
        self.descriptor
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[must_use]
    pub fn list(&self) -> Option<&AutomationList> {
        self.list.as_ref()
    }

    #[must_use]
    pub fn automation_state(&self) -> AutoState {
        self.state
    }

    pub fn set_list(&mut self, list: Option<AutomationList>) {
        self.list = list;
    }

    pub fn set_automation_state(&mut self, state: AutoState) {
        self.state = state;
    }

    #[must_use]
    pub fn automation_playback(&self) -> bool {
        self.list.is_some() && matches!(self.state, AutoState::Play | AutoState::Touch)
    }

    pub fn validate(&self, value: f64) -> Result<(), ControlError> {
        if !value.is_finite() {
            return Err(ControlError::NotFinite(value));
        }
        if value < self.descriptor.lower {
            return Err(ControlError::BelowLower {
                value,
                lower: self.descriptor.lower,
            });
        }
        if value > self.descriptor.upper {
            return Err(ControlError::AboveUpper {
                value,
                upper: self.descriptor.upper,
            });
        }
        Ok(())
    }

    /// Validates and applies `value`. Outside automation playback the
    /// equivalent MIDI message is queued on `immediate`. Rejected values
    /// leave the control untouched.
    pub fn set_value(
        &mut self,
        value: f64,
        immediate: &ImmediateEventQueue,
    ) -> Result<(), ControlError> {
        if let Err(error) = self.validate(value) {
            warn!(parameter = %self.parameter, %error, "rejected control value");
            return Err(error);
        }

        if !self.automation_playback() {
            let (bytes, size) = self.parameter.encode(value);
            let written = immediate.write(0, midi_event_type(bytes[0]), &bytes[..size]);
            if written != size {
                warn!(parameter = %self.parameter, "control change could not be queued");
            }
        }

        self.value = value;
        Ok(())
    }

    /// Records a value observed in the realtime stream without emitting
    /// anything. Invalid values are ignored.
    pub fn record_value(&mut self, value: f64) -> bool {
        if self.validate(value).is_err() {
            return false;
        }
        self.value = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_bend_splits_fourteen_bits() {
        let (bytes, size) = Parameter::pitch_bender(2).encode(8_193.0);
        assert_eq!(size, 3);
        assert_eq!(bytes, [0xE2, 0x01, 0x40]);
        assert_eq!(
            midi_parameter(&bytes[..size]),
            Some((Parameter::pitch_bender(2), 8_193.0))
        );
    }

    #[test]
    fn program_change_and_pressure_use_two_bytes() {
        assert_eq!(
            Parameter::program_change(0).encode(12.0),
            ([0xC0, 12, 0], 2)
        );
        assert_eq!(
            Parameter::channel_pressure(15).encode(99.0),
            ([0xDF, 99, 0], 2)
        );
    }

    #[test]
    fn list_interpolates_and_holds_ends() {
        let list = AutomationList::from_points([(0.0, 0.0), (4.0, 100.0), (f64::NAN, 3.0)]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.eval(-1.0), Some(0.0));
        assert_eq!(list.eval(1.0), Some(25.0));
        assert_eq!(list.eval(9.0), Some(100.0));
        assert_eq!(AutomationList::new().eval(1.0), None);
    }

    #[test]
    fn describes_known_and_generic_controllers() {
        assert_eq!(describe_parameter(Parameter::cc(0, 7)), "Volume [1]");
        assert_eq!(describe_parameter(Parameter::cc(3, 20)), "Controller 20 [4]");
        assert_eq!(Parameter::pitch_bender(9).to_string(), "Bender [10]");
    }
}

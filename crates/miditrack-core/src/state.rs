//! Persisted form of a MIDI track.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::Value;
use thiserror::Error;

use crate::{
    channel_filter::{ALL_CHANNELS_MASK, ChannelMode},
    playlist::MidiPlaylist,
    track::NoteMode,
};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("malformed channel mask {0:?}, expected 0x-prefixed hex")]
    InvalidMask(String),
    #[error("channel mask {0:#x} does not fit in 16 bits")]
    MaskOutOfRange(u32),
    #[error("invalid track state: {0}")]
    Json(#[from] serde_json::Error),
}

/// A 16-bit channel mask stored as `0x%x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HexMask(pub u16);

impl HexMask {
    pub fn parse(text: &str) -> Result<Self, StateError> {
        let digits = text
            .trim()
            .strip_prefix("0x")
            .or_else(|| text.trim().strip_prefix("0X"))
            .ok_or_else(|| StateError::InvalidMask(text.to_string()))?;
        let value = u32::from_str_radix(digits, 16)
            .map_err(|_| StateError::InvalidMask(text.to_string()))?;
        u16::try_from(value)
            .map(Self)
            .map_err(|_| StateError::MaskOutOfRange(value))
    }
}

impl fmt::Display for HexMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Serialize for HexMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HexMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(de::Error::custom)
    }
}

/// Boolean stored as `yes`/`no`; reading accepts the usual affirmative
/// spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YesNo(pub bool);

impl Serialize for YesNo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(if self.0 { "yes" } else { "no" })
    }
}

impl<'de> Deserialize<'de> for YesNo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Self(is_affirmative(&text)))
    }
}

fn is_affirmative(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "yes" | "y" | "1" | "true" | "on"
    )
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezeState {
    #[default]
    NoFreeze,
    Frozen,
    UnFrozen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeProcessorState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub state: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FreezeInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FreezeState>,
    #[serde(default, rename = "processor")]
    pub processors: Vec<FreezeProcessorState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MidiTrackState {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_mode: Option<NoteMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_editing: Option<YesNo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_active: Option<YesNo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_channel_mode: Option<ChannelMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_channel_mode: Option<ChannelMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_channel_mask: Option<HexMask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_channel_mask: Option<HexMask>,
    /// Older sessions kept one setting for both directions.
    #[serde(default, skip_serializing)]
    pub channel_mode: Option<ChannelMode>,
    #[serde(default, skip_serializing)]
    pub channel_mask: Option<HexMask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_info: Option<FreezeInfo>,
}

/// Channel settings after resolving legacy keys and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub playback_mode: ChannelMode,
    pub playback_mask: u16,
    pub capture_mode: ChannelMode,
    pub capture_mask: u16,
}

impl MidiTrackState {
    pub fn from_json(bytes: &[u8]) -> Result<Self, StateError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json_pretty(&self) -> Result<Vec<u8>, StateError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Legacy shared keys win over the per-direction ones.
    #[must_use]
    pub fn channel_settings(&self) -> ChannelSettings {
        let mut playback_mode = self.playback_channel_mode.unwrap_or_default();
        let mut capture_mode = self.capture_channel_mode.unwrap_or_default();
        if let Some(mode) = self.channel_mode {
            playback_mode = mode;
            capture_mode = mode;
        }

        let mut playback_mask = self.playback_channel_mask.map_or(ALL_CHANNELS_MASK, |mask| mask.0);
        let mut capture_mask = self.capture_channel_mask.map_or(ALL_CHANNELS_MASK, |mask| mask.0);
        if let Some(mask) = self.channel_mask {
            playback_mask = mask.0;
            capture_mask = mask.0;
        }

        ChannelSettings {
            playback_mode,
            playback_mask,
            capture_mode,
            capture_mask,
        }
    }
}

/// Runtime freeze record of a track.
#[derive(Debug, Clone, Default)]
pub struct FreezeRecord {
    pub playlist: Option<Arc<MidiPlaylist>>,
    pub state: FreezeState,
    pub processor_info: Vec<FreezeProcessorState>,
}

impl FreezeRecord {
    /// `None` when nothing was ever frozen.
    #[must_use]
    pub fn to_info(&self) -> Option<FreezeInfo> {
        let playlist = self.playlist.as_ref()?;
        Some(FreezeInfo {
            playlist: Some(playlist.name.clone()),
            state: Some(self.state),
            processors: self.processor_info.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_use_lowercase_hex_with_prefix() {
        assert_eq!(HexMask(0xfff0).to_string(), "0xfff0");
        assert_eq!(HexMask(0).to_string(), "0x0");
        assert_eq!(HexMask::parse("0xFFF0").map(|mask| mask.0).ok(), Some(0xfff0));
        assert!(matches!(HexMask::parse("fff0"), Err(StateError::InvalidMask(_))));
        assert!(matches!(
            HexMask::parse("0x10000"),
            Err(StateError::MaskOutOfRange(0x10000))
        ));
    }

    #[test]
    fn legacy_keys_set_both_directions() {
        let state = MidiTrackState::from_json(
            br#"{"name":"old","channel-mode":"FilterChannels","channel-mask":"0x3","playback-channel-mask":"0xff"}"#,
        )
        .expect("legacy state should parse");
        assert_eq!(
            state.channel_settings(),
            ChannelSettings {
                playback_mode: ChannelMode::FilterChannels,
                playback_mask: 0x3,
                capture_mode: ChannelMode::FilterChannels,
                capture_mask: 0x3,
            }
        );

        let written = String::from_utf8(state.to_json_pretty().expect("serializes"))
            .expect("json is utf-8");
        assert!(!written.contains("\"channel-mode\""));
    }

    #[test]
    fn yes_no_accepts_affirmative_spellings() {
        let state = MidiTrackState::from_json(br#"{"step-editing":"YES","input-active":"0"}"#)
            .expect("flags should parse");
        assert_eq!(state.step_editing, Some(YesNo(true)));
        assert_eq!(state.input_active, Some(YesNo(false)));
    }
}

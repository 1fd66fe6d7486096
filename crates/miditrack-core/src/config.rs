use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    immediate::{DEFAULT_IMMEDIATE_CAPACITY, DEFAULT_STEP_EDIT_CAPACITY, MAX_EVENT_SIZE},
    midi::DEFAULT_MIDI_BUFFER_CAPACITY,
    time::{DEFAULT_BPM, DEFAULT_SAMPLE_RATE, PFrames},
    track::NoteMode,
};

pub const CONFIG_FILE_NAME: &str = "miditrack.config.toml";
pub const CONFIG_PATH_ENV: &str = "MIDITRACK_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be at least {minimum}, got {value}")]
    TooSmall {
        field: &'static str,
        minimum: u64,
        value: u64,
    },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("session.bpm must be a positive finite number")]
    InvalidTempo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub track: TrackConfig,
    pub diskstream: DiskstreamConfig,
    pub session: SessionConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackConfig {
    /// Immediate event ring size in bytes, event headers included.
    pub immediate_capacity: usize,
    pub step_edit_capacity: usize,
    /// Per-block MIDI buffer size in bytes.
    pub midi_buffer_capacity: usize,
    pub default_note_mode: NoteMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiskstreamConfig {
    /// How far ahead of the playhead the butler keeps events buffered.
    pub read_ahead_frames: u32,
    /// The process thread asks for the butler once less than this many
    /// frames remain buffered.
    pub refill_threshold_frames: u32,
    /// Largest locate distance served by an internal seek.
    pub internal_seek_limit_frames: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub sample_rate: u32,
    pub block_size: PFrames,
    pub bpm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub rust_log_filter: String,
    pub trace_file_prefix: String,
    pub log_dir: PathBuf,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            immediate_capacity: DEFAULT_IMMEDIATE_CAPACITY,
            step_edit_capacity: DEFAULT_STEP_EDIT_CAPACITY,
            midi_buffer_capacity: DEFAULT_MIDI_BUFFER_CAPACITY,
            default_note_mode: NoteMode::Sustained,
        }
    }
}

impl Default for DiskstreamConfig {
    fn default() -> Self {
        Self {
            read_ahead_frames: 48_000,
            refill_threshold_frames: 12_000,
            internal_seek_limit_frames: 48_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: 512,
            bpm: DEFAULT_BPM,
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rust_log_filter: "info,miditrack_core=trace".to_string(),
            trace_file_prefix: "miditrack".to_string(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl EngineConfig {
    /// Loads the config file found through `MIDITRACK_CONFIG_PATH` or the
    /// working directory and its parent; falls back to defaults when there
    /// is none.
    pub fn load() -> Result<Self> {
        match discover_config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                debug!("no {CONFIG_FILE_NAME} found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse config TOML from {}", path.display()))?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("invalid config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least(
            "track.immediate_capacity",
            self.track.immediate_capacity,
            MAX_EVENT_SIZE,
        )?;
        at_least("track.step_edit_capacity", self.track.step_edit_capacity, 16)?;
        at_least("track.midi_buffer_capacity", self.track.midi_buffer_capacity, 3)?;
        at_least("session.block_size", self.session.block_size as usize, 1)?;
        at_least("session.sample_rate", self.session.sample_rate as usize, 8_000)?;
        if !self.session.bpm.is_finite() || self.session.bpm <= 0.0 {
            return Err(ConfigError::InvalidTempo);
        }
        if self.diagnostics.trace_file_prefix.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "diagnostics.trace_file_prefix",
            });
        }
        Ok(())
    }
}

fn at_least(field: &'static str, value: usize, minimum: usize) -> Result<(), ConfigError> {
    if value < minimum {
        return Err(ConfigError::TooSmall {
            field,
            minimum: minimum as u64,
            value: value as u64,
        });
    }
    Ok(())
}

fn discover_config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Some(path);
        }
    }

    let cwd = env::current_dir().ok()?;
    [cwd.join(CONFIG_FILE_NAME), cwd.join("..").join(CONFIG_FILE_NAME)]
        .into_iter()
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config = EngineConfig::from_toml_str(
            r#"
            [track]
            immediate_capacity = 2048

            [session]
            bpm = 96.0
            "#,
        )
        .expect("partial config should parse");

        assert_eq!(config.track.immediate_capacity, 2048);
        assert_eq!(config.track.step_edit_capacity, DEFAULT_STEP_EDIT_CAPACITY);
        assert_eq!(config.session.sample_rate, DEFAULT_SAMPLE_RATE);
        assert!((config.session.bpm - 96.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_queue_smaller_than_one_event() {
        let error = EngineConfig::from_toml_str("[track]\nimmediate_capacity = 8\n")
            .expect_err("tiny queue should be rejected");
        assert!(format!("{error:#}").contains("track.immediate_capacity"));
    }
}

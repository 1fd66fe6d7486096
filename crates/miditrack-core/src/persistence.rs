//! Track state files on disk.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::{state::MidiTrackState, track::MidiTrack};

/// Writes `state` as pretty JSON through a temp file in the target
/// directory, so a crash never leaves a half-written file behind.
#[instrument(skip(state), fields(track = %state.name, path = %path.display()))]
pub fn save_track_state(path: &Path, state: &MidiTrackState) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;

    let json = state
        .to_json_pretty()
        .context("failed to serialize track state")?;
    let mut temp_file = tempfile::NamedTempFile::new_in(&parent)
        .context("failed to create temp track state file")?;
    temp_file
        .write_all(&json)
        .context("failed to write temp track state file")?;
    temp_file
        .persist(path)
        .map_err(|error| anyhow::anyhow!(error.error))
        .with_context(|| format!("failed to persist track state: {}", path.display()))?;

    info!(bytes = json.len(), "track state saved");
    Ok(())
}

#[instrument(fields(path = %path.display()))]
pub fn load_track_state(path: &Path) -> Result<MidiTrackState> {
    let content = fs::read(path)
        .with_context(|| format!("failed to read track state: {}", path.display()))?;
    let state = MidiTrackState::from_json(&content).context("invalid track state json")?;
    info!(track = %state.name, "track state loaded");
    Ok(state)
}

/// Saves the live state of `track` to `<dir>/<name>.miditrack.json`.
#[instrument(skip(track), fields(track = %track.name(), dir = %dir.display()))]
pub fn snapshot_track(track: &MidiTrack, dir: &Path) -> Result<PathBuf> {
    let file_name = format!("{}.miditrack.json", sanitize_file_stem(track.name()));
    let path = dir.join(file_name);
    save_track_state(&path, &track.state())?;
    debug!(path = %path.display(), "track snapshot written");
    Ok(path)
}

fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect();
    if stem.is_empty() { "track".to_string() } else { stem }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stems_drop_path_characters() {
        assert_eq!(sanitize_file_stem("Lead/Keys 1"), "Lead_Keys_1");
        assert_eq!(sanitize_file_stem(""), "track");
    }
}

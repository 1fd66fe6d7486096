use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    automation::{AutomationList, Parameter},
    midi::{MIDI_CMD_NOTE_OFF, MIDI_CMD_NOTE_ON},
    time::{BeatsFramesConverter, FramePos, TempoMap},
};

pub type PlaylistId = Uuid;
pub type RegionId = Uuid;
pub type SourceId = Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MidiNote {
    pub pitch: u8,
    pub velocity: u8,
    pub start_beats: f64,
    pub length_beats: f64,
    pub channel: u8,
}

impl MidiNote {
    #[must_use]
    pub fn end_beats(&self) -> f64 {
        self.start_beats + self.length_beats.max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionControl {
    pub parameter: Parameter,
    pub list: AutomationList,
}

/// Musical content of a region's source, timed in beats from source start.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MidiModel {
    pub notes: Vec<MidiNote>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controls: Vec<RegionControl>,
}

impl MidiModel {
    #[must_use]
    pub fn control(&self, parameter: Parameter) -> Option<&AutomationList> {
        self.controls
            .iter()
            .find(|control| control.parameter == parameter)
            .map(|control| &control.list)
    }
}

/// One timed MIDI message produced by reading a playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub frame: FramePos,
    pub size: u8,
    pub bytes: [u8; 3],
}

impl TimedEvent {
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.bytes[..usize::from(self.size)]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MidiRegion {
    pub id: RegionId,
    pub name: String,
    /// Timeline position of the region's first frame.
    pub position: FramePos,
    /// Offset into the source at which the region starts, in frames.
    pub start: FramePos,
    pub length: FramePos,
    pub layer: u32,
    pub muted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceId>,
    /// Missing when the source could not be loaded; the region is kept so
    /// editors can still show it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<MidiModel>,
}

impl MidiRegion {
    #[must_use]
    pub fn new(name: impl Into<String>, position: FramePos, length: FramePos, model: MidiModel) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            position,
            start: 0,
            length: length.max(1),
            layer: 0,
            muted: false,
            source: Some(Uuid::new_v4()),
            model: Some(model),
        }
    }

    #[must_use]
    pub fn end(&self) -> FramePos {
        self.position.saturating_add(self.length)
    }

    #[must_use]
    pub fn covers(&self, frame: FramePos) -> bool {
        frame >= self.position && frame < self.end()
    }

    /// Timeline frame of the source's first beat.
    #[must_use]
    pub fn origin(&self) -> FramePos {
        self.position - self.start
    }

    #[must_use]
    pub fn control(&self, parameter: Parameter) -> Option<&AutomationList> {
        self.model.as_ref()?.control(parameter)
    }

    /// Appends the note messages falling in `[from, to)` (timeline frames),
    /// clipped to the region's extent.
    pub fn read_events(
        &self,
        tempo_map: &TempoMap,
        from: FramePos,
        to: FramePos,
        out: &mut Vec<TimedEvent>,
    ) {
        let Some(model) = &self.model else {
            return;
        };
        let from = from.max(self.position);
        let to = to.min(self.end());
        if from >= to {
            return;
        }

        let converter = BeatsFramesConverter::new(tempo_map, self.origin());
        for note in &model.notes {
            let channel = note.channel & 0x0F;
            let on_frame = self.origin() + converter.to(note.start_beats);
            if (from..to).contains(&on_frame) {
                out.push(TimedEvent {
                    frame: on_frame,
                    size: 3,
                    bytes: [MIDI_CMD_NOTE_ON | channel, note.pitch & 0x7F, note.velocity.clamp(1, 127)],
                });
            }
            let off_frame = (self.origin() + converter.to(note.end_beats())).min(self.end() - 1);
            if (from..to).contains(&off_frame) && on_frame >= self.position {
                out.push(TimedEvent {
                    frame: off_frame,
                    size: 3,
                    bytes: [MIDI_CMD_NOTE_OFF | channel, note.pitch & 0x7F, 0],
                });
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MidiPlaylist {
    pub id: PlaylistId,
    pub name: String,
    pub regions: Vec<MidiRegion>,
}

impl MidiPlaylist {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            regions: Vec::new(),
        }
    }

    /// Highest-layer unmuted region covering `frame`.
    #[must_use]
    pub fn top_unmuted_region_at(&self, frame: FramePos) -> Option<&MidiRegion> {
        self.regions
            .iter()
            .filter(|region| !region.muted && region.covers(frame))
            .max_by_key(|region| region.layer)
    }

    /// Every note message of unmuted regions in `[from, to)`, sorted by
    /// frame with note-offs ahead of note-ons at equal frames.
    #[must_use]
    pub fn read(&self, tempo_map: &TempoMap, from: FramePos, to: FramePos) -> Vec<TimedEvent> {
        let mut events = Vec::new();
        for region in self.regions.iter().filter(|region| !region.muted) {
            region.read_events(tempo_map, from, to, &mut events);
        }
        events.sort_by_key(|event| (event.frame, event.bytes[0] & 0xF0 != MIDI_CMD_NOTE_OFF));
        events
    }

    #[must_use]
    pub fn end(&self) -> FramePos {
        self.regions.iter().map(MidiRegion::end).max().unwrap_or_default()
    }
}

/// Session-side registry owning every playlist; tracks and diskstreams refer
/// to playlists by id or name.
#[derive(Debug, Default)]
pub struct SessionPlaylists {
    playlists: RwLock<HashMap<PlaylistId, Arc<MidiPlaylist>>>,
}

impl SessionPlaylists {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, playlist: MidiPlaylist) -> Arc<MidiPlaylist> {
        let playlist = Arc::new(playlist);
        self.playlists.write().insert(playlist.id, Arc::clone(&playlist));
        playlist
    }

    #[must_use]
    pub fn by_id(&self, id: PlaylistId) -> Option<Arc<MidiPlaylist>> {
        self.playlists.read().get(&id).cloned()
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<MidiPlaylist>> {
        self.playlists
            .read()
            .values()
            .find(|playlist| playlist.name == name)
            .cloned()
    }

    pub fn remove(&self, id: PlaylistId) -> Option<Arc<MidiPlaylist>> {
        self.playlists.write().remove(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.playlists.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

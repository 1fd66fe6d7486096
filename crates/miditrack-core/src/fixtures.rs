use std::sync::Arc;

use uuid::Uuid;

use crate::{
    automation::{AutomationList, Parameter},
    channel_filter::ChannelMode,
    config::EngineConfig,
    diskstream::PlaylistDiskstream,
    playlist::{MidiModel, MidiNote, MidiPlaylist, MidiRegion, RegionControl},
    session::{EngineSession, Session},
    state::{HexMask, MidiTrackState, YesNo},
    time::TempoMap,
    track::{MidiTrack, NoteMode},
};

pub const DEMO_PLAYLIST_ID: Uuid = Uuid::from_u128(0x9ed0_a3fa_4064_458f_b95f_1fdd_0bc4_f0be);
pub const DEMO_REGION_ID: Uuid = Uuid::from_u128(0xfbf4_1a8f_c5b4_464b_a9f3_6e62_eebf_6efb);
pub const DEMO_SOURCE_ID: Uuid = Uuid::from_u128(0x0caa_5e8d_6ec2_4b74_9e87_d7f6_0111_f3f2);
pub const DEMO_PLAYLIST_NAME: &str = "Keys.1";
pub const DEMO_REGION_BEATS: f64 = 4.0;

fn note(pitch: u8, start_beats: f64, length_beats: f64, channel: u8) -> MidiNote {
    MidiNote {
        pitch,
        velocity: 100,
        start_beats,
        length_beats,
        channel,
    }
}

/// One bar: a C major arpeggio on channel 1, a bass line on channel 2, and
/// a volume swell on channel 1.
#[must_use]
pub fn demo_playlist(tempo_map: &TempoMap) -> MidiPlaylist {
    let model = MidiModel {
        notes: vec![
            note(60, 0.0, 1.0, 0),
            note(64, 1.0, 1.0, 0),
            note(67, 2.0, 1.0, 0),
            note(72, 3.0, 0.5, 0),
            note(36, 0.0, 2.0, 1),
            note(43, 2.0, 2.0, 1),
        ],
        controls: vec![RegionControl {
            parameter: Parameter::cc(0, 7),
            list: AutomationList::from_points([(0.0, 64.0), (DEMO_REGION_BEATS, 127.0)]),
        }],
    };

    let length = tempo_map.beats_to_frame(DEMO_REGION_BEATS);
    let mut region = MidiRegion::new("Keys phrase", 0, length, model);
    region.id = DEMO_REGION_ID;
    region.source = Some(DEMO_SOURCE_ID);

    let mut playlist = MidiPlaylist::new(DEMO_PLAYLIST_NAME);
    playlist.id = DEMO_PLAYLIST_ID;
    playlist.regions.push(region);
    playlist
}

/// A session holding the demo playlist and a track playing it.
pub struct DemoRig {
    pub session: Arc<EngineSession>,
    pub playlist: Arc<MidiPlaylist>,
    pub track: Arc<MidiTrack>,
}

#[must_use]
pub fn demo_rig(config: &EngineConfig) -> DemoRig {
    let session = Arc::new(EngineSession::new(&config.session));
    let tempo_map = session.tempo_map();
    let playlist = session.playlists().add(demo_playlist(&tempo_map));
    let diskstream = PlaylistDiskstream::new(
        "Keys",
        Some(Arc::clone(&playlist)),
        tempo_map,
        config.diskstream.clone(),
    );
    let track = MidiTrack::new(
        "Keys",
        Arc::clone(&session) as Arc<dyn Session>,
        Box::new(diskstream),
        &config.track,
    );
    DemoRig {
        session,
        playlist,
        track,
    }
}

/// Saved state of a track filtering out channels 1 to 4 on playback.
#[must_use]
pub fn demo_track_state() -> MidiTrackState {
    MidiTrackState {
        name: "Keys".to_string(),
        note_mode: Some(NoteMode::Sustained),
        step_editing: Some(YesNo(false)),
        input_active: Some(YesNo(true)),
        playback_channel_mode: Some(ChannelMode::FilterChannels),
        capture_channel_mode: Some(ChannelMode::AllChannels),
        playback_channel_mask: Some(HexMask(0xfff0)),
        capture_channel_mask: Some(HexMask(0xffff)),
        ..MidiTrackState::default()
    }
}

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use miditrack_core::{
    ChannelMode, EngineConfig, EngineSession, FreezeInfo, FreezeState, HexMask, MidiPlaylist,
    MidiTrack, MidiTrackState, NoteMode, PlaylistDiskstream, RecordStatus, Session, TrackConfig,
    YesNo,
    fixtures::{DEMO_PLAYLIST_NAME, demo_rig, demo_track_state},
    persistence::{load_track_state, save_track_state, snapshot_track},
    state::FreezeProcessorState,
};
use proptest::prelude::*;
use serde_json::json;

fn fresh_track(session: &Arc<EngineSession>) -> Arc<MidiTrack> {
    let diskstream = PlaylistDiskstream::new("ds", None, session.tempo_map(), Default::default());
    MidiTrack::new(
        "restored",
        Arc::clone(session) as Arc<dyn Session>,
        Box::new(diskstream),
        &TrackConfig::default(),
    )
}

#[test]
fn filter_channels_mask_round_trips_through_disk() {
    let rig = demo_rig(&EngineConfig::default());
    rig.track
        .set_playback_channel_mode(ChannelMode::FilterChannels, 0xfff0);
    assert!(rig.session.is_dirty());

    let temp = tempfile::tempdir().expect("tempdir should be creatable");
    let path = snapshot_track(&rig.track, temp.path()).expect("snapshot should save");
    let raw = std::fs::read_to_string(&path).expect("saved state is readable");
    assert!(raw.contains(r#""playback-channel-mode": "FilterChannels""#));
    assert!(raw.contains(r#""playback-channel-mask": "0xfff0""#));
    assert!(raw.contains(r#""capture-channel-mask": "0xffff""#));

    let state = load_track_state(&path).expect("saved state loads");
    let session = Arc::new(EngineSession::default());
    let track = fresh_track(&session);
    track.set_state(&state);

    assert_eq!(
        track.playback_filter().load(),
        (ChannelMode::FilterChannels, 0xfff0)
    );
    assert_eq!(
        track.capture_filter().load(),
        (ChannelMode::AllChannels, 0xffff)
    );
}

#[test]
fn legacy_channel_keys_configure_both_filters() {
    let state = MidiTrackState::from_json(
        br#"{"name":"old","note-mode":"Percussive","channel-mode":"ForceChannel","channel-mask":"0x20"}"#,
    )
    .expect("legacy state parses");
    let session = Arc::new(EngineSession::default());
    let track = fresh_track(&session);
    track.set_state(&state);

    assert_eq!(track.note_mode(), NoteMode::Percussive);
    assert_eq!(track.playback_filter().load(), (ChannelMode::ForceChannel, 0x20));
    assert_eq!(track.capture_filter().load(), (ChannelMode::ForceChannel, 0x20));
}

#[test]
fn saved_state_reports_flags_as_yes_no() {
    let session = Arc::new(EngineSession::default());
    let track = fresh_track(&session);
    track.set_input_active(false);

    let value = serde_json::to_value(track.state()).expect("state serializes");
    assert_eq!(value["input-active"], json!("no"));
    assert_eq!(value["step-editing"], json!("no"));
    assert_eq!(value["note-mode"], json!("Sustained"));
    assert!(value.get("freeze-info").is_none());
}

#[test]
fn freeze_restore_waits_for_session_state_ready() {
    let session = Arc::new(EngineSession::default());
    let track = fresh_track(&session);
    let state = MidiTrackState {
        freeze_info: Some(FreezeInfo {
            playlist: Some("Keys.frozen".to_string()),
            state: Some(FreezeState::Frozen),
            processors: vec![
                FreezeProcessorState {
                    id: Some("0b0f1c3e-1d2a-4a8e-9d6f-3f2b1c0d4e5a".to_string()),
                    state: json!({ "name": "main outs" }),
                },
                FreezeProcessorState {
                    id: None,
                    state: json!({}),
                },
            ],
        }),
        ..demo_track_state()
    };

    session.begin_loading();
    track.set_state(&state);
    assert_eq!(track.freeze_state(), FreezeState::NoFreeze);
    assert_eq!(
        track.playback_filter().load(),
        (ChannelMode::FilterChannels, 0xfff0),
        "channel settings apply immediately"
    );

    // the frozen playlist only exists once the rest of the session loaded
    session.playlists().add(MidiPlaylist::new("Keys.frozen"));
    session.finish_loading();

    assert_eq!(track.freeze_state(), FreezeState::Frozen);
    let record = track.freeze_record();
    assert_eq!(
        record.playlist.map(|playlist| playlist.name.clone()),
        Some("Keys.frozen".to_string())
    );
    assert_eq!(record.processor_info.len(), 1, "entries without an id are skipped");
    assert_eq!(session.state_ready().subscriber_count(), 0);
}

#[test]
fn freeze_info_naming_an_unknown_playlist_is_dropped() {
    let session = Arc::new(EngineSession::default());
    let track = fresh_track(&session);
    let state = MidiTrackState {
        freeze_info: Some(FreezeInfo {
            playlist: Some("gone".to_string()),
            state: Some(FreezeState::Frozen),
            processors: Vec::new(),
        }),
        ..MidiTrackState::default()
    };

    track.set_state(&state);

    assert_eq!(track.freeze_state(), FreezeState::NoFreeze);
    assert!(track.freeze_record().playlist.is_none());
}

#[test]
fn freeze_and_unfreeze_notify_observers() {
    let rig = demo_rig(&EngineConfig::default());
    let changes = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&changes);
    rig.track.signals().freeze_change.connect(move |()| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    assert!(rig.track.freeze_me());
    assert_eq!(rig.track.freeze_state(), FreezeState::Frozen);
    let info = rig.track.state().freeze_info.expect("frozen track saves freeze info");
    assert_eq!(info.playlist.as_deref(), Some(DEMO_PLAYLIST_NAME));
    assert_eq!(info.processors.len(), 1);

    rig.track.unfreeze();
    assert_eq!(rig.track.freeze_state(), FreezeState::UnFrozen);
    assert_eq!(changes.load(Ordering::SeqCst), 2);
}

#[test]
fn track_without_playlist_cannot_freeze() {
    let session = Arc::new(EngineSession::default());
    let track = fresh_track(&session);
    assert!(!track.freeze_me());
    assert_eq!(track.freeze_state(), FreezeState::NoFreeze);
}

#[test]
fn step_editing_requires_recording_disabled() {
    let session = Arc::new(EngineSession::default());
    let track = fresh_track(&session);
    let toggles = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&toggles);
    track.signals().step_edit_status_change.connect(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    session.set_record_status(RecordStatus::Enabled);
    track.set_step_editing(true);
    assert!(!track.step_editing());

    session.set_record_status(RecordStatus::Disabled);
    track.set_step_editing(true);
    track.set_step_editing(true);
    assert!(track.step_editing());
    assert_eq!(toggles.load(Ordering::SeqCst), 1);

    assert!(!track.set_record_enabled(true), "record enable is ignored while step editing");
    assert!(!track.record_enabled());

    let state = track.state();
    assert_eq!(state.step_editing, Some(YesNo(true)));
}

#[test]
fn input_active_change_is_published() {
    let session = Arc::new(EngineSession::default());
    let track = fresh_track(&session);
    let last = Arc::new(AtomicUsize::new(usize::MAX));
    let seen = Arc::clone(&last);
    track.signals().input_active_changed.connect(move |active| {
        seen.store(usize::from(*active), Ordering::SeqCst);
    });

    track.set_input_active(false);
    assert_eq!(last.load(Ordering::SeqCst), 0);
    assert!(!track.input_active());

    track.input_configuration_changed();
    assert!(!track.input_active(), "port rebuild keeps the track setting");
}

#[test]
fn hex_masks_reject_missing_prefix() {
    let result = MidiTrackState::from_json(br#"{"playback-channel-mask":"fff0"}"#);
    assert!(result.is_err());
    assert_eq!(HexMask(0xfff0).to_string(), "0xfff0");
}

fn no_panic_load(path: &std::path::Path) -> bool {
    std::panic::catch_unwind(|| {
        let _ = load_track_state(path);
    })
    .is_ok()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn random_state_bytes_do_not_panic(raw in prop::collection::vec(any::<u8>(), 0..2048)) {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("corrupt_random.miditrack.json");
        std::fs::write(&path, raw).expect("writing random payload should work");
        prop_assert!(no_panic_load(&path));
    }

    #[test]
    fn mutated_state_payloads_do_not_panic(index in 0usize..4096usize, delta in any::<u8>()) {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("corrupt_mutated.miditrack.json");
        save_track_state(&path, &demo_track_state()).expect("saving fixture state should work");

        let mut payload = std::fs::read(&path).expect("reading saved state should work");
        if !payload.is_empty() {
            let target = index % payload.len();
            payload[target] ^= delta.max(1);
        }
        std::fs::write(&path, payload).expect("writing mutated payload should work");

        prop_assert!(no_panic_load(&path));
    }
}

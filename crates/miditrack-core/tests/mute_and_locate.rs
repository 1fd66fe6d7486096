use std::sync::Arc;

use miditrack_core::{
    BufferSet, ChannelMode, EngineSession, MidiBuffer, MidiTrack, MonitorChoice,
    PlaylistDiskstream, ProcessScope, Session, TrackConfig,
};

fn track() -> Arc<MidiTrack> {
    let session = Arc::new(EngineSession::default());
    let diskstream = PlaylistDiskstream::new("ds", None, session.tempo_map(), Default::default());
    MidiTrack::new(
        "mute",
        session as Arc<dyn Session>,
        Box::new(diskstream),
        &TrackConfig::default(),
    )
}

/// Runs one stopped block with `events` arriving at the input and returns
/// what reached the output port.
fn play_input(track: &MidiTrack, events: &[&[u8]]) -> Vec<Vec<u8>> {
    let mut input = MidiBuffer::with_capacity(256);
    for (time, bytes) in events.iter().enumerate() {
        input.push(time as u32, bytes);
    }
    let mut bufs = BufferSet::with_midi(1, 1024);
    let mut output = MidiBuffer::with_capacity(1024);
    let mut scope = ProcessScope {
        input: &input,
        bufs: &mut bufs,
        output: &mut output,
        port_offset: 0,
    };
    track.no_roll(&mut scope, 256, 0, 256, false);
    output.iter().map(|event| event.bytes.to_vec()).collect()
}

#[test]
fn mute_resolves_only_channels_the_playback_filter_admits() {
    let track = track();
    track.set_playback_channel_mode(ChannelMode::FilterChannels, 0b01);
    play_input(&track, &[&[0x90, 60, 100], &[0x91, 62, 100]]);
    assert_eq!(track.active_notes(), 2);

    track.set_mute(true);

    let queued: Vec<Vec<u8>> = track
        .immediate_events()
        .drain()
        .into_iter()
        .map(|(_, bytes)| bytes)
        .collect();
    assert_eq!(queued, vec![vec![0xB0, 64, 0], vec![0x80, 60, 0]]);
    assert!(
        !queued.iter().any(|bytes| bytes[1] == 0x7B),
        "mute never sends all-notes-off"
    );
    assert_eq!(track.active_notes(), 1, "the unadmitted channel keeps its note");
}

#[test]
fn unmute_sends_nothing() {
    let track = track();
    track.set_mute(true);
    let _ = track.immediate_events().drain();

    track.set_mute(false);
    assert!(!track.muted());
    assert!(track.immediate_events().is_empty());
}

#[test]
fn implicit_mute_acts_like_self_mute() {
    let track = track();
    track.set_muted_by_others(true);
    assert_eq!(track.immediate_events().drain().len(), 16);
}

#[test]
fn muted_output_holds_back_note_ons() {
    let track = track();
    track.set_mute(true);
    let output = play_input(&track, &[&[0x90, 60, 100], &[0xB0, 1, 30]]);

    assert!(!output.iter().any(|bytes| bytes[0] == 0x90));
    assert!(output.contains(&vec![0xB0, 1, 30]));
    assert!(output.contains(&vec![0xB0, 64, 0]));
}

#[test]
fn realtime_locate_resolves_every_sounding_note() {
    let track = track();
    play_input(&track, &[&[0x90, 60, 100], &[0x9F, 30, 100]]);

    track.realtime_locate();

    let queued: Vec<Vec<u8>> = track
        .immediate_events()
        .drain()
        .into_iter()
        .map(|(_, bytes)| bytes)
        .collect();
    assert_eq!(queued, vec![vec![0x80, 60, 0], vec![0x8F, 30, 0]]);
    assert_eq!(track.active_notes(), 0);
}

#[test]
fn realtime_locate_gives_up_when_the_chain_is_locked() {
    let track = track();
    play_input(&track, &[&[0x90, 60, 100]]);

    {
        let _writer = track.processors().write();
        track.realtime_locate();
        track.realtime_handle_transport_stopped();
    }

    assert_eq!(track.active_notes(), 1);
    assert!(track.immediate_events().is_empty());
}

#[test]
fn transport_stop_resolves_notes() {
    let track = track();
    play_input(&track, &[&[0x92, 48, 80]]);

    track.realtime_handle_transport_stopped();

    assert_eq!(
        track.immediate_events().drain(),
        vec![(0, vec![0x82, 48, 0])]
    );
}

#[test]
fn monitoring_change_resolves_notes() {
    let track = track();
    play_input(&track, &[&[0x90, 72, 100]]);

    track.set_monitoring(MonitorChoice::Disk);
    assert_eq!(track.active_notes(), 0);
    assert_eq!(track.immediate_events().drain().len(), 1);

    track.set_monitoring(MonitorChoice::Disk);
    assert!(track.immediate_events().is_empty());
}

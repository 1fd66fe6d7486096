use std::sync::Arc;

use miditrack_core::{
    EngineSession, ImmediateEventError, ImmediateEventQueue, MidiBuffer, MidiTrack,
    PlaylistDiskstream, Session, TempoMap, TrackConfig, config::DiskstreamConfig,
    midi::midi_event_type,
};
use proptest::prelude::*;

fn track_with_capacity(immediate_capacity: usize) -> Arc<MidiTrack> {
    let session = Arc::new(EngineSession::default());
    let diskstream = PlaylistDiskstream::new(
        "ds",
        None,
        Arc::new(TempoMap::default()),
        DiskstreamConfig::default(),
    );
    MidiTrack::new(
        "immediate",
        session as Arc<dyn Session>,
        Box::new(diskstream),
        &TrackConfig {
            immediate_capacity,
            ..TrackConfig::default()
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn events_come_out_in_write_order(
        messages in prop::collection::vec((0u8..16, 0u8..120, 0u8..128), 0..60)
    ) {
        let queue = ImmediateEventQueue::new(1024);
        for (channel, controller, value) in &messages {
            let bytes = [0xB0 | channel, *controller, *value];
            prop_assert_eq!(queue.write(0, midi_event_type(bytes[0]), &bytes), 3);
        }

        let mut buffer = MidiBuffer::with_capacity(4096);
        buffer.push(0, &[0x90, 60, 100]);
        let delivered = queue.read_into(&mut buffer, 511, true);
        prop_assert_eq!(delivered, messages.len());

        let drained: Vec<(u32, Vec<u8>)> = buffer
            .iter()
            .skip(1)
            .map(|event| (event.time, event.bytes.to_vec()))
            .collect();
        let expected: Vec<(u32, Vec<u8>)> = messages
            .iter()
            .map(|(channel, controller, value)| (511, vec![0xB0 | channel, *controller, *value]))
            .collect();
        prop_assert_eq!(drained, expected);
        prop_assert!(queue.is_empty());
    }
}

#[test]
fn full_ring_rejects_without_blocking() {
    // 4 records of 12 header bytes plus 3 payload bytes fit in 64
    let track = track_with_capacity(64);
    for value in 0..4 {
        assert_eq!(track.write_immediate_event(&[0xB0, 7, value]), Ok(()));
    }
    assert_eq!(
        track.write_immediate_event(&[0xB0, 7, 5]),
        Err(ImmediateEventError::Overflow)
    );

    let drained = track.immediate_events().drain();
    let values: Vec<u8> = drained.iter().map(|(_, bytes)| bytes[2]).collect();
    assert_eq!(values, vec![0, 1, 2, 3]);
}

#[test]
fn invalid_events_never_reach_the_queue() {
    let track = track_with_capacity(1024);
    assert_eq!(
        track.write_immediate_event(&[0x90, 200, 1]),
        Err(ImmediateEventError::Invalid)
    );
    assert_eq!(
        track.write_immediate_event(&[0x90]),
        Err(ImmediateEventError::Invalid)
    );
    assert_eq!(
        track.write_immediate_event(&[0x40, 1, 2]),
        Err(ImmediateEventError::Invalid)
    );
    assert_eq!(
        track.write_immediate_event(&[0xF0; 300]),
        Err(ImmediateEventError::TooLarge {
            size: 300,
            max: 256
        })
    );
    assert!(track.immediate_events().is_empty());

    assert_eq!(track.write_immediate_event(&[0xF0, 0x7E, 0x01, 0xF7]), Ok(()));
    assert_eq!(track.write_immediate_event(&[0xC3, 12]), Ok(()));
    assert_eq!(track.immediate_events().drain().len(), 2);
}

#[test]
fn overflowing_destination_keeps_the_rest_for_next_block() {
    let queue = ImmediateEventQueue::new(1024);
    for controller in 0..4 {
        queue.write(0, midi_event_type(0xB0), &[0xB0, controller, 1]);
    }

    let mut small = MidiBuffer::with_capacity(7);
    assert_eq!(queue.read_into(&mut small, 63, true), 2);
    assert!(!queue.is_empty());

    let mut next = MidiBuffer::with_capacity(64);
    assert_eq!(queue.read_into(&mut next, 63, true), 2);
    let controllers: Vec<u8> = next.iter().map(|event| event.bytes[1]).collect();
    assert_eq!(controllers, vec![2, 3]);
}

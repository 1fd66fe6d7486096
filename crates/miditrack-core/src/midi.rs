//! MIDI byte-level helpers and the per-block event buffers the roll engine
//! hands between stages.

use midly::{MidiMessage, live::LiveEvent};

pub const MIDI_CMD_NOTE_OFF: u8 = 0x80;
pub const MIDI_CMD_NOTE_ON: u8 = 0x90;
pub const MIDI_CMD_NOTE_PRESSURE: u8 = 0xA0;
pub const MIDI_CMD_CONTROL: u8 = 0xB0;
pub const MIDI_CMD_PGM_CHANGE: u8 = 0xC0;
pub const MIDI_CMD_CHANNEL_PRESSURE: u8 = 0xD0;
pub const MIDI_CMD_BENDER: u8 = 0xE0;
pub const MIDI_CMD_COMMON_SYSEX: u8 = 0xF0;
pub const MIDI_CMD_COMMON_SYSEX_END: u8 = 0xF7;

pub const MIDI_CTL_SUSTAIN: u8 = 0x40;
pub const MIDI_CTL_RESET_CONTROLLERS: u8 = 0x79;
pub const MIDI_CTL_ALL_NOTES_OFF: u8 = 0x7B;

pub const MIDI_CHANNELS: u8 = 16;

/// Expected total size of a message starting with `status`, or `None` for
/// variable-length (SysEx) and invalid status bytes.
#[must_use]
pub fn midi_event_size(status: u8) -> Option<usize> {
    match status & 0xF0 {
        MIDI_CMD_NOTE_OFF
        | MIDI_CMD_NOTE_ON
        | MIDI_CMD_NOTE_PRESSURE
        | MIDI_CMD_CONTROL
        | MIDI_CMD_BENDER => Some(3),
        MIDI_CMD_PGM_CHANGE | MIDI_CMD_CHANNEL_PRESSURE => Some(2),
        0xF0 => match status {
            0xF1 | 0xF3 => Some(2),
            0xF2 => Some(3),
            0xF6 | 0xF8..=0xFF => Some(1),
            _ => None,
        },
        _ => None,
    }
}

/// Event type tag stored alongside queued events: the status nibble for
/// channel messages, the full status byte for system messages.
#[must_use]
pub fn midi_event_type(status: u8) -> u32 {
    if status >= 0xF0 {
        u32::from(status)
    } else {
        u32::from(status & 0xF0)
    }
}

/// True when `bytes` is exactly one well-formed MIDI message.
#[must_use]
pub fn midi_event_is_valid(bytes: &[u8]) -> bool {
    let Some((&status, data)) = bytes.split_first() else {
        return false;
    };
    if status & 0x80 == 0 {
        return false;
    }

    if status == MIDI_CMD_COMMON_SYSEX {
        return match data.split_last() {
            Some((&MIDI_CMD_COMMON_SYSEX_END, body)) => body.iter().all(|byte| byte & 0x80 == 0),
            _ => false,
        };
    }

    match midi_event_size(status) {
        Some(size) => size == bytes.len() && data.iter().all(|byte| byte & 0x80 == 0),
        None => false,
    }
}

/// Channel (0-15) of a channel voice message.
#[must_use]
pub fn event_channel(bytes: &[u8]) -> Option<u8> {
    match bytes.first() {
        Some(&status) if (0x80..0xF0).contains(&status) => Some(status & 0x0F),
        _ => None,
    }
}

/// Decoded view of the channel messages the track cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    Controller { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    PitchBend { channel: u8, value: u16 },
    Other,
}

impl ChannelMessage {
    /// Classifies raw bytes. A note-on with velocity zero is a note-off.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Self {
        let Ok(LiveEvent::Midi { channel, message }) = LiveEvent::parse(bytes) else {
            return Self::Other;
        };
        let channel = channel.as_int();
        match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => Self::NoteOn {
                channel,
                note: key.as_int(),
                velocity: vel.as_int(),
            },
            MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => Self::NoteOff {
                channel,
                note: key.as_int(),
            },
            MidiMessage::Controller { controller, value } => Self::Controller {
                channel,
                controller: controller.as_int(),
                value: value.as_int(),
            },
            MidiMessage::ProgramChange { program } => Self::ProgramChange {
                channel,
                program: program.as_int(),
            },
            MidiMessage::ChannelAftertouch { vel } => Self::ChannelPressure {
                channel,
                pressure: vel.as_int(),
            },
            MidiMessage::PitchBend { bend } => Self::PitchBend {
                channel,
                value: bend.0.as_int(),
            },
            MidiMessage::Aftertouch { .. } => Self::Other,
        }
    }
}

/// Anything that accepts timed MIDI bytes. Returns false when the
/// destination has no room left.
pub trait EventSink {
    fn write_event(&mut self, time: u32, bytes: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    time: u32,
    offset: u32,
    len: u32,
}

/// One event borrowed from a [`MidiBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEventRef<'a> {
    pub time: u32,
    pub bytes: &'a [u8],
}

/// Time-ordered event buffer for one process block. Storage is reserved up
/// front; pushes fail instead of allocating once `capacity` bytes are used.
#[derive(Debug, Clone)]
pub struct MidiBuffer {
    bytes: Vec<u8>,
    slots: Vec<Slot>,
    capacity: usize,
}

impl Default for MidiBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MIDI_BUFFER_CAPACITY)
    }
}

pub const DEFAULT_MIDI_BUFFER_CAPACITY: usize = 4096;

impl MidiBuffer {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            // three-byte messages dominate
            slots: Vec::with_capacity(capacity / 3 + 1),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes still available before pushes start failing.
    #[must_use]
    pub fn space(&self) -> usize {
        self.capacity.saturating_sub(self.bytes.len())
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.slots.clear();
    }

    #[must_use]
    pub fn last_time(&self) -> Option<u32> {
        self.slots.last().map(|slot| slot.time)
    }

    /// Appends an event. The caller keeps times non-decreasing.
    pub fn push(&mut self, time: u32, data: &[u8]) -> bool {
        let Some(slot) = self.store(time, data) else {
            return false;
        };
        self.slots.push(slot);
        true
    }

    /// Inserts an event after every event with the same or an earlier time.
    pub fn insert(&mut self, time: u32, data: &[u8]) -> bool {
        let Some(slot) = self.store(time, data) else {
            return false;
        };
        let index = self.slots.partition_point(|existing| existing.time <= time);
        self.slots.insert(index, slot);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = MidiEventRef<'_>> + '_ {
        self.slots.iter().map(|slot| MidiEventRef {
            time: slot.time,
            bytes: &self.bytes[slot.offset as usize..(slot.offset + slot.len) as usize],
        })
    }

    /// Drops events for which `keep` returns false. Byte storage is reclaimed
    /// on the next [`clear`](Self::clear).
    pub fn retain(&mut self, mut keep: impl FnMut(MidiEventRef<'_>) -> bool) {
        let bytes = &self.bytes;
        self.slots.retain(|slot| {
            keep(MidiEventRef {
                time: slot.time,
                bytes: &bytes[slot.offset as usize..(slot.offset + slot.len) as usize],
            })
        });
    }

    /// Gives mutable access to the raw bytes of every event in order.
    pub fn for_each_bytes_mut(&mut self, mut visit: impl FnMut(&mut [u8])) {
        for slot in &self.slots {
            visit(&mut self.bytes[slot.offset as usize..(slot.offset + slot.len) as usize]);
        }
    }

    fn store(&mut self, time: u32, data: &[u8]) -> Option<Slot> {
        if data.is_empty() || data.len() > self.space() {
            return None;
        }
        let offset = u32::try_from(self.bytes.len()).ok()?;
        let len = u32::try_from(data.len()).ok()?;
        self.bytes.extend_from_slice(data);
        Some(Slot { time, offset, len })
    }
}

impl EventSink for MidiBuffer {
    fn write_event(&mut self, time: u32, bytes: &[u8]) -> bool {
        self.insert(time, bytes)
    }
}

/// The set of buffers one route processes per block. The MIDI track uses the
/// first MIDI buffer for everything it produces.
#[derive(Debug, Clone, Default)]
pub struct BufferSet {
    midi: Vec<MidiBuffer>,
}

impl BufferSet {
    /// A set with no buffers at all, used to keep diskstream bookkeeping
    /// moving through blocks that produce nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self { midi: Vec::new() }
    }

    #[must_use]
    pub fn with_midi(count: usize, capacity: usize) -> Self {
        Self {
            midi: (0..count).map(|_| MidiBuffer::with_capacity(capacity)).collect(),
        }
    }

    #[must_use]
    pub fn n_midi(&self) -> usize {
        self.midi.len()
    }

    #[must_use]
    pub fn midi(&self, index: usize) -> Option<&MidiBuffer> {
        self.midi.get(index)
    }

    pub fn midi_mut(&mut self, index: usize) -> Option<&mut MidiBuffer> {
        self.midi.get_mut(index)
    }

    pub fn clear(&mut self) {
        for buffer in &mut self.midi {
            buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_channel_and_sysex_messages() {
        assert!(midi_event_is_valid(&[0x90, 60, 100]));
        assert!(midi_event_is_valid(&[0xC3, 12]));
        assert!(midi_event_is_valid(&[0xF0, 0x7E, 0x01, 0xF7]));
        assert!(midi_event_is_valid(&[0xF8]));
        assert!(!midi_event_is_valid(&[]));
        assert!(!midi_event_is_valid(&[60, 100]));
        assert!(!midi_event_is_valid(&[0x90, 60]));
        assert!(!midi_event_is_valid(&[0x90, 60, 200]));
        assert!(!midi_event_is_valid(&[0xF0, 0x01]));
    }

    #[test]
    fn zero_velocity_note_on_is_note_off() {
        assert_eq!(
            ChannelMessage::parse(&[0x92, 64, 0]),
            ChannelMessage::NoteOff {
                channel: 2,
                note: 64
            }
        );
        assert_eq!(
            ChannelMessage::parse(&[0xE1, 0x00, 0x40]),
            ChannelMessage::PitchBend {
                channel: 1,
                value: 8192
            }
        );
    }

    #[test]
    fn insert_keeps_time_order_and_capacity() {
        let mut buffer = MidiBuffer::with_capacity(9);
        assert!(buffer.push(10, &[0x90, 60, 100]));
        assert!(buffer.insert(5, &[0x80, 60, 0]));
        assert!(buffer.insert(10, &[0xB0, 7, 90]));
        assert!(!buffer.insert(0, &[0xB0, 7, 91]), "buffer is full");

        let times: Vec<u32> = buffer.iter().map(|event| event.time).collect();
        assert_eq!(times, vec![5, 10, 10]);
        assert_eq!(buffer.iter().nth(2).map(|event| event.bytes), Some(&[0xB0, 7, 90][..]));
    }
}

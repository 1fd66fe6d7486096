use crate::midi::{
    ChannelMessage, EventSink, MIDI_CHANNELS, MIDI_CMD_NOTE_OFF, MidiBuffer,
};

/// Sounding-note bookkeeping: one 128-bit set per channel, plus the number of
/// overlapping note-ons per note so a single note-off does not end a note
/// that was struck twice.
#[derive(Debug, Clone)]
pub struct NoteTracker {
    on: [u128; MIDI_CHANNELS as usize],
    counts: [[u8; 128]; MIDI_CHANNELS as usize],
    active: usize,
}

impl Default for NoteTracker {
    fn default() -> Self {
        Self {
            on: [0; MIDI_CHANNELS as usize],
            counts: [[0; 128]; MIDI_CHANNELS as usize],
            active: 0,
        }
    }
}

impl NoteTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct (channel, note) pairs currently sounding.
    #[must_use]
    pub fn active_notes(&self) -> usize {
        self.active
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    #[must_use]
    pub fn is_on(&self, channel: u8, note: u8) -> bool {
        channel < MIDI_CHANNELS && note < 128 && self.on[usize::from(channel)] & (1 << note) != 0
    }

    /// Feeds one raw event. Anything but note-on/note-off is ignored.
    pub fn track(&mut self, bytes: &[u8]) {
        match ChannelMessage::parse(bytes) {
            ChannelMessage::NoteOn { channel, note, .. } => self.note_on(channel, note),
            ChannelMessage::NoteOff { channel, note } => self.note_off(channel, note),
            _ => {}
        }
    }

    pub fn track_buffer(&mut self, buffer: &MidiBuffer) {
        for event in buffer.iter() {
            self.track(event.bytes);
        }
    }

    pub fn note_on(&mut self, channel: u8, note: u8) {
        if channel >= MIDI_CHANNELS || note >= 128 {
            return;
        }
        let count = &mut self.counts[usize::from(channel)][usize::from(note)];
        if *count == 0 {
            self.on[usize::from(channel)] |= 1 << note;
            self.active += 1;
        }
        *count = count.saturating_add(1);
    }

    pub fn note_off(&mut self, channel: u8, note: u8) {
        if !self.is_on(channel, note) {
            return;
        }
        let count = &mut self.counts[usize::from(channel)][usize::from(note)];
        *count -= 1;
        if *count == 0 {
            self.on[usize::from(channel)] &= !(1 << note);
            self.active -= 1;
        }
    }

    /// Emits one note-off per sounding note and forgets them all. Returns
    /// the number of note-offs written.
    pub fn resolve_all(&mut self, sink: &mut impl EventSink, time: u32) -> usize {
        self.resolve_where(sink, time, |_| true)
    }

    /// Like [`resolve_all`](Self::resolve_all) but only for channels accepted
    /// by `channels`; notes on other channels stay tracked.
    pub fn resolve_where(
        &mut self,
        sink: &mut impl EventSink,
        time: u32,
        channels: impl Fn(u8) -> bool,
    ) -> usize {
        let mut resolved = 0;
        for channel in 0..MIDI_CHANNELS {
            if !channels(channel) {
                continue;
            }
            let mut sounding = self.on[usize::from(channel)];
            while sounding != 0 {
                let note = sounding.trailing_zeros() as u8;
                sounding &= sounding - 1;
                // the note is forgotten even if the sink is full, so the
                // tracker never keeps claiming notes it cannot resolve
                let _ = sink.write_event(time, &[MIDI_CMD_NOTE_OFF | channel, note, 0]);
                resolved += 1;
            }
            self.clear_channel(channel);
        }
        resolved
    }

    /// Forgets everything without emitting anything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn clear_channel(&mut self, channel: u8) {
        let index = usize::from(channel);
        self.active -= self.on[index].count_ones() as usize;
        self.on[index] = 0;
        self.counts[index] = [0; 128];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_note_ons_need_matching_offs() {
        let mut tracker = NoteTracker::new();
        tracker.track(&[0x90, 60, 100]);
        tracker.track(&[0x90, 60, 90]);
        tracker.track(&[0x80, 60, 0]);
        assert!(tracker.is_on(0, 60));
        tracker.track(&[0x90, 60, 0]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn resolve_emits_one_off_per_distinct_note_and_is_idempotent() {
        let mut tracker = NoteTracker::new();
        tracker.track(&[0x90, 60, 100]);
        tracker.track(&[0x90, 60, 100]);
        tracker.track(&[0x93, 40, 100]);

        let mut out = MidiBuffer::with_capacity(64);
        assert_eq!(tracker.resolve_all(&mut out, 7), 2);
        assert!(tracker.is_empty());
        let offs: Vec<&[u8]> = out.iter().map(|event| event.bytes).collect();
        assert_eq!(offs, vec![&[0x80, 60, 0][..], &[0x83, 40, 0][..]]);

        assert_eq!(tracker.resolve_all(&mut out, 7), 0);
    }

    #[test]
    fn resolve_where_leaves_other_channels_tracked() {
        let mut tracker = NoteTracker::new();
        tracker.note_on(0, 60);
        tracker.note_on(1, 61);
        let mut out = MidiBuffer::with_capacity(64);
        assert_eq!(tracker.resolve_where(&mut out, 0, |channel| channel == 1), 1);
        assert!(tracker.is_on(0, 60));
        assert!(!tracker.is_on(1, 61));
        assert_eq!(tracker.active_notes(), 1);
    }
}

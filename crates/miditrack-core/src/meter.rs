use std::sync::atomic::{AtomicU8, Ordering};

use crate::midi::{ChannelMessage, MIDI_CHANNELS, MidiBuffer};

/// Where the track meters its signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MeterPoint {
    #[default]
    Input,
    PostFader,
}

/// Per-channel MIDI activity meter: the loudest note-on velocity seen since
/// the last [`reset`](Self::reset). Readable from any thread.
#[derive(Debug, Default)]
pub struct InputMeter {
    peaks: [AtomicU8; MIDI_CHANNELS as usize],
}

impl InputMeter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&self, buffer: &MidiBuffer) {
        for event in buffer.iter() {
            if let ChannelMessage::NoteOn {
                channel, velocity, ..
            } = ChannelMessage::parse(event.bytes)
            {
                self.peaks[usize::from(channel)].fetch_max(velocity, Ordering::Relaxed);
            }
        }
    }

    #[must_use]
    pub fn peak(&self, channel: u8) -> u8 {
        self.peaks
            .get(usize::from(channel))
            .map_or(0, |peak| peak.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn max_peak(&self) -> u8 {
        (0..MIDI_CHANNELS).map(|channel| self.peak(channel)).max().unwrap_or(0)
    }

    pub fn reset(&self) {
        for peak in &self.peaks {
            peak.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_loudest_velocity_per_channel() {
        let meter = InputMeter::new();
        let mut buffer = MidiBuffer::with_capacity(64);
        buffer.push(0, &[0x90, 60, 40]);
        buffer.push(1, &[0x90, 62, 90]);
        buffer.push(2, &[0x93, 62, 70]);
        buffer.push(3, &[0xB0, 7, 127]);
        meter.run(&buffer);

        assert_eq!(meter.peak(0), 90);
        assert_eq!(meter.peak(3), 70);
        assert_eq!(meter.max_peak(), 90);
        meter.reset();
        assert_eq!(meter.max_peak(), 0);
    }
}

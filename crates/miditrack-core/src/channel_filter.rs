use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::midi::{MIDI_CHANNELS, MidiBuffer, event_channel};

pub const ALL_CHANNELS_MASK: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelMode {
    #[default]
    AllChannels,
    FilterChannels,
    ForceChannel,
}

impl ChannelMode {
    fn to_bits(self) -> u32 {
        match self {
            Self::AllChannels => 0,
            Self::FilterChannels => 1,
            Self::ForceChannel => 2,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::FilterChannels,
            2 => Self::ForceChannel,
            _ => Self::AllChannels,
        }
    }
}

/// Channel admission policy for one direction (playback or capture).
///
/// Mode and mask share a single atomic word so the realtime reader always
/// sees a consistent pair, whatever thread last changed it.
#[derive(Debug)]
pub struct ChannelFilter {
    packed: AtomicU32,
}

impl Default for ChannelFilter {
    fn default() -> Self {
        Self::new(ChannelMode::AllChannels, ALL_CHANNELS_MASK)
    }
}

impl ChannelFilter {
    #[must_use]
    pub fn new(mode: ChannelMode, mask: u16) -> Self {
        Self {
            packed: AtomicU32::new(pack(mode, normalize_mask(mode, mask))),
        }
    }

    #[must_use]
    pub fn mode(&self) -> ChannelMode {
        self.load().0
    }

    #[must_use]
    pub fn mask(&self) -> u16 {
        self.load().1
    }

    /// Mode and mask observed together.
    #[must_use]
    pub fn load(&self) -> (ChannelMode, u16) {
        unpack(self.packed.load(Ordering::Acquire))
    }

    /// Sets mode and mask in one step. Returns true if anything changed.
    pub fn set_channel_mode(&self, mode: ChannelMode, mask: u16) -> bool {
        let next = pack(mode, normalize_mask(mode, mask));
        self.packed.swap(next, Ordering::AcqRel) != next
    }

    /// Replaces the mask, keeping the current mode. Returns true if the mask
    /// changed.
    pub fn set_channel_mask(&self, mask: u16) -> bool {
        let mut changed = false;
        let _ = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let (mode, _) = unpack(current);
                let next = pack(mode, normalize_mask(mode, mask));
                changed = next != current;
                Some(next)
            });
        changed
    }

    /// Whether events on `channel` pass this filter unchanged.
    #[must_use]
    pub fn admit(&self, channel: u8) -> bool {
        let (mode, mask) = self.load();
        admits(mode, mask, channel)
    }

    /// Applies the policy to a buffer in place: drops rejected channel
    /// messages, or in force mode moves every channel message onto the
    /// forced channel. System messages always pass.
    pub fn filter(&self, buffer: &mut MidiBuffer) {
        let (mode, mask) = self.load();
        match mode {
            ChannelMode::AllChannels => {}
            ChannelMode::FilterChannels => buffer.retain(|event| {
                event_channel(event.bytes).is_none_or(|channel| admits(mode, mask, channel))
            }),
            ChannelMode::ForceChannel => {
                let forced = forced_channel(mask);
                buffer.for_each_bytes_mut(|bytes| {
                    if event_channel(bytes).is_some() {
                        bytes[0] = (bytes[0] & 0xF0) | forced;
                    }
                });
            }
        }
    }
}

impl ChannelFilter {
    /// Per-event form of [`filter`](Self::filter): returns false if the
    /// event should be dropped, rewriting its channel in force mode.
    pub fn apply(&self, bytes: &mut [u8]) -> bool {
        let Some(channel) = event_channel(bytes) else {
            return true;
        };
        let (mode, mask) = self.load();
        match mode {
            ChannelMode::AllChannels => true,
            ChannelMode::FilterChannels => admits(mode, mask, channel),
            ChannelMode::ForceChannel => {
                bytes[0] = (bytes[0] & 0xF0) | forced_channel(mask);
                true
            }
        }
    }
}

fn admits(mode: ChannelMode, mask: u16, channel: u8) -> bool {
    if channel >= MIDI_CHANNELS {
        return false;
    }
    match mode {
        ChannelMode::AllChannels => true,
        ChannelMode::FilterChannels | ChannelMode::ForceChannel => mask & (1 << channel) != 0,
    }
}

fn forced_channel(mask: u16) -> u8 {
    if mask == 0 {
        0
    } else {
        mask.trailing_zeros() as u8
    }
}

/// Force mode keeps exactly one bit: the lowest one set, or channel 0.
fn normalize_mask(mode: ChannelMode, mask: u16) -> u16 {
    match mode {
        ChannelMode::ForceChannel => 1 << forced_channel(mask),
        ChannelMode::AllChannels | ChannelMode::FilterChannels => mask,
    }
}

fn pack(mode: ChannelMode, mask: u16) -> u32 {
    (mode.to_bits() << 16) | u32::from(mask)
}

fn unpack(packed: u32) -> (ChannelMode, u16) {
    (ChannelMode::from_bits(packed >> 16), (packed & 0xFFFF) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_channel_admits_only_the_forced_channel() {
        let filter = ChannelFilter::default();
        assert!(filter.set_channel_mode(ChannelMode::ForceChannel, 1 << 5));
        assert!(!filter.admit(3));
        assert!(filter.admit(5));
    }

    #[test]
    fn force_channel_keeps_lowest_bit_only() {
        let filter = ChannelFilter::new(ChannelMode::ForceChannel, 0b1011_0000);
        assert_eq!(filter.mask(), 0b0001_0000);
        let empty = ChannelFilter::new(ChannelMode::ForceChannel, 0);
        assert_eq!(empty.mask(), 1);
    }

    #[test]
    fn unchanged_settings_report_no_change() {
        let filter = ChannelFilter::default();
        assert!(!filter.set_channel_mode(ChannelMode::AllChannels, ALL_CHANNELS_MASK));
        assert!(filter.set_channel_mask(0x00FF));
        assert!(!filter.set_channel_mask(0x00FF));
        assert_eq!(filter.load(), (ChannelMode::AllChannels, 0x00FF));
    }

    #[test]
    fn filter_drops_and_rewrites_channels() {
        let mut buffer = MidiBuffer::with_capacity(64);
        buffer.push(0, &[0x90, 60, 100]);
        buffer.push(1, &[0x93, 62, 100]);
        buffer.push(2, &[0xF8]);

        let filter = ChannelFilter::new(ChannelMode::FilterChannels, 1 << 3);
        let mut filtered = buffer.clone();
        filter.filter(&mut filtered);
        let kept: Vec<&[u8]> = filtered.iter().map(|event| event.bytes).collect();
        assert_eq!(kept, vec![&[0x93, 62, 100][..], &[0xF8][..]]);

        let force = ChannelFilter::new(ChannelMode::ForceChannel, 1 << 9);
        force.filter(&mut buffer);
        let statuses: Vec<u8> = buffer.iter().map(|event| event.bytes[0]).collect();
        assert_eq!(statuses, vec![0x99, 0x99, 0xF8]);
    }
}

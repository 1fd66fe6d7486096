//! Disk-side producer/consumer of a track's MIDI: reads the playlist ahead
//! of the playhead for playback and collects captured input for the write
//! source.

use std::{collections::VecDeque, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    channel_filter::ChannelFilter,
    config::DiskstreamConfig,
    midi::{BufferSet, ChannelMessage, MidiBuffer},
    note_tracker::NoteTracker,
    playlist::{MidiPlaylist, SourceId, TimedEvent},
    time::{FrameCount, FramePos, PFrames, TempoMap},
    track::NoteMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DiskstreamError {
    #[error("playback buffer underrun at frame {frame}")]
    Underrun { frame: FramePos },
    #[error("capture buffer overrun, {dropped} events dropped")]
    Overrun { dropped: usize },
    #[error("diskstream has no playlist")]
    NoPlaylist,
}

impl DiskstreamError {
    /// Negative status code reported to the engine.
    #[must_use]
    pub fn status(&self) -> i32 {
        match self {
            Self::Underrun { .. } => -1,
            Self::Overrun { .. } => -2,
            Self::NoPlaylist => -3,
        }
    }
}

/// Result of one [`Diskstream::process`] call. The playback distance is
/// valid even when `result` is an error, so the caller can still commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    pub playback_distance: FrameCount,
    pub result: Result<(), DiskstreamError>,
}

pub type DataRecordedHandler = Arc<dyn Fn(SourceId) + Send + Sync>;

pub trait Diskstream: Send {
    fn name(&self) -> &str;

    fn calculate_playback_distance(&self, nframes: PFrames) -> FrameCount;

    /// Whether a seek of `distance` frames can be served from what is
    /// already buffered.
    fn can_internal_playback_seek(&self, distance: FrameCount) -> bool;

    fn internal_playback_seek(&mut self, distance: FrameCount);

    /// Captures from and/or plays back into `bufs.midi(0)` for one block.
    /// With `can_monitor_disk` the buffer is replaced by disk playback.
    fn process(
        &mut self,
        bufs: &mut BufferSet,
        transport_frame: FramePos,
        nframes: PFrames,
        can_monitor_disk: bool,
    ) -> Processed;

    /// Finishes the block. Returns true if the butler should run.
    fn commit(&mut self, playback_distance: FrameCount) -> bool;

    /// Drops buffered playback events in `[start, end)` without delivering
    /// them.
    fn flush_playback(&mut self, start: FramePos, end: FramePos);

    fn set_note_mode(&mut self, mode: NoteMode);

    fn reset_tracker(&mut self);

    fn write_source(&self) -> Option<SourceId>;

    fn record_enabled(&self) -> bool;

    fn set_record_enabled(&mut self, enabled: bool);

    fn playlist(&self) -> Option<Arc<MidiPlaylist>>;

    fn set_playback_filter(&mut self, filter: Arc<ChannelFilter>);

    fn set_data_recorded_handler(&mut self, handler: Option<DataRecordedHandler>);

    fn set_block_size(&mut self, nframes: PFrames);

    /// Non-realtime relocate: discards buffered data and restarts at `frame`.
    fn seek(&mut self, frame: FramePos);

    /// Butler work: fill the playback buffer. Returns true if more work is
    /// pending.
    fn do_refill(&mut self) -> Result<bool, DiskstreamError> {
        Ok(false)
    }

    /// Butler work: move captured data to the write source.
    fn do_flush(&mut self) -> Result<usize, DiskstreamError> {
        Ok(0)
    }
}

/// A captured input event, stamped with its absolute timeline frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    pub frame: FramePos,
    pub bytes: Vec<u8>,
}

/// In-memory diskstream over a session playlist.
pub struct PlaylistDiskstream {
    name: String,
    playlist: Option<Arc<MidiPlaylist>>,
    tempo_map: Arc<TempoMap>,
    config: DiskstreamConfig,
    note_mode: NoteMode,
    playback_filter: Arc<ChannelFilter>,
    tracker: NoteTracker,
    /// Frame the next process call plays from.
    playback_sample: FramePos,
    /// Playlist has been read up to here.
    file_frame: FramePos,
    read_ahead: VecDeque<TimedEvent>,
    /// Note-offs passed over without playing, sent at the start of the next
    /// played block.
    pending_note_offs: Vec<TimedEvent>,
    last_distance: FrameCount,
    block_size: PFrames,
    record_enabled: bool,
    capture_limit: usize,
    capture: Vec<CapturedEvent>,
    write_source: Option<SourceId>,
    recorded: Vec<CapturedEvent>,
    data_recorded: Option<DataRecordedHandler>,
}

impl std::fmt::Debug for PlaylistDiskstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaylistDiskstream")
            .field("name", &self.name)
            .field("playback_sample", &self.playback_sample)
            .field("file_frame", &self.file_frame)
            .field("buffered_events", &self.read_ahead.len())
            .field("record_enabled", &self.record_enabled)
            .finish_non_exhaustive()
    }
}

impl PlaylistDiskstream {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        playlist: Option<Arc<MidiPlaylist>>,
        tempo_map: Arc<TempoMap>,
        config: DiskstreamConfig,
    ) -> Self {
        Self {
            name: name.into(),
            playlist,
            tempo_map,
            config,
            note_mode: NoteMode::Sustained,
            playback_filter: Arc::new(ChannelFilter::default()),
            tracker: NoteTracker::new(),
            playback_sample: 0,
            file_frame: 0,
            read_ahead: VecDeque::new(),
            pending_note_offs: Vec::with_capacity(128),
            last_distance: 0,
            block_size: 512,
            record_enabled: false,
            capture_limit: 16_384,
            capture: Vec::new(),
            write_source: None,
            recorded: Vec::new(),
            data_recorded: None,
        }
    }

    #[must_use]
    pub fn playback_sample(&self) -> FramePos {
        self.playback_sample
    }

    /// Frames buffered ahead of the playhead.
    #[must_use]
    pub fn buffered_frames(&self) -> FrameCount {
        (self.file_frame - self.playback_sample).max(0)
    }

    #[must_use]
    pub fn note_mode(&self) -> NoteMode {
        self.note_mode
    }

    /// Notes played back and not yet ended.
    #[must_use]
    pub fn active_playback_notes(&self) -> usize {
        self.tracker.active_notes()
    }

    /// Everything moved to the write source so far.
    #[must_use]
    pub fn recorded(&self) -> &[CapturedEvent] {
        &self.recorded
    }

    pub fn set_playlist(&mut self, playlist: Option<Arc<MidiPlaylist>>) {
        self.playlist = playlist;
        let frame = self.playback_sample;
        self.seek(frame);
    }

    pub fn set_tempo_map(&mut self, tempo_map: Arc<TempoMap>) {
        self.tempo_map = tempo_map;
    }

    /// Bounds how many captured events are kept between butler flushes.
    pub fn set_capture_limit(&mut self, limit: usize) {
        self.capture_limit = limit.max(1);
    }

    fn playlist_end(&self) -> FramePos {
        self.playlist.as_ref().map_or(0, |playlist| playlist.end())
    }

    fn capture_input(&mut self, buffer: &MidiBuffer, transport_frame: FramePos) -> Result<(), DiskstreamError> {
        let mut dropped = 0;
        for event in buffer.iter() {
            if self.capture.len() >= self.capture_limit {
                dropped += 1;
                continue;
            }
            self.capture.push(CapturedEvent {
                frame: transport_frame + FramePos::from(event.time),
                bytes: event.bytes.to_vec(),
            });
        }
        if dropped > 0 {
            return Err(DiskstreamError::Overrun { dropped });
        }
        Ok(())
    }

    fn play_back(&mut self, buffer: &mut MidiBuffer, nframes: PFrames) {
        buffer.clear();
        for event in self.pending_note_offs.drain(..) {
            if !buffer.push(0, event.data()) {
                trace!(diskstream = %self.name, "playback buffer full");
            }
        }
        let end = self.playback_sample + FrameCount::from(nframes);
        while let Some(event) = self.read_ahead.front().copied() {
            if event.frame >= end {
                break;
            }
            self.read_ahead.pop_front();
            if event.frame < self.playback_sample {
                continue;
            }

            let is_note_off = matches!(ChannelMessage::parse(event.data()), ChannelMessage::NoteOff { .. });
            if is_note_off && self.note_mode == NoteMode::Percussive {
                continue;
            }

            let mut bytes = event.bytes;
            let data = &mut bytes[..usize::from(event.size)];
            if !self.playback_filter.apply(data) {
                continue;
            }
            let data = &*data;
            let offset = u32::try_from(event.frame - self.playback_sample).unwrap_or(0);
            if buffer.push(offset, data) {
                self.tracker.track(data);
            } else {
                trace!(diskstream = %self.name, "playback buffer full");
            }
        }
    }

    fn discard_before(&mut self, frame: FramePos) {
        while self.read_ahead.front().is_some_and(|event| event.frame < frame) {
            let Some(mut event) = self.read_ahead.pop_front() else {
                break;
            };
            // notes that end while skipped still end
            let size = usize::from(event.size);
            if !self.playback_filter.apply(&mut event.bytes[..size]) {
                continue;
            }
            if let ChannelMessage::NoteOff { channel, note } = ChannelMessage::parse(event.data()) {
                if self.tracker.is_on(channel, note) {
                    self.tracker.track(event.data());
                    if self.note_mode == NoteMode::Sustained {
                        self.pending_note_offs.push(event);
                    }
                }
            }
        }
    }
}

impl Diskstream for PlaylistDiskstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn calculate_playback_distance(&self, nframes: PFrames) -> FrameCount {
        FrameCount::from(nframes)
    }

    fn can_internal_playback_seek(&self, distance: FrameCount) -> bool {
        distance <= FrameCount::from(self.config.internal_seek_limit_frames)
            && distance <= self.buffered_frames()
    }

    fn internal_playback_seek(&mut self, distance: FrameCount) {
        let target = self.playback_sample + distance;
        self.discard_before(target);
        self.playback_sample = target;
        trace!(diskstream = %self.name, target, "internal playback seek");
    }

    fn process(
        &mut self,
        bufs: &mut BufferSet,
        transport_frame: FramePos,
        nframes: PFrames,
        can_monitor_disk: bool,
    ) -> Processed {
        let playback_distance = self.calculate_playback_distance(nframes);
        self.last_distance = playback_distance;
        if nframes == 0 {
            return Processed {
                playback_distance: 0,
                result: Ok(()),
            };
        }

        let Some(buffer) = bufs.midi_mut(0) else {
            return Processed {
                playback_distance,
                result: Ok(()),
            };
        };

        let mut result = Ok(());
        if self.record_enabled {
            result = self.capture_input(buffer, transport_frame);
        }

        if can_monitor_disk && self.playlist.is_some() {
            let end = self.playback_sample + playback_distance;
            if self.file_frame < end && self.file_frame < self.playlist_end() {
                warn!(diskstream = %self.name, frame = self.playback_sample, "playback underrun");
                return Processed {
                    playback_distance,
                    result: Err(DiskstreamError::Underrun {
                        frame: self.playback_sample,
                    }),
                };
            }
            self.play_back(buffer, nframes);
        }

        Processed {
            playback_distance,
            result,
        }
    }

    fn commit(&mut self, playback_distance: FrameCount) -> bool {
        if playback_distance > 0 {
            self.playback_sample += playback_distance;
            self.discard_before(self.playback_sample);
        }
        let refill_wanted = self.playlist.is_some()
            && self.file_frame < self.playlist_end()
            && self.buffered_frames() < FrameCount::from(self.config.refill_threshold_frames);
        let flush_wanted = !self.capture.is_empty()
            && self.capture.len() * 2 >= self.capture_limit;
        refill_wanted || flush_wanted
    }

    fn flush_playback(&mut self, start: FramePos, end: FramePos) {
        let before = self.read_ahead.len();
        self.read_ahead
            .retain(|event| event.frame < start || event.frame >= end);
        trace!(diskstream = %self.name, flushed = before - self.read_ahead.len(), "playback flushed");
    }

    fn set_note_mode(&mut self, mode: NoteMode) {
        self.note_mode = mode;
    }

    fn reset_tracker(&mut self) {
        self.tracker.reset();
        self.pending_note_offs.clear();
    }

    fn write_source(&self) -> Option<SourceId> {
        self.write_source
    }

    fn record_enabled(&self) -> bool {
        self.record_enabled
    }

    fn set_record_enabled(&mut self, enabled: bool) {
        if enabled && self.write_source.is_none() {
            self.write_source = Some(Uuid::new_v4());
        }
        self.record_enabled = enabled;
    }

    fn playlist(&self) -> Option<Arc<MidiPlaylist>> {
        self.playlist.clone()
    }

    fn set_playback_filter(&mut self, filter: Arc<ChannelFilter>) {
        self.playback_filter = filter;
    }

    fn set_data_recorded_handler(&mut self, handler: Option<DataRecordedHandler>) {
        self.data_recorded = handler;
    }

    fn set_block_size(&mut self, nframes: PFrames) {
        self.block_size = nframes.max(1);
    }

    #[instrument(skip(self), fields(diskstream = %self.name))]
    fn seek(&mut self, frame: FramePos) {
        self.read_ahead.clear();
        self.pending_note_offs.clear();
        self.playback_sample = frame;
        self.file_frame = frame;
        self.tracker.reset();
        debug!("diskstream relocated");
    }

    fn do_refill(&mut self) -> Result<bool, DiskstreamError> {
        let Some(playlist) = self.playlist.clone() else {
            return Err(DiskstreamError::NoPlaylist);
        };
        let target = self.playback_sample + FrameCount::from(self.config.read_ahead_frames);
        if target <= self.file_frame {
            return Ok(false);
        }
        let from = self.file_frame.max(self.playback_sample);
        let events = playlist.read(&self.tempo_map, from, target);
        trace!(diskstream = %self.name, from, target, events = events.len(), "refilled");
        self.read_ahead.extend(events);
        self.file_frame = target;
        Ok(false)
    }

    fn do_flush(&mut self) -> Result<usize, DiskstreamError> {
        if self.capture.is_empty() {
            return Ok(0);
        }
        let Some(source) = self.write_source else {
            warn!(diskstream = %self.name, "captured data without a write source");
            return Ok(0);
        };
        let count = self.capture.len();
        self.recorded.append(&mut self.capture);
        info!(diskstream = %self.name, %source, events = count, "captured data written");
        if let Some(handler) = &self.data_recorded {
            handler(source);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use crate::playlist::{MidiModel, MidiNote, MidiRegion};

    use super::*;

    fn playlist() -> Arc<MidiPlaylist> {
        let mut playlist = MidiPlaylist::new("take 1");
        playlist.regions.push(MidiRegion::new(
            "phrase",
            0,
            96_000,
            MidiModel {
                notes: vec![
                    MidiNote {
                        pitch: 60,
                        velocity: 100,
                        start_beats: 0.0,
                        length_beats: 0.5,
                        channel: 0,
                    },
                    MidiNote {
                        pitch: 64,
                        velocity: 100,
                        start_beats: 0.0,
                        length_beats: 0.5,
                        channel: 2,
                    },
                ],
                controls: Vec::new(),
            },
        ));
        Arc::new(playlist)
    }

    fn diskstream() -> PlaylistDiskstream {
        PlaylistDiskstream::new(
            "ds",
            Some(playlist()),
            Arc::new(TempoMap::constant(120.0, 48_000)),
            DiskstreamConfig::default(),
        )
    }

    #[test]
    fn process_before_refill_underruns() {
        let mut ds = diskstream();
        let mut bufs = BufferSet::with_midi(1, 256);
        let processed = ds.process(&mut bufs, 0, 512, true);
        assert_eq!(processed.result, Err(DiskstreamError::Underrun { frame: 0 }));
        assert_eq!(processed.playback_distance, 512);
    }

    #[test]
    fn plays_back_filtered_and_commits() {
        let mut ds = diskstream();
        ds.set_playback_filter(Arc::new(ChannelFilter::new(
            crate::channel_filter::ChannelMode::FilterChannels,
            0b0001,
        )));
        ds.do_refill().expect("refill with a playlist");

        let mut bufs = BufferSet::with_midi(1, 256);
        let processed = ds.process(&mut bufs, 0, 512, true);
        assert_eq!(processed.result, Ok(()));
        let events: Vec<&[u8]> = bufs.midi(0).map_or_else(Vec::new, |buffer| {
            buffer.iter().map(|event| event.bytes).collect()
        });
        assert_eq!(events, vec![&[0x90, 60, 100][..]]);
        assert_eq!(ds.active_playback_notes(), 1);

        ds.commit(processed.playback_distance);
        assert_eq!(ds.playback_sample(), 512);
    }

    #[test]
    fn percussive_mode_drops_note_offs() {
        let mut ds = diskstream();
        ds.set_note_mode(NoteMode::Percussive);
        ds.do_refill().expect("refill with a playlist");
        ds.internal_playback_seek(11_000);

        let mut bufs = BufferSet::with_midi(1, 256);
        let processed = ds.process(&mut bufs, 11_000, 2_000, true);
        assert_eq!(processed.result, Ok(()));
        assert!(bufs.midi(0).is_some_and(MidiBuffer::is_empty));
    }

    #[test]
    fn note_offs_skipped_by_a_seek_play_on_the_next_block() {
        let mut ds = diskstream();
        ds.do_refill().expect("refill with a playlist");
        let mut bufs = BufferSet::with_midi(1, 256);
        let processed = ds.process(&mut bufs, 0, 512, true);
        ds.commit(processed.playback_distance);
        assert_eq!(ds.active_playback_notes(), 2);

        // both notes end at frame 12_000
        ds.internal_playback_seek(12_000);
        let processed = ds.process(&mut bufs, 12_512, 512, true);
        assert_eq!(processed.result, Ok(()));
        let events: Vec<(u32, Vec<u8>)> = bufs.midi(0).map_or_else(Vec::new, |buffer| {
            buffer
                .iter()
                .map(|event| (event.time, event.bytes.to_vec()))
                .collect()
        });
        assert_eq!(events, vec![(0, vec![0x80, 60, 0]), (0, vec![0x82, 64, 0])]);
        assert_eq!(ds.active_playback_notes(), 0);
    }

    #[test]
    fn flush_moves_capture_and_notifies() {
        let mut ds = diskstream();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ds.set_data_recorded_handler(Some(Arc::new(move |source| sink.lock().push(source))));
        ds.set_record_enabled(true);

        let mut bufs = BufferSet::with_midi(1, 256);
        if let Some(buffer) = bufs.midi_mut(0) {
            buffer.push(3, &[0x91, 50, 80]);
        }
        let processed = ds.process(&mut bufs, 1_000, 64, false);
        assert_eq!(processed.result, Ok(()));

        assert_eq!(ds.do_flush(), Ok(1));
        assert_eq!(ds.recorded()[0].frame, 1_003);
        assert_eq!(*seen.lock(), vec![ds.write_source().expect("source created on record enable")]);
    }
}

//! The MIDI track: per-block roll engine plus the control-side operations
//! the session and UI use to configure it.
//!
//! Everything reachable from the process thread (`roll`, `no_roll`,
//! `realtime_*`) only ever *tries* locks. When a lock is held by a control
//! thread the block takes a degraded path instead of waiting.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    automation::{
        AutoState, AutomationList, ControlError, MidiControl, Parameter, describe_parameter,
        midi_parameter,
    },
    channel_filter::{ChannelFilter, ChannelMode},
    config::TrackConfig,
    diskstream::{DataRecordedHandler, Diskstream, DiskstreamError},
    immediate::{ImmediateEventQueue, MAX_EVENT_SIZE},
    meter::{InputMeter, MeterPoint},
    midi::{
        BufferSet, ChannelMessage, MIDI_CHANNELS, MIDI_CMD_CONTROL, MIDI_CTL_ALL_NOTES_OFF,
        MIDI_CTL_RESET_CONTROLLERS, MIDI_CTL_SUSTAIN, MidiBuffer, midi_event_is_valid,
        midi_event_type,
    },
    note_tracker::NoteTracker,
    playlist::{MidiPlaylist, SourceId},
    processor::{MidiDelivery, MuteMaster, ProcessorChain},
    session::{RecordStatus, Session},
    signal::{Connection, Signal},
    state::{FreezeProcessorState, FreezeRecord, FreezeState, HexMask, MidiTrackState, YesNo},
    time::{BeatsFramesConverter, FramePos, PFrames},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoteMode {
    #[default]
    Sustained,
    /// Note lengths are ignored on playback; only note-ons are sent.
    Percussive,
}

/// What the user asked to hear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorChoice {
    #[default]
    Auto,
    Input,
    Disk,
    Cue,
}

impl MonitorChoice {
    fn to_bits(self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::Input => 1,
            Self::Disk => 2,
            Self::Cue => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Input,
            2 => Self::Disk,
            3 => Self::Cue,
            _ => Self::Auto,
        }
    }

    fn includes_input(self) -> bool {
        matches!(self, Self::Input | Self::Cue)
    }
}

/// What the track actually plays for the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Silence,
    Input,
    Disk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ImmediateEventError {
    #[error("illegal immediate MIDI event")]
    Invalid,
    #[error("immediate MIDI event of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("immediate event queue is full")]
    Overflow,
}

/// A diskstream fault during a block. The block was silenced and the
/// diskstream still committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("diskstream fault during roll: {source}")]
pub struct RollError {
    pub source: DiskstreamError,
    pub need_butler: bool,
}

impl RollError {
    #[must_use]
    pub fn status(&self) -> i32 {
        self.source.status()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollPath {
    /// Processor lock busy: nothing touched but the diskstream position.
    LockUnavailable,
    /// No outputs and no processors, so nothing would consume the data.
    NoOutputs,
    Inactive,
    /// Initial delay swallowed the whole block.
    DelayedStart,
    Rolled,
    /// Transport stopped: input, immediate events and processors only.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollOutcome {
    pub path: RollPath,
    pub need_butler: bool,
}

impl RollOutcome {
    const fn new(path: RollPath, need_butler: bool) -> Self {
        Self { path, need_butler }
    }
}

/// Buffers for one process call: what arrived on the track's input port,
/// the session's scratch buffers for this route, and the output port.
pub struct ProcessScope<'a> {
    pub input: &'a MidiBuffer,
    pub bufs: &'a mut BufferSet,
    pub output: &'a mut MidiBuffer,
    /// Non-zero when the engine splits a cycle.
    pub port_offset: u32,
}

#[derive(Debug, Default)]
pub struct TrackSignals {
    pub diskstream_changed: Signal<()>,
    pub freeze_change: Signal<()>,
    pub step_edit_status_change: Signal<bool>,
    pub input_active_changed: Signal<bool>,
    pub data_recorded: Signal<SourceId>,
}

pub struct MidiTrack {
    name: String,
    weak_self: Weak<MidiTrack>,
    session: Arc<dyn Session>,
    processors: RwLock<ProcessorChain>,
    diskstream: Mutex<Box<dyn Diskstream>>,
    mute_master: Arc<MuteMaster>,
    playback_filter: Arc<ChannelFilter>,
    capture_filter: ChannelFilter,
    immediate_events: ImmediateEventQueue,
    step_edit_ring: ImmediateEventQueue,
    note_tracker: Mutex<NoteTracker>,
    controls: Mutex<BTreeMap<Parameter, MidiControl>>,
    meter: InputMeter,
    meter_at_input: AtomicBool,
    note_mode: Mutex<NoteMode>,
    step_editing: AtomicBool,
    input_active: AtomicBool,
    input_port_active: AtomicBool,
    record_enabled: AtomicBool,
    active: AtomicBool,
    silent: AtomicBool,
    monitoring: AtomicU8,
    roll_delay: AtomicI64,
    /// Playback distance of blocks that ran without the diskstream lock.
    skipped_frames: AtomicI64,
    n_outputs: AtomicU32,
    freeze_record: Mutex<FreezeRecord>,
    pending_state: Mutex<Option<MidiTrackState>>,
    state_ready_connection: Mutex<Option<Connection>>,
    signals: TrackSignals,
}

impl fmt::Debug for MidiTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiTrack")
            .field("name", &self.name)
            .field("note_mode", &self.note_mode())
            .field("playback_filter", &self.playback_filter.load())
            .field("capture_filter", &self.capture_filter.load())
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl MidiTrack {
    /// Creates a track owning `diskstream`, with a single MIDI delivery as
    /// its main output.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        session: Arc<dyn Session>,
        diskstream: Box<dyn Diskstream>,
        config: &TrackConfig,
    ) -> Arc<Self> {
        let name = name.into();
        let mute_master = Arc::new(MuteMaster::new());
        let mut processors = ProcessorChain::new();
        processors.push(Arc::new(MidiDelivery::new(
            format!("{name} out"),
            Arc::clone(&mute_master),
        )));

        let track = Arc::new_cyclic(|weak_self| Self {
            name,
            weak_self: weak_self.clone(),
            session,
            processors: RwLock::new(processors),
            diskstream: Mutex::new(diskstream),
            mute_master,
            playback_filter: Arc::new(ChannelFilter::default()),
            capture_filter: ChannelFilter::default(),
            immediate_events: ImmediateEventQueue::new(config.immediate_capacity),
            step_edit_ring: ImmediateEventQueue::new(config.step_edit_capacity),
            note_tracker: Mutex::new(NoteTracker::new()),
            controls: Mutex::new(BTreeMap::new()),
            meter: InputMeter::new(),
            meter_at_input: AtomicBool::new(true),
            note_mode: Mutex::new(config.default_note_mode),
            step_editing: AtomicBool::new(false),
            input_active: AtomicBool::new(true),
            input_port_active: AtomicBool::new(true),
            record_enabled: AtomicBool::new(false),
            active: AtomicBool::new(true),
            silent: AtomicBool::new(true),
            monitoring: AtomicU8::new(MonitorChoice::Auto.to_bits()),
            roll_delay: AtomicI64::new(0),
            skipped_frames: AtomicI64::new(0),
            n_outputs: AtomicU32::new(1),
            freeze_record: Mutex::new(FreezeRecord::default()),
            pending_state: Mutex::new(None),
            state_ready_connection: Mutex::new(None),
            signals: TrackSignals::default(),
        });

        {
            let mut diskstream = track.diskstream.lock();
            track.attach_diskstream(diskstream.as_mut());
        }
        info!(track = %track.name, "midi track created");
        track
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    #[must_use]
    pub fn signals(&self) -> &TrackSignals {
        &self.signals
    }

    /// The processor chain lock. The process thread only try-reads it, so a
    /// writer holding it makes blocks take the degraded path.
    #[must_use]
    pub fn processors(&self) -> &RwLock<ProcessorChain> {
        &self.processors
    }

    #[must_use]
    pub fn diskstream(&self) -> &Mutex<Box<dyn Diskstream>> {
        &self.diskstream
    }

    #[must_use]
    pub fn playback_filter(&self) -> &ChannelFilter {
        &self.playback_filter
    }

    #[must_use]
    pub fn capture_filter(&self) -> &ChannelFilter {
        &self.capture_filter
    }

    #[must_use]
    pub fn immediate_events(&self) -> &ImmediateEventQueue {
        &self.immediate_events
    }

    #[must_use]
    pub fn meter(&self) -> &InputMeter {
        &self.meter
    }

    #[must_use]
    pub fn mute_master(&self) -> &Arc<MuteMaster> {
        &self.mute_master
    }

    #[must_use]
    pub fn note_mode(&self) -> NoteMode {
        *self.note_mode.lock()
    }

    #[must_use]
    pub fn step_editing(&self) -> bool {
        self.step_editing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn input_active(&self) -> bool {
        self.input_active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn record_enabled(&self) -> bool {
        self.record_enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        if self.active.swap(active, Ordering::AcqRel) != active {
            info!(track = %self.name, active, "track activation changed");
        }
    }

    /// True until a block has actually rolled.
    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.silent.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn n_outputs(&self) -> u32 {
        self.n_outputs.load(Ordering::Acquire)
    }

    pub fn set_n_outputs(&self, outputs: u32) {
        self.n_outputs.store(outputs, Ordering::Release);
    }

    /// Frames of initial latency compensation still to swallow.
    #[must_use]
    pub fn roll_delay(&self) -> FramePos {
        self.roll_delay.load(Ordering::Acquire)
    }

    pub fn set_roll_delay(&self, frames: FramePos) {
        self.roll_delay.store(frames.max(0), Ordering::Release);
    }

    #[must_use]
    pub fn meter_point(&self) -> MeterPoint {
        if self.meter_at_input.load(Ordering::Acquire) {
            MeterPoint::Input
        } else {
            MeterPoint::PostFader
        }
    }

    pub fn set_meter_point(&self, point: MeterPoint) {
        self.meter_at_input
            .store(point == MeterPoint::Input, Ordering::Release);
    }

    /// Sounding notes the track would resolve on mute or locate.
    #[must_use]
    pub fn active_notes(&self) -> usize {
        self.note_tracker.lock().active_notes()
    }

    #[must_use]
    pub fn playlist(&self) -> Option<Arc<MidiPlaylist>> {
        self.diskstream.lock().playlist()
    }

    #[must_use]
    pub fn write_source(&self) -> Option<SourceId> {
        self.diskstream.lock().write_source()
    }

    // ----- realtime -----

    /// Processes one block while the transport rolls.
    ///
    /// Contention on the processor or diskstream lock returns
    /// [`RollPath::LockUnavailable`] with every buffer untouched. A
    /// diskstream fault silences the block and is returned as
    /// [`RollError`] after the diskstream has committed.
    pub fn roll(
        &self,
        scope: &mut ProcessScope<'_>,
        nframes: PFrames,
        start: FramePos,
        end: FramePos,
        _declick: i32,
    ) -> Result<RollOutcome, RollError> {
        let Some(processors) = self.processors.try_read() else {
            if let Some(mut diskstream) = self.diskstream.try_lock() {
                let distance = diskstream.calculate_playback_distance(nframes);
                if diskstream.can_internal_playback_seek(distance.abs()) {
                    diskstream.internal_playback_seek(distance);
                } else {
                    self.skipped_frames.fetch_add(distance, Ordering::AcqRel);
                }
            } else {
                self.skipped_frames
                    .fetch_add(FramePos::from(nframes), Ordering::AcqRel);
            }
            trace!(track = %self.name, "processor lock busy, block skipped");
            return Ok(RollOutcome::new(RollPath::LockUnavailable, false));
        };
        let Some(mut diskstream) = self.diskstream.try_lock() else {
            // the butler holds it; playback catches up on the next block
            self.skipped_frames
                .fetch_add(FramePos::from(nframes), Ordering::AcqRel);
            trace!(track = %self.name, "diskstream busy, block skipped");
            return Ok(RollOutcome::new(RollPath::LockUnavailable, false));
        };
        let skipped = self.skipped_frames.swap(0, Ordering::AcqRel);
        if skipped > 0 {
            diskstream.internal_playback_seek(skipped);
            trace!(track = %self.name, skipped, "playback caught up with the transport");
        }

        if self.n_outputs() == 0 && processors.is_empty() {
            return Ok(RollOutcome::new(RollPath::NoOutputs, false));
        }

        let record_enabled = diskstream.record_enabled();
        if !self.is_active() {
            Self::silence(scope);
            if self.meter_at_input.load(Ordering::Acquire)
                && (self.monitoring().includes_input() || record_enabled)
            {
                self.meter.reset();
            }
            return Ok(RollOutcome::new(RollPath::Inactive, false));
        }

        let transport_frame = self.session.transport_frame();
        let nframes = self.check_initial_delay(nframes);
        if nframes == 0 {
            // keeps the diskstream's distance bookkeeping at zero progress
            let mut empty = BufferSet::empty();
            let processed = diskstream.process(&mut empty, transport_frame, 0, false);
            let need_butler = diskstream.commit(processed.playback_distance);
            return match processed.result {
                Ok(()) => Ok(RollOutcome::new(RollPath::DelayedStart, need_butler)),
                Err(source) => Err(RollError {
                    source,
                    need_butler,
                }),
            };
        }

        let monitoring = self.monitoring_state_for(record_enabled);
        {
            let Some(buffer) = scope.bufs.midi_mut(0) else {
                return Ok(RollOutcome::new(RollPath::NoOutputs, false));
            };
            self.fill_with_input(buffer, scope.input, nframes);
            // capture filtering happens before the meter sees the input
            self.capture_filter.filter(buffer);
            if self.meter_at_input.load(Ordering::Acquire)
                && (self.monitoring().includes_input() || record_enabled)
            {
                self.meter.run(buffer);
            }
        }

        self.silent.store(false, Ordering::Release);

        let processed = diskstream.process(
            scope.bufs,
            transport_frame,
            nframes,
            monitoring == MonitorState::Disk,
        );
        if let Err(source) = processed.result {
            let need_butler = diskstream.commit(processed.playback_distance);
            Self::silence(scope);
            trace!(track = %self.name, status = source.status(), "diskstream fault, block silenced");
            return Err(RollError {
                source,
                need_butler,
            });
        }

        if monitoring == MonitorState::Input {
            // playback is event based: drain what disk produced for this
            // block so it does not pile up while input is heard
            diskstream.flush_playback(start, end);
        }

        self.write_out_of_band_data(scope.bufs, nframes, scope.port_offset);
        self.track_notes(scope.bufs);

        // automation only matters while recording or rolling
        let run_automation = !record_enabled && !self.session.transport_stopped();
        processors.run(scope.bufs, start, end, nframes, run_automation);
        for delivery in processors.deliveries() {
            delivery.flush_buffers(scope.bufs, scope.output, nframes);
        }

        let need_butler = diskstream.commit(processed.playback_distance);
        Ok(RollOutcome::new(RollPath::Rolled, need_butler))
    }

    /// Processes one block while the transport is stopped: monitored input
    /// and immediate events still reach the output, and note-ons arriving
    /// during step editing are queued for the editor.
    pub fn no_roll(
        &self,
        scope: &mut ProcessScope<'_>,
        nframes: PFrames,
        start: FramePos,
        end: FramePos,
        state_changing: bool,
    ) -> RollOutcome {
        let Some(processors) = self.processors.try_read() else {
            trace!(track = %self.name, "processor lock busy, stopped block skipped");
            return RollOutcome::new(RollPath::LockUnavailable, false);
        };

        if self.n_outputs() == 0 && processors.is_empty() {
            return RollOutcome::new(RollPath::NoOutputs, false);
        }

        if !self.is_active() {
            Self::silence(scope);
            return RollOutcome::new(RollPath::Inactive, false);
        }

        let pass_input =
            !state_changing && self.monitoring_state_for(self.record_enabled()) == MonitorState::Input;
        {
            let Some(buffer) = scope.bufs.midi_mut(0) else {
                return RollOutcome::new(RollPath::NoOutputs, false);
            };
            if pass_input {
                self.fill_with_input(buffer, scope.input, nframes);
                self.capture_filter.filter(buffer);
                if self.meter_at_input.load(Ordering::Acquire) {
                    self.meter.run(buffer);
                }
            } else {
                buffer.clear();
            }
        }

        self.write_out_of_band_data(scope.bufs, nframes, scope.port_offset);
        self.track_notes(scope.bufs);

        processors.run(scope.bufs, start, end, nframes, false);
        for delivery in processors.deliveries() {
            delivery.flush_buffers(scope.bufs, scope.output, nframes);
        }

        if self.step_editing() {
            self.push_input_to_step_edit_ring(scope.input);
        }

        RollOutcome::new(RollPath::Stopped, false)
    }

    pub fn realtime_locate(&self) {
        let Some(processors) = self.processors.try_read() else {
            trace!(track = %self.name, "processor lock busy, realtime locate skipped");
            return;
        };
        for processor in processors.iter() {
            processor.realtime_locate();
        }
        self.try_resolve_notes();
        if let Some(mut diskstream) = self.diskstream.try_lock() {
            diskstream.reset_tracker();
        }
    }

    pub fn realtime_handle_transport_stopped(&self) {
        let Some(processors) = self.processors.try_read() else {
            trace!(track = %self.name, "processor lock busy, transport stop skipped");
            return;
        };
        for processor in processors.iter() {
            processor.realtime_handle_transport_stopped();
        }
        self.try_resolve_notes();
    }

    fn check_initial_delay(&self, nframes: PFrames) -> PFrames {
        let delay = self.roll_delay.load(Ordering::Acquire);
        if delay <= 0 {
            return nframes;
        }
        let block = i64::from(nframes);
        if delay >= block {
            self.roll_delay.store(delay - block, Ordering::Release);
            return 0;
        }
        self.roll_delay.store(0, Ordering::Release);
        // delay < nframes here, so the difference fits
        nframes - u32::try_from(delay).unwrap_or(nframes)
    }

    fn fill_with_input(&self, buffer: &mut MidiBuffer, input: &MidiBuffer, nframes: PFrames) {
        buffer.clear();
        if !self.input_port_active.load(Ordering::Acquire) {
            return;
        }
        for event in input.iter().filter(|event| event.time < nframes) {
            if !buffer.push(event.time, event.bytes) {
                trace!(track = %self.name, "input buffer full");
                break;
            }
        }
    }

    fn silence(scope: &mut ProcessScope<'_>) {
        scope.bufs.clear();
        scope.output.clear();
    }

    fn write_out_of_band_data(&self, bufs: &mut BufferSet, nframes: PFrames, port_offset: u32) {
        let Some(buffer) = bufs.midi_mut(0) else {
            return;
        };
        self.update_controls(buffer);

        // the last frame of the block keeps timestamps monotonic across
        // split cycles; whatever does not fit goes out next block
        let time = port_offset + nframes.saturating_sub(1);
        let delivered = self.immediate_events.read_into(buffer, time, true);
        if delivered > 0 {
            trace!(track = %self.name, delivered, "immediate events delivered");
        }
    }

    fn update_controls(&self, buffer: &MidiBuffer) {
        let Some(mut controls) = self.controls.try_lock() else {
            trace!(track = %self.name, "control lock busy, controls not updated");
            return;
        };
        for event in buffer.iter() {
            if let Some((parameter, value)) = midi_parameter(event.bytes) {
                if let Some(control) = controls.get_mut(&parameter) {
                    control.record_value(value);
                }
            }
        }
    }

    fn track_notes(&self, bufs: &BufferSet) {
        let Some(buffer) = bufs.midi(0) else {
            return;
        };
        if let Some(mut tracker) = self.note_tracker.try_lock() {
            tracker.track_buffer(buffer);
        }
    }

    fn push_input_to_step_edit_ring(&self, input: &MidiBuffer) {
        if !self.input_port_active.load(Ordering::Acquire) {
            return;
        }
        for event in input.iter() {
            // only note-ons: the editor decides the length
            if matches!(ChannelMessage::parse(event.bytes), ChannelMessage::NoteOn { .. }) {
                self.step_edit_ring
                    .write_realtime(0, midi_event_type(event.bytes[0]), event.bytes);
            }
        }
    }

    fn try_resolve_notes(&self) {
        if let Some(mut tracker) = self.note_tracker.try_lock() {
            let resolved = tracker.resolve_all(&mut self.immediate_events.realtime(), 0);
            if resolved > 0 {
                trace!(track = %self.name, resolved, "sounding notes resolved");
            }
        }
    }

    fn resolve_into_immediate(
        &self,
        tracker: &mut NoteTracker,
        channels: impl Fn(u8) -> bool,
    ) -> usize {
        let mut sink = &self.immediate_events;
        tracker.resolve_where(&mut sink, 0, channels)
    }

    // ----- locate, mute, monitoring -----

    /// Relocates the diskstream and re-evaluates every control from the
    /// automation of the topmost unmuted region at `pos`. The control
    /// update is skipped when the control lock is busy; the next locate
    /// refreshes it.
    #[instrument(skip(self), fields(track = %self.name))]
    pub fn non_realtime_locate(&self, pos: FramePos) {
        let playlist = {
            let mut diskstream = self.diskstream.lock();
            diskstream.seek(pos);
            self.skipped_frames.store(0, Ordering::Release);
            diskstream.playlist()
        };
        let Some(playlist) = playlist else {
            return;
        };
        let Some(region) = playlist.top_unmuted_region_at(pos) else {
            return;
        };
        // a region can outlive its source while editors still show it
        if region.source.is_none() || region.model.is_none() {
            debug!(region = %region.name, "region has no model, controls left alone");
            return;
        }

        let Some(mut controls) = self.controls.try_lock() else {
            debug!("control lock busy, locate update skipped");
            return;
        };

        let tempo_map = self.session.tempo_map();
        let origin = region.origin();
        let converter = BeatsFramesConverter::new(&tempo_map, origin);
        let pos_beats = converter.from(pos - origin);

        let mut updated = 0;
        for control in controls.values_mut() {
            let Some(value) = region
                .control(control.parameter())
                .and_then(|list| list.eval(pos_beats))
            else {
                continue;
            };
            if control.set_value(value, &self.immediate_events).is_ok() {
                updated += 1;
            }
        }
        debug!(region = %region.name, pos_beats, updated, "controls refreshed from region automation");
    }

    #[must_use]
    pub fn muted(&self) -> bool {
        self.mute_master.self_muted()
    }

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_mute(&self, muted: bool) {
        if self.mute_master.set_self_muted(muted) {
            info!(muted, "mute changed");
            self.act_on_mute();
        }
    }

    /// Mute coming from elsewhere in the mixer (solo of another route).
    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_muted_by_others(&self, muted: bool) {
        if self.mute_master.set_muted_by_others(muted) {
            debug!(muted, "implicit mute changed");
            self.act_on_mute();
        }
    }

    /// Called after the mute status changed. When muted, queues sustain-off
    /// and note-offs for the channels the playback filter admits. No
    /// all-notes-off is sent: another unmuted track may share the output.
    /// Returns the number of messages queued.
    #[instrument(skip(self), fields(track = %self.name))]
    pub fn act_on_mute(&self) -> usize {
        if !self.mute_master.muted_at_delivery() {
            return 0;
        }

        let mut queued = 0;
        for channel in 0..MIDI_CHANNELS {
            if !self.playback_filter.admit(channel) {
                continue;
            }
            if self
                .write_immediate_event(&[MIDI_CMD_CONTROL | channel, MIDI_CTL_SUSTAIN, 0])
                .is_ok()
            {
                queued += 1;
            }
        }

        let filter = Arc::clone(&self.playback_filter);
        let resolved = {
            let mut tracker = self.note_tracker.lock();
            self.resolve_into_immediate(&mut tracker, |channel| filter.admit(channel))
        };
        debug!(sustain_offs = queued, resolved, "mute messages queued");
        queued + resolved
    }

    #[must_use]
    pub fn monitoring(&self) -> MonitorChoice {
        MonitorChoice::from_bits(self.monitoring.load(Ordering::Acquire))
    }

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_monitoring(&self, choice: MonitorChoice) {
        if self.monitoring.swap(choice.to_bits(), Ordering::AcqRel) == choice.to_bits() {
            return;
        }
        // what was sounding came from the old source
        let resolved = {
            let mut tracker = self.note_tracker.lock();
            self.resolve_into_immediate(&mut tracker, |_| true)
        };
        self.diskstream.lock().reset_tracker();
        info!(?choice, resolved, "monitoring changed");
    }

    /// Never [`MonitorState::Silence`]: a MIDI track with nothing else to
    /// monitor listens to its input.
    #[must_use]
    pub fn monitoring_state(&self) -> MonitorState {
        self.monitoring_state_for(self.record_enabled())
    }

    fn monitoring_state_for(&self, record_enabled: bool) -> MonitorState {
        let state = match self.monitoring() {
            MonitorChoice::Input | MonitorChoice::Cue => MonitorState::Input,
            MonitorChoice::Disk => MonitorState::Disk,
            MonitorChoice::Auto => {
                let stopped = self.session.transport_stopped();
                if record_enabled {
                    if stopped || self.session.record_status() == RecordStatus::Recording {
                        MonitorState::Input
                    } else {
                        MonitorState::Disk
                    }
                } else if stopped {
                    MonitorState::Silence
                } else {
                    MonitorState::Disk
                }
            }
        };
        if state == MonitorState::Silence {
            MonitorState::Input
        } else {
            state
        }
    }

    // ----- configuration -----

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_note_mode(&self, mode: NoteMode) {
        *self.note_mode.lock() = mode;
        self.diskstream.lock().set_note_mode(mode);
        info!(?mode, "note mode set");
    }

    /// Ignored unless recording is fully disabled.
    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_step_editing(&self, enabled: bool) {
        if self.session.record_status() != RecordStatus::Disabled {
            debug!("record armed, step editing unchanged");
            return;
        }
        if self.step_editing.swap(enabled, Ordering::AcqRel) != enabled {
            info!(enabled, "step editing changed");
            self.signals.step_edit_status_change.emit(&enabled);
        }
    }

    /// Ignored while step editing. Returns whether the request was applied.
    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_record_enabled(&self, enabled: bool) -> bool {
        if self.step_editing() {
            debug!("step editing, record enable ignored");
            return false;
        }
        self.diskstream.lock().set_record_enabled(enabled);
        self.record_enabled.store(enabled, Ordering::Release);
        info!(enabled, "record enable changed");
        true
    }

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_input_active(&self, active: bool) {
        if self.input_active.swap(active, Ordering::AcqRel) != active {
            self.map_input_active(active);
            info!(active, "input active changed");
            self.signals.input_active_changed.emit(&active);
        }
    }

    /// The input ports were rebuilt; new ports start active, so the
    /// track's setting is applied again.
    pub fn input_configuration_changed(&self) {
        self.input_port_active.store(true, Ordering::Release);
        self.map_input_active(self.input_active());
    }

    fn map_input_active(&self, active: bool) {
        self.input_port_active.store(active, Ordering::Release);
    }

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_playback_channel_mode(&self, mode: ChannelMode, mask: u16) {
        if self.playback_filter.set_channel_mode(mode, mask) {
            debug!(?mode, mask = %HexMask(self.playback_filter.mask()), "playback channel mode changed");
            self.session.set_dirty();
        }
    }

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_capture_channel_mode(&self, mode: ChannelMode, mask: u16) {
        if self.capture_filter.set_channel_mode(mode, mask) {
            debug!(?mode, mask = %HexMask(self.capture_filter.mask()), "capture channel mode changed");
            self.session.set_dirty();
        }
    }

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_playback_channel_mask(&self, mask: u16) {
        if self.playback_filter.set_channel_mask(mask) {
            debug!(mask = %HexMask(mask), "playback channel mask changed");
            self.session.set_dirty();
        }
    }

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn set_capture_channel_mask(&self, mask: u16) {
        if self.capture_filter.set_channel_mask(mask) {
            debug!(mask = %HexMask(mask), "capture channel mask changed");
            self.session.set_dirty();
        }
    }

    /// Swaps in a new diskstream and returns the old one. The new stream
    /// gets the track's note mode and playback filter, starts with record
    /// disabled, and reports recorded data through this track.
    #[instrument(skip(self, diskstream), fields(track = %self.name, diskstream = %diskstream.name()))]
    pub fn replace_diskstream(&self, mut diskstream: Box<dyn Diskstream>) -> Box<dyn Diskstream> {
        self.attach_diskstream(diskstream.as_mut());
        let mut old = {
            let mut current = self.diskstream.lock();
            self.skipped_frames.store(0, Ordering::Release);
            std::mem::replace(&mut *current, diskstream)
        };
        old.set_data_recorded_handler(None);
        self.record_enabled.store(false, Ordering::Release);

        let resolved = {
            let mut tracker = self.note_tracker.lock();
            self.resolve_into_immediate(&mut tracker, |_| true)
        };
        info!(previous = %old.name(), resolved, "diskstream replaced");
        self.signals.diskstream_changed.emit(&());
        old
    }

    fn attach_diskstream(&self, diskstream: &mut dyn Diskstream) {
        // before anything fills buffers with the wrong note mode
        diskstream.set_note_mode(self.note_mode());
        diskstream.set_playback_filter(Arc::clone(&self.playback_filter));
        diskstream.set_block_size(self.session.block_size());
        diskstream.reset_tracker();
        diskstream.set_record_enabled(false);

        let weak = self.weak_self.clone();
        let handler: DataRecordedHandler = Arc::new(move |source| {
            if let Some(track) = weak.upgrade() {
                track.signals.data_recorded.emit(&source);
            }
        });
        diskstream.set_data_recorded_handler(Some(handler));
    }

    // ----- immediate events -----

    /// Queues one MIDI message for delivery at the end of the next block.
    pub fn write_immediate_event(&self, bytes: &[u8]) -> Result<(), ImmediateEventError> {
        if bytes.len() > MAX_EVENT_SIZE {
            warn!(track = %self.name, size = bytes.len(), "immediate MIDI event too large");
            return Err(ImmediateEventError::TooLarge {
                size: bytes.len(),
                max: MAX_EVENT_SIZE,
            });
        }
        if !midi_event_is_valid(bytes) {
            warn!(track = %self.name, ?bytes, "ignoring illegal immediate MIDI event");
            return Err(ImmediateEventError::Invalid);
        }
        let event_type = midi_event_type(bytes[0]);
        if self.immediate_events.write(0, event_type, bytes) == bytes.len() {
            Ok(())
        } else {
            Err(ImmediateEventError::Overflow)
        }
    }

    /// Sustain off, all notes off and reset controllers on every channel.
    /// Returns the number of messages queued.
    pub fn midi_panic(&self) -> usize {
        debug!(track = %self.name, "delivering panic");
        let mut queued = 0;
        for channel in 0..MIDI_CHANNELS {
            let status = MIDI_CMD_CONTROL | channel;
            for controller in [MIDI_CTL_SUSTAIN, MIDI_CTL_ALL_NOTES_OFF, MIDI_CTL_RESET_CONTROLLERS] {
                if self.write_immediate_event(&[status, controller, 0]).is_ok() {
                    queued += 1;
                }
            }
        }
        queued
    }

    /// Note-ons captured while step editing, oldest first.
    #[must_use]
    pub fn read_step_edit_events(&self) -> Vec<(u32, Vec<u8>)> {
        self.step_edit_ring.drain()
    }

    // ----- controls -----

    /// Sets a control, creating it on first use. Outside automation
    /// playback the value is also sent as an immediate MIDI message.
    pub fn set_control_value(&self, parameter: Parameter, value: f64) -> Result<(), ControlError> {
        if parameter.channel >= MIDI_CHANNELS || parameter.id > 127 {
            return Err(ControlError::UnknownParameter(parameter));
        }
        self.controls
            .lock()
            .entry(parameter)
            .or_insert_with(|| MidiControl::new(parameter))
            .set_value(value, &self.immediate_events)
    }

    #[must_use]
    pub fn control_value(&self, parameter: Parameter) -> Option<f64> {
        self.controls.lock().get(&parameter).map(MidiControl::value)
    }

    #[must_use]
    pub fn control(&self, parameter: Parameter) -> Option<MidiControl> {
        self.controls.lock().get(&parameter).cloned()
    }

    /// Creates the control if needed and returns its current value.
    pub fn add_control(&self, parameter: Parameter) -> Result<f64, ControlError> {
        if parameter.channel >= MIDI_CHANNELS || parameter.id > 127 {
            return Err(ControlError::UnknownParameter(parameter));
        }
        Ok(self
            .controls
            .lock()
            .entry(parameter)
            .or_insert_with(|| MidiControl::new(parameter))
            .value())
    }

    /// Binds an automation list to a control.
    pub fn bind_automation(
        &self,
        parameter: Parameter,
        list: AutomationList,
        state: AutoState,
    ) -> Result<(), ControlError> {
        if parameter.channel >= MIDI_CHANNELS || parameter.id > 127 {
            return Err(ControlError::UnknownParameter(parameter));
        }
        let mut controls = self.controls.lock();
        let control = controls
            .entry(parameter)
            .or_insert_with(|| MidiControl::new(parameter));
        control.set_list(Some(list));
        control.set_automation_state(state);
        Ok(())
    }

    #[must_use]
    pub fn describe_parameter(&self, parameter: Parameter) -> String {
        describe_parameter(parameter)
    }

    // ----- freeze -----

    /// Records the current playlist and processor states as frozen.
    /// Returns false when there is no playlist to freeze.
    #[instrument(skip(self), fields(track = %self.name))]
    pub fn freeze_me(&self) -> bool {
        let Some(playlist) = self.playlist() else {
            warn!("track has no playlist, nothing to freeze");
            return false;
        };
        let processor_info = self
            .processors
            .read()
            .iter()
            .map(|processor| FreezeProcessorState {
                id: Some(processor.id().to_string()),
                state: processor.state(),
            })
            .collect::<Vec<_>>();
        info!(playlist = %playlist.name, processors = processor_info.len(), "track frozen");
        *self.freeze_record.lock() = FreezeRecord {
            playlist: Some(playlist),
            state: FreezeState::Frozen,
            processor_info,
        };
        self.signals.freeze_change.emit(&());
        true
    }

    #[instrument(skip(self), fields(track = %self.name))]
    pub fn unfreeze(&self) {
        {
            let mut record = self.freeze_record.lock();
            record.state = FreezeState::UnFrozen;
            record.processor_info.clear();
        }
        info!("track unfrozen");
        self.signals.freeze_change.emit(&());
    }

    #[must_use]
    pub fn freeze_state(&self) -> FreezeState {
        self.freeze_record.lock().state
    }

    #[must_use]
    pub fn freeze_record(&self) -> FreezeRecord {
        self.freeze_record.lock().clone()
    }

    // ----- state -----

    #[must_use]
    pub fn state(&self) -> MidiTrackState {
        let (playback_mode, playback_mask) = self.playback_filter.load();
        let (capture_mode, capture_mask) = self.capture_filter.load();
        MidiTrackState {
            name: self.name.clone(),
            note_mode: Some(self.note_mode()),
            step_editing: Some(YesNo(self.step_editing())),
            input_active: Some(YesNo(self.input_active())),
            playback_channel_mode: Some(playback_mode),
            capture_channel_mode: Some(capture_mode),
            playback_channel_mask: Some(HexMask(playback_mask)),
            capture_channel_mask: Some(HexMask(capture_mask)),
            channel_mode: None,
            channel_mask: None,
            freeze_info: self.freeze_record.lock().to_info(),
        }
    }

    /// Restores a saved state. The freeze part needs every playlist to
    /// exist, so while the session is loading it waits for state-ready.
    #[instrument(skip(self, state), fields(track = %self.name))]
    pub fn set_state(&self, state: &MidiTrackState) {
        // first, so any buffer fill below uses the right note mode
        self.set_note_mode(state.note_mode.unwrap_or_default());

        if let Some(YesNo(active)) = state.input_active {
            self.set_input_active(active);
        }

        let channels = state.channel_settings();
        self.set_playback_channel_mode(channels.playback_mode, channels.playback_mask);
        self.set_capture_channel_mode(channels.capture_mode, channels.capture_mask);

        *self.pending_state.lock() = Some(state.clone());

        if self.session.is_loading() {
            let weak = self.weak_self.clone();
            let connection = self.session.state_ready().connect(move |()| {
                if let Some(track) = weak.upgrade() {
                    track.set_state_part_two();
                }
            });
            if let Some(previous) = self.state_ready_connection.lock().replace(connection) {
                self.session.state_ready().disconnect(previous);
            }
            debug!("freeze state deferred until the session is ready");
        } else {
            self.set_state_part_two();
        }
        info!("state applied");
    }

    /// Second half of [`set_state`](Self::set_state), run once every
    /// playlist of the session exists.
    pub fn set_state_part_two(&self) {
        if let Some(connection) = self.state_ready_connection.lock().take() {
            self.session.state_ready().disconnect(connection);
        }
        let Some(pending) = self.pending_state.lock().take() else {
            return;
        };

        if let Some(info) = &pending.freeze_info {
            let mut record = self.freeze_record.lock();
            record.state = FreezeState::Frozen;
            record.processor_info.clear();

            if let Some(name) = &info.playlist {
                if let Some(playlist) = self.session.playlists().by_name(name) {
                    record.playlist = Some(playlist);
                } else {
                    warn!(track = %self.name, playlist = %name, "frozen playlist not found, freeze dropped");
                    record.playlist = None;
                    record.state = FreezeState::NoFreeze;
                    return;
                }
            }
            if let Some(state) = info.state {
                record.state = state;
            }
            record.processor_info = info
                .processors
                .iter()
                .filter(|processor| processor.id.is_some())
                .cloned()
                .collect();
        }

        self.diskstream
            .lock()
            .set_block_size(self.session.block_size());
    }

    // ----- butler -----

    /// Refills the diskstream's playback buffer. Blocks on the diskstream
    /// lock, so only call it from the butler thread.
    pub fn do_refill(&self) -> Result<bool, DiskstreamError> {
        self.diskstream.lock().do_refill()
    }

    /// Moves captured data to the write source.
    pub fn do_flush(&self) -> Result<usize, DiskstreamError> {
        self.diskstream.lock().do_flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DiskstreamConfig, diskstream::PlaylistDiskstream, session::EngineSession,
        time::TempoMap,
    };

    fn track() -> (Arc<EngineSession>, Arc<MidiTrack>) {
        let session = Arc::new(EngineSession::default());
        let diskstream = PlaylistDiskstream::new(
            "ds",
            None,
            Arc::new(TempoMap::default()),
            DiskstreamConfig::default(),
        );
        let track = MidiTrack::new(
            "keys",
            Arc::clone(&session) as Arc<dyn Session>,
            Box::new(diskstream),
            &TrackConfig::default(),
        );
        (session, track)
    }

    #[test]
    fn initial_delay_swallows_whole_blocks_first() {
        let (_, track) = track();
        track.set_roll_delay(700);
        assert_eq!(track.check_initial_delay(512), 0);
        assert_eq!(track.roll_delay(), 188);
        assert_eq!(track.check_initial_delay(512), 324);
        assert_eq!(track.roll_delay(), 0);
        assert_eq!(track.check_initial_delay(512), 512);
    }

    #[test]
    fn monitoring_never_reports_silence() {
        let (session, track) = track();
        session.set_transport_stopped(true);
        assert_eq!(track.monitoring_state(), MonitorState::Input);
        session.set_transport_stopped(false);
        assert_eq!(track.monitoring_state(), MonitorState::Disk);
        track.set_monitoring(MonitorChoice::Cue);
        assert_eq!(track.monitoring_state(), MonitorState::Input);
    }

    #[test]
    fn out_of_range_parameters_are_unknown() {
        let (_, track) = track();
        let parameter = Parameter::cc(16, 7);
        assert_eq!(
            track.set_control_value(parameter, 10.0),
            Err(ControlError::UnknownParameter(parameter))
        );
    }
}

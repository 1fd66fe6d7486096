//! The engine-side collaborator a track talks to: transport position,
//! record status, tempo, and the playlist registry.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, Ordering},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::SessionConfig,
    playlist::SessionPlaylists,
    signal::Signal,
    time::{FramePos, PFrames, TempoMap},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    #[default]
    Disabled,
    Enabled,
    Recording,
}

impl RecordStatus {
    fn to_bits(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Enabled => 1,
            Self::Recording => 2,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Enabled,
            2 => Self::Recording,
            _ => Self::Disabled,
        }
    }
}

pub trait Session: Send + Sync {
    fn transport_frame(&self) -> FramePos;
    fn transport_stopped(&self) -> bool;
    fn record_status(&self) -> RecordStatus;
    fn block_size(&self) -> PFrames;
    fn tempo_map(&self) -> Arc<TempoMap>;
    /// Marks the session as having unsaved changes.
    fn set_dirty(&self);
    /// True while a saved session is being restored.
    fn is_loading(&self) -> bool;
    fn playlists(&self) -> &SessionPlaylists;
    /// Emitted once restore has finished and every object has its state.
    fn state_ready(&self) -> &Signal<()>;
}

/// Atomic-backed session used by the CLI and tests. Every setter may be
/// called from any thread while the process thread reads.
#[derive(Debug)]
pub struct EngineSession {
    transport_frame: AtomicI64,
    transport_stopped: AtomicBool,
    record_status: AtomicU8,
    block_size: AtomicU32,
    tempo_map: RwLock<Arc<TempoMap>>,
    dirty: AtomicBool,
    loading: AtomicBool,
    playlists: SessionPlaylists,
    state_ready: Signal<()>,
}

impl Default for EngineSession {
    fn default() -> Self {
        Self::new(&SessionConfig::default())
    }
}

impl EngineSession {
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            transport_frame: AtomicI64::new(0),
            transport_stopped: AtomicBool::new(true),
            record_status: AtomicU8::new(RecordStatus::Disabled.to_bits()),
            block_size: AtomicU32::new(config.block_size.max(1)),
            tempo_map: RwLock::new(Arc::new(TempoMap::constant(
                config.bpm,
                config.sample_rate,
            ))),
            dirty: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            playlists: SessionPlaylists::new(),
            state_ready: Signal::new(),
        }
    }

    pub fn set_transport_frame(&self, frame: FramePos) {
        self.transport_frame.store(frame, Ordering::Release);
    }

    /// Moves the transport forward by one block.
    pub fn advance(&self, nframes: PFrames) {
        self.transport_frame
            .fetch_add(i64::from(nframes), Ordering::AcqRel);
    }

    pub fn set_transport_stopped(&self, stopped: bool) {
        self.transport_stopped.store(stopped, Ordering::Release);
    }

    pub fn set_record_status(&self, status: RecordStatus) {
        self.record_status.store(status.to_bits(), Ordering::Release);
    }

    pub fn set_block_size(&self, nframes: PFrames) {
        self.block_size.store(nframes.max(1), Ordering::Release);
    }

    pub fn set_tempo_map(&self, map: TempoMap) {
        *self.tempo_map.write() = Arc::new(map);
        self.set_dirty();
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn begin_loading(&self) {
        self.loading.store(true, Ordering::Release);
        debug!("session restore started");
    }

    /// Leaves the loading state and emits state-ready.
    pub fn finish_loading(&self) {
        self.loading.store(false, Ordering::Release);
        info!(subscribers = self.state_ready.subscriber_count(), "session state ready");
        self.state_ready.emit(&());
    }
}

impl Session for EngineSession {
    fn transport_frame(&self) -> FramePos {
        self.transport_frame.load(Ordering::Acquire)
    }

    fn transport_stopped(&self) -> bool {
        self.transport_stopped.load(Ordering::Acquire)
    }

    fn record_status(&self) -> RecordStatus {
        RecordStatus::from_bits(self.record_status.load(Ordering::Acquire))
    }

    fn block_size(&self) -> PFrames {
        self.block_size.load(Ordering::Acquire)
    }

    fn tempo_map(&self) -> Arc<TempoMap> {
        Arc::clone(&self.tempo_map.read())
    }

    fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    fn playlists(&self) -> &SessionPlaylists {
        &self.playlists
    }

    fn state_ready(&self) -> &Signal<()> {
        &self.state_ready
    }
}

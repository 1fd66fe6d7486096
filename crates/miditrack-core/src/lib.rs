pub mod automation;
pub mod channel_filter;
pub mod config;
pub mod diagnostics;
pub mod diskstream;
pub mod fixtures;
pub mod immediate;
pub mod meter;
pub mod midi;
pub mod note_tracker;
pub mod persistence;
pub mod playlist;
pub mod processor;
pub mod session;
pub mod signal;
pub mod state;
pub mod time;
pub mod track;

pub use automation::{
    AutoState, AutomationList, ControlError, MidiControl, Parameter, ParameterDescriptor,
    ParameterKind, describe_parameter,
};
pub use channel_filter::{ALL_CHANNELS_MASK, ChannelFilter, ChannelMode};
pub use config::{
    DiagnosticsConfig, DiskstreamConfig, EngineConfig, SessionConfig, TrackConfig,
};
pub use diagnostics::{TelemetryGuard, init_tracing, init_tracing_with_options};
pub use diskstream::{Diskstream, DiskstreamError, PlaylistDiskstream, Processed};
pub use immediate::ImmediateEventQueue;
pub use meter::{InputMeter, MeterPoint};
pub use midi::{BufferSet, MidiBuffer};
pub use note_tracker::NoteTracker;
pub use persistence::{load_track_state, save_track_state, snapshot_track};
pub use playlist::{MidiPlaylist, MidiRegion, SessionPlaylists};
pub use processor::{MidiDelivery, MuteMaster, Processor, ProcessorChain, ProcessorKind};
pub use session::{EngineSession, RecordStatus, Session};
pub use signal::{Connection, Signal};
pub use state::{FreezeInfo, FreezeState, HexMask, MidiTrackState, StateError, YesNo};
pub use time::{FrameCount, FramePos, PFrames, TempoMap};
pub use track::{
    ImmediateEventError, MidiTrack, MonitorChoice, MonitorState, NoteMode, ProcessScope,
    RollError, RollOutcome, RollPath, TrackSignals,
};

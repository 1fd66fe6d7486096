use std::{
    fs,
    io::BufWriter,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use midly::{
    Format, Header, MetaMessage, Smf, Timing, TrackEvent, TrackEventKind,
    live::LiveEvent,
    num::{u15, u24, u28},
};
use miditrack_core::{
    BufferSet, EngineConfig, FramePos, MidiBuffer, NoteMode, ProcessScope, Session, TempoMap,
    diagnostics::init_tracing,
    fixtures::{demo_rig, demo_track_state},
    persistence::{load_track_state, save_track_state},
};
use serde::Serialize;
use tracing::{info, warn};

const SMF_TICKS_PER_QUARTER: u16 = 480;

#[derive(Debug, Parser)]
#[command(name = "miditrack-cli")]
#[command(about = "Headless driver for the MIDI track engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Overrides the log directory from the config file.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Config file; defaults to discovery via MIDITRACK_CONFIG_PATH or the
    /// working directory.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rolls the demo track and writes what its output port delivered.
    Demo {
        #[arg(long, default_value_t = 400)]
        blocks: u32,

        #[arg(long, default_value = "data/demo-events.json")]
        output: PathBuf,

        /// Also write the delivered events as a standard MIDI file.
        #[arg(long)]
        smf: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "sustained")]
        note_mode: NoteModeArg,

        /// Mutes the track before this block is processed.
        #[arg(long)]
        mute_at_block: Option<u32>,
    },
    /// Writes the demo track's saved state, optionally after applying an
    /// existing state file to it.
    State {
        #[arg(long, default_value = "data/demo-track.json")]
        output: PathBuf,

        #[arg(long)]
        from: Option<PathBuf>,

        /// Freeze the track before saving.
        #[arg(long)]
        freeze: bool,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum NoteModeArg {
    Sustained,
    Percussive,
}

impl From<NoteModeArg> for NoteMode {
    fn from(value: NoteModeArg) -> Self {
        match value {
            NoteModeArg::Sustained => Self::Sustained,
            NoteModeArg::Percussive => Self::Percussive,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeliveredEvent {
    frame: FramePos,
    bytes: Vec<u8>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(log_dir) = cli.log_dir {
        config.diagnostics.log_dir = log_dir;
    }
    let _telemetry = init_tracing(&config.diagnostics)?;

    match cli.command {
        Commands::Demo {
            blocks,
            output,
            smf,
            note_mode,
            mute_at_block,
        } => {
            let events = run_demo(&config, blocks, note_mode.into(), mute_at_block)?;
            write_json(&output, &events)?;
            if let Some(path) = smf {
                let tempo_map = TempoMap::constant(config.session.bpm, config.session.sample_rate);
                write_smf(&path, &tempo_map, &events)?;
            }
            info!(events = events.len(), path = %output.display(), "demo events written");
        }
        Commands::State {
            output,
            from,
            freeze,
        } => {
            let rig = demo_rig(&config);
            let state = match from {
                Some(path) => load_track_state(&path)?,
                None => demo_track_state(),
            };
            rig.track.set_state(&state);
            if freeze && !rig.track.freeze_me() {
                warn!("demo track could not be frozen");
            }
            save_track_state(&output, &rig.track.state())?;
        }
    }

    Ok(())
}

fn run_demo(
    config: &EngineConfig,
    blocks: u32,
    note_mode: NoteMode,
    mute_at_block: Option<u32>,
) -> anyhow::Result<Vec<DeliveredEvent>> {
    let rig = demo_rig(config);
    rig.track.set_note_mode(note_mode);
    rig.track
        .do_refill()
        .context("initial diskstream refill failed")?;
    rig.session.set_transport_stopped(false);

    let nframes = rig.session.block_size();
    let capacity = config.track.midi_buffer_capacity;
    let input = MidiBuffer::with_capacity(capacity);
    let mut bufs = BufferSet::with_midi(1, capacity);
    let mut port = MidiBuffer::with_capacity(capacity);
    let mut delivered = Vec::new();

    for block in 0..blocks {
        if mute_at_block == Some(block) {
            rig.track.set_mute(true);
        }

        let start = rig.session.transport_frame();
        let end = start + i64::from(nframes);
        port.clear();
        let mut scope = ProcessScope {
            input: &input,
            bufs: &mut bufs,
            output: &mut port,
            port_offset: 0,
        };
        let need_butler = match rig.track.roll(&mut scope, nframes, start, end, 0) {
            Ok(outcome) => outcome.need_butler,
            Err(error) => {
                warn!(block, %error, status = error.status(), "block failed");
                error.need_butler
            }
        };

        delivered.extend(port.iter().map(|event| DeliveredEvent {
            frame: start + i64::from(event.time),
            bytes: event.bytes.to_vec(),
        }));

        if need_butler {
            rig.track.do_refill().context("diskstream refill failed")?;
        }
        rig.session.advance(nframes);
    }

    info!(
        blocks,
        delivered = delivered.len(),
        sounding = rig.track.active_notes(),
        "demo rolled"
    );
    Ok(delivered)
}

fn write_json(path: &Path, events: &[DeliveredEvent]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(events).context("failed to serialize demo events")?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn write_smf(path: &Path, tempo_map: &TempoMap, events: &[DeliveredEvent]) -> anyhow::Result<()> {
    let micros_per_quarter = (60_000_000.0 / tempo_map.bpm_at(0)).round() as u32;
    let mut track = vec![TrackEvent {
        delta: u28::from(0_u32),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(micros_per_quarter))),
    }];

    let mut last_tick = 0_u32;
    for event in events {
        let Ok(LiveEvent::Midi { channel, message }) = LiveEvent::parse(&event.bytes) else {
            continue;
        };
        let beats = tempo_map.frame_to_beats(event.frame);
        let tick = (beats * f64::from(SMF_TICKS_PER_QUARTER)).round().max(0.0) as u32;
        track.push(TrackEvent {
            delta: u28::from(tick.saturating_sub(last_tick)),
            kind: TrackEventKind::Midi { channel, message },
        });
        last_tick = last_tick.max(tick);
    }
    track.push(TrackEvent {
        delta: u28::from(0_u32),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header {
            format: Format::SingleTrack,
            timing: Timing::Metrical(u15::from(SMF_TICKS_PER_QUARTER)),
        },
        tracks: vec![track],
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    let file = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    smf.write_std(BufWriter::new(file))
        .with_context(|| format!("failed to write MIDI file {}", path.display()))?;
    info!(path = %path.display(), "standard MIDI file written");
    Ok(())
}

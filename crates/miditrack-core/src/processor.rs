//! The route's output processing chain.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use serde_json::{Value, json};
use tracing::trace;
use uuid::Uuid;

use crate::{
    midi::{BufferSet, ChannelMessage, MidiBuffer},
    time::{FramePos, PFrames},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    /// Moves the route's buffers to an output port.
    Delivery,
    Other,
}

/// One stage of the chain. Stages are shared between the chain and freeze
/// records, and are run from the process thread through `&self`, so any
/// mutable state lives behind atomics or locks the stage owns.
pub trait Processor: Send + Sync {
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Other
    }

    fn run(
        &self,
        bufs: &mut BufferSet,
        start: FramePos,
        end: FramePos,
        nframes: PFrames,
        run_automation: bool,
    );

    /// Only called on deliveries: writes the processed buffers to `output`.
    fn flush_buffers(&self, _bufs: &BufferSet, _output: &mut MidiBuffer, _nframes: PFrames) {}

    fn realtime_locate(&self) {}

    fn realtime_handle_transport_stopped(&self) {}

    /// Opaque snapshot kept by freeze records.
    fn state(&self) -> Value {
        json!({ "id": self.id(), "name": self.name() })
    }
}

/// Ordered processors of one route.
#[derive(Clone, Default)]
pub struct ProcessorChain {
    processors: Vec<Arc<dyn Processor>>,
}

impl std::fmt::Debug for ProcessorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.processors.iter().map(|processor| processor.name()))
            .finish()
    }
}

impl ProcessorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn push(&mut self, processor: Arc<dyn Processor>) {
        self.processors.push(processor);
    }

    /// Inserts before the first delivery, so new stages run ahead of the
    /// output.
    pub fn insert_before_deliveries(&mut self, processor: Arc<dyn Processor>) {
        let index = self
            .processors
            .iter()
            .position(|existing| existing.kind() == ProcessorKind::Delivery)
            .unwrap_or(self.processors.len());
        self.processors.insert(index, processor);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Processor>> + '_ {
        self.processors.iter()
    }

    pub fn deliveries(&self) -> impl Iterator<Item = &Arc<dyn Processor>> + '_ {
        self.processors
            .iter()
            .filter(|processor| processor.kind() == ProcessorKind::Delivery)
    }

    pub fn run(
        &self,
        bufs: &mut BufferSet,
        start: FramePos,
        end: FramePos,
        nframes: PFrames,
        run_automation: bool,
    ) {
        for processor in &self.processors {
            processor.run(bufs, start, end, nframes, run_automation);
        }
    }
}

/// Mute state shared by a route and its deliveries.
#[derive(Debug, Default)]
pub struct MuteMaster {
    self_muted: AtomicBool,
    muted_by_others: AtomicBool,
}

impl MuteMaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the value changed.
    pub fn set_self_muted(&self, muted: bool) -> bool {
        self.self_muted.swap(muted, Ordering::AcqRel) != muted
    }

    pub fn set_muted_by_others(&self, muted: bool) -> bool {
        self.muted_by_others.swap(muted, Ordering::AcqRel) != muted
    }

    #[must_use]
    pub fn self_muted(&self) -> bool {
        self.self_muted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn muted_by_others(&self) -> bool {
        self.muted_by_others.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn muted_at_delivery(&self) -> bool {
        self.self_muted() || self.muted_by_others()
    }
}

/// Main MIDI output of a track. While muted only note-ons are held back,
/// so the note-offs and controller resets sent on mute still get out.
#[derive(Debug)]
pub struct MidiDelivery {
    id: Uuid,
    name: String,
    mute_master: Arc<MuteMaster>,
    delivered: AtomicUsize,
}

impl MidiDelivery {
    #[must_use]
    pub fn new(name: impl Into<String>, mute_master: Arc<MuteMaster>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            mute_master,
            delivered: AtomicUsize::new(0),
        }
    }

    /// Events written to output ports since creation.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Processor for MidiDelivery {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Delivery
    }

    fn run(&self, _: &mut BufferSet, _: FramePos, _: FramePos, _: PFrames, _: bool) {}

    fn flush_buffers(&self, bufs: &BufferSet, output: &mut MidiBuffer, nframes: PFrames) {
        let Some(source) = bufs.midi(0) else {
            return;
        };
        let muted = self.mute_master.muted_at_delivery();
        let mut written = 0;
        for event in source.iter() {
            if muted && matches!(ChannelMessage::parse(event.bytes), ChannelMessage::NoteOn { .. }) {
                continue;
            }
            if output.insert(event.time, event.bytes) {
                written += 1;
            } else {
                trace!(delivery = %self.name, nframes, "output port full");
                break;
            }
        }
        self.delivered.fetch_add(written, Ordering::Relaxed);
    }

    fn state(&self) -> Value {
        json!({ "id": self.id, "name": self.name, "type": "midi-delivery" })
    }
}

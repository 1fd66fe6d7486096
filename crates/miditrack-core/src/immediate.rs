//! Out-of-band MIDI delivery into the realtime stream.
//!
//! Events are framed into a byte ring as a 12 byte header (time, type, size,
//! all little-endian `u32`) followed by the payload. The producer end is
//! serialised behind a mutex so any thread may write; only the process
//! thread reads, and it never waits for the consumer lock.

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{trace, warn};

use crate::midi::{EventSink, MidiBuffer, midi_event_type};

pub const DEFAULT_IMMEDIATE_CAPACITY: usize = 1024;
pub const DEFAULT_STEP_EDIT_CAPACITY: usize = 64;
/// Largest single event the ring accepts, SysEx included.
pub const MAX_EVENT_SIZE: usize = 256;

const HEADER_SIZE: usize = 12;

pub struct ImmediateEventQueue {
    producer: Mutex<Producer<u8>>,
    consumer: Mutex<Consumer<u8>>,
    capacity: usize,
}

impl std::fmt::Debug for ImmediateEventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmediateEventQueue")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl Default for ImmediateEventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_IMMEDIATE_CAPACITY)
    }
}

impl ImmediateEventQueue {
    /// `capacity` is in bytes, headers included.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = RingBuffer::new(capacity);
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes (headers included) waiting to be read.
    #[must_use]
    pub fn read_space(&self) -> usize {
        self.capacity - self.producer.lock().slots()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_space() == 0
    }

    /// Queues one event. Returns the number of payload bytes written: either
    /// `bytes.len()` or 0 when the ring has no room. Waits for other writers
    /// but never for the reader; process-thread callers use
    /// [`write_realtime`](Self::write_realtime).
    pub fn write(&self, time: u32, event_type: u32, bytes: &[u8]) -> usize {
        let mut producer = self.producer.lock();
        match push_record(&mut producer, time, event_type, bytes) {
            Ok(written) => written,
            Err(needed) => {
                warn!(
                    needed,
                    available = producer.slots(),
                    "immediate event rejected"
                );
                0
            }
        }
    }

    /// Like [`write`](Self::write), but gives up when another writer holds
    /// the producer and reports failures at trace level only.
    pub fn write_realtime(&self, time: u32, event_type: u32, bytes: &[u8]) -> usize {
        let Some(mut producer) = self.producer.try_lock() else {
            trace!("immediate event writer busy, event dropped");
            return 0;
        };
        match push_record(&mut producer, time, event_type, bytes) {
            Ok(written) => written,
            Err(needed) => {
                trace!(needed, "immediate event ring full, event dropped");
                0
            }
        }
    }

    /// Sink for note resolution on the process thread.
    #[must_use]
    pub fn realtime(&self) -> RealtimeSink<'_> {
        RealtimeSink(self)
    }

    /// Moves queued events into `dest`, all stamped with `time`, in the order
    /// they were written. With `stop_on_overflow` the first event that does
    /// not fit stays queued (with everything behind it) for the next call;
    /// otherwise it is discarded. Returns the number of events delivered.
    ///
    /// Returns 0 without reading if another thread holds the reader.
    pub fn read_into(&self, dest: &mut MidiBuffer, time: u32, stop_on_overflow: bool) -> usize {
        let Some(mut consumer) = self.consumer.try_lock() else {
            trace!("immediate event reader busy");
            return 0;
        };

        let mut delivered = 0;
        let mut payload = [0_u8; MAX_EVENT_SIZE];
        while let Some(size) = peek_size(&mut consumer) {
            let Ok(chunk) = consumer.read_chunk(HEADER_SIZE + size) else {
                break;
            };
            let (first, second) = chunk.as_slices();
            let mut source = first.iter().chain(second).skip(HEADER_SIZE);
            for byte in &mut payload[..size] {
                if let Some(value) = source.next() {
                    *byte = *value;
                }
            }

            if dest.insert(time, &payload[..size]) {
                chunk.commit_all();
                delivered += 1;
            } else if stop_on_overflow {
                drop(chunk);
                trace!(pending = consumer.slots(), "destination full, keeping immediate events");
                break;
            } else {
                chunk.commit_all();
                warn!("destination full, immediate event discarded");
            }
        }
        delivered
    }

    /// Drains everything into owned events. Meant for non-realtime readers.
    #[must_use]
    pub fn drain(&self) -> Vec<(u32, Vec<u8>)> {
        let mut consumer = self.consumer.lock();
        let mut events = Vec::new();
        while let Some(size) = peek_size(&mut consumer) {
            let Ok(chunk) = consumer.read_chunk(HEADER_SIZE + size) else {
                break;
            };
            let (first, second) = chunk.as_slices();
            let record: Vec<u8> = first.iter().chain(second).copied().collect();
            chunk.commit_all();
            let time = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            events.push((time, record[HEADER_SIZE..].to_vec()));
        }
        events
    }
}

/// Frames one record into the ring. On failure returns the number of bytes
/// the record would have needed.
fn push_record(
    producer: &mut Producer<u8>,
    time: u32,
    event_type: u32,
    bytes: &[u8],
) -> Result<usize, usize> {
    let total = HEADER_SIZE + bytes.len();
    if bytes.is_empty() || bytes.len() > MAX_EVENT_SIZE {
        return Err(total);
    }
    let Ok(size) = u32::try_from(bytes.len()) else {
        return Err(total);
    };
    let Ok(mut chunk) = producer.write_chunk(total) else {
        return Err(total);
    };

    let header = [time.to_le_bytes(), event_type.to_le_bytes(), size.to_le_bytes()];
    let mut source = header.iter().flatten().chain(bytes).copied();
    let (first, second) = chunk.as_mut_slices();
    for slot in first.iter_mut().chain(second.iter_mut()) {
        if let Some(byte) = source.next() {
            *slot = byte;
        }
    }
    chunk.commit_all();
    Ok(bytes.len())
}

/// Payload size of the next complete record, without consuming it.
fn peek_size(consumer: &mut Consumer<u8>) -> Option<usize> {
    let chunk = consumer.read_chunk(HEADER_SIZE).ok()?;
    let (first, second) = chunk.as_slices();
    let mut header = [0_u8; HEADER_SIZE];
    for (slot, byte) in header.iter_mut().zip(first.iter().chain(second)) {
        *slot = *byte;
    }
    drop(chunk);

    let size = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    let size = usize::try_from(size).ok()?;
    (consumer.slots() >= HEADER_SIZE + size).then_some(size)
}

impl EventSink for &ImmediateEventQueue {
    fn write_event(&mut self, time: u32, bytes: &[u8]) -> bool {
        let event_type = bytes.first().map_or(0, |status| midi_event_type(*status));
        self.write(time, event_type, bytes) == bytes.len()
    }
}

/// Writes through [`ImmediateEventQueue::write_realtime`].
pub struct RealtimeSink<'a>(&'a ImmediateEventQueue);

impl EventSink for RealtimeSink<'_> {
    fn write_event(&mut self, time: u32, bytes: &[u8]) -> bool {
        let event_type = bytes.first().map_or(0, |status| midi_event_type(*status));
        self.0.write_realtime(time, event_type, bytes) == bytes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_keeps_remaining_events_queued() {
        let queue = ImmediateEventQueue::new(256);
        for note in 0..4 {
            assert_eq!(queue.write(0, 0x90, &[0x90, note, 100]), 3);
        }

        let mut small = MidiBuffer::with_capacity(6);
        assert_eq!(queue.read_into(&mut small, 63, true), 2);
        assert_eq!(queue.read_space(), 2 * (HEADER_SIZE + 3));

        let mut large = MidiBuffer::with_capacity(64);
        assert_eq!(queue.read_into(&mut large, 63, true), 2);
        let notes: Vec<u8> = large.iter().map(|event| event.bytes[1]).collect();
        assert_eq!(notes, vec![2, 3]);
        assert!(large.iter().all(|event| event.time == 63));
        assert!(queue.is_empty());
    }

    #[test]
    fn full_ring_rejects_without_blocking() {
        let queue = ImmediateEventQueue::new(HEADER_SIZE + 3);
        assert_eq!(queue.write(0, 0xB0, &[0xB0, 7, 100]), 3);
        assert_eq!(queue.write(0, 0xB0, &[0xB0, 7, 101]), 0);
    }

    #[test]
    fn realtime_writer_gives_up_while_another_writer_holds_the_ring() {
        let queue = ImmediateEventQueue::new(256);
        {
            let _writer = queue.producer.lock();
            assert_eq!(queue.write_realtime(0, 0x90, &[0x90, 60, 100]), 0);
        }
        assert_eq!(queue.write_realtime(0, 0x90, &[0x90, 60, 100]), 3);
        assert_eq!(queue.drain(), vec![(0, vec![0x90, 60, 100])]);
    }

    #[test]
    fn realtime_writer_drops_when_full() {
        let queue = ImmediateEventQueue::new(HEADER_SIZE + 3);
        assert_eq!(queue.write_realtime(0, 0xB0, &[0xB0, 7, 100]), 3);
        assert_eq!(queue.write_realtime(0, 0xB0, &[0xB0, 7, 101]), 0);
        assert_eq!(queue.drain().len(), 1);
    }

    #[test]
    fn records_wrap_around_the_ring() {
        let queue = ImmediateEventQueue::new(40);
        let mut buffer = MidiBuffer::with_capacity(64);
        for round in 0..10_u8 {
            assert_eq!(queue.write(0, 0xB0, &[0xB0, 1, round]), 3);
            assert_eq!(queue.write(0, 0xC0, &[0xC0, round]), 2);
            buffer.clear();
            assert_eq!(queue.read_into(&mut buffer, 0, true), 2);
            let events: Vec<&[u8]> = buffer.iter().map(|event| event.bytes).collect();
            assert_eq!(events, vec![&[0xB0, 1, round][..], &[0xC0, round][..]]);
        }
    }
}

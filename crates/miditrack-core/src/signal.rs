//! Synchronous change notification: subscribers are called on the thread
//! that emits, in connection order.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection(u64);

pub struct Signal<T> {
    slots: Mutex<Vec<(Connection, Slot<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.slots.lock().len())
            .finish()
    }
}

impl<T> Signal<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, slot: impl Fn(&T) + Send + Sync + 'static) -> Connection {
        let connection = Connection(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots.lock().push((connection, Arc::new(slot)));
        connection
    }

    /// Returns false if the connection was already gone.
    pub fn disconnect(&self, connection: Connection) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|(id, _)| *id != connection);
        slots.len() != before
    }

    pub fn disconnect_all(&self) {
        self.slots.lock().clear();
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Calls every subscriber with `value`. The subscriber list is
    /// snapshotted first, so a slot may connect or disconnect re-entrantly.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Slot<T>> = self
            .slots
            .lock()
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in snapshot {
            slot(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn emits_in_order_until_disconnected() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = Arc::clone(&seen);
            signal.connect(move |value| seen.lock().push(("first", *value)))
        };
        {
            let seen = Arc::clone(&seen);
            signal.connect(move |value| seen.lock().push(("second", *value)));
        }

        signal.emit(&1);
        assert!(signal.disconnect(first));
        assert!(!signal.disconnect(first));
        signal.emit(&2);

        assert_eq!(
            *seen.lock(),
            vec![("first", 1), ("second", 1), ("second", 2)]
        );
    }

    #[test]
    fn slot_may_disconnect_itself_while_emitting() {
        let signal = Arc::new(Signal::<()>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(Mutex::new(None));

        let connection = {
            let inner = Arc::clone(&signal);
            let calls = Arc::clone(&calls);
            let handle = Arc::clone(&handle);
            signal.connect(move |()| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(connection) = handle.lock().take() {
                    inner.disconnect(connection);
                }
            })
        };
        *handle.lock() = Some(connection);

        signal.emit(&());
        signal.emit(&());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

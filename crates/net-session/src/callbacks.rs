//! Single-slot callback storage.
//!
//! Each slot has its own mutex. Replacing a callback and invoking it are
//! mutually exclusive, so a callback is never swapped out mid-call. The lock
//! is not re-entrant: a callback must not replace its own slot.

use parking_lot::Mutex;

use crate::registry::ClientInfo;
use net_protocol::ClientId;

/// Client: payload from the server.
pub type ClientDataFn = dyn FnMut(&[u8]) + Send;
/// Client: connected / disconnected notifications.
pub type ClientEventFn = dyn FnMut() + Send;
/// Server: payload from one client.
pub type ServerDataFn = dyn FnMut(ClientId, &[u8]) + Send;
/// Server: client connected / disconnected notifications.
pub type ClientInfoFn = dyn FnMut(&ClientInfo) + Send;

pub struct CallbackSlot<F: ?Sized> {
    slot: Mutex<Option<Box<F>>>,
}

impl<F: ?Sized> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<F: ?Sized> CallbackSlot<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last writer wins.
    pub fn set(&self, callback: Box<F>) {
        *self.slot.lock() = Some(callback);
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Invoke the callback, if any, while holding the slot lock.
    /// Returns whether a callback ran.
    pub fn with(&self, call: impl FnOnce(&mut F)) -> bool {
        let mut slot = self.slot.lock();
        match slot.as_deref_mut() {
            Some(callback) => {
                call(callback);
                true
            }
            None => false,
        }
    }
}

impl<F: ?Sized> std::fmt::Debug for CallbackSlot<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_slot_is_not_invoked() {
        let slot: CallbackSlot<ClientEventFn> = CallbackSlot::new();
        assert!(!slot.is_set());
        assert!(!slot.with(|f| f()));
    }

    #[test]
    fn last_writer_wins() {
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: CallbackSlot<ClientDataFn> = CallbackSlot::new();

        slot.set(Box::new(|_| panic!("replaced callback must not run")));
        let counter = Arc::clone(&hits);
        slot.set(Box::new(move |bytes| {
            counter.fetch_add(bytes.len(), Ordering::SeqCst);
        }));

        assert!(slot.with(|f| f(b"abcd")));
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        slot.clear();
        assert!(!slot.with(|f| f(b"ignored")));
    }

    #[test]
    fn callback_keeps_state_between_calls() {
        let slot: CallbackSlot<ServerDataFn> = CallbackSlot::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut calls = 0;
        slot.set(Box::new(move |id, _| {
            calls += 1;
            sink.lock().push((id, calls));
        }));

        slot.with(|f| f(ClientId::new(1), b"a"));
        slot.with(|f| f(ClientId::new(2), b"b"));
        assert_eq!(*seen.lock(), vec![(ClientId::new(1), 1), (ClientId::new(2), 2)]);
    }
}

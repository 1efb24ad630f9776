use std::sync::atomic::{AtomicBool, Ordering};

use event_listener::Event;

/// One-shot broadcast gate. Every task waiting on it is released the moment it is opened, and
/// tasks arriving afterwards pass straight through.
#[derive(Debug)]
pub struct StartGate {
    open: AtomicBool,
    event: Event,
}

impl StartGate {
    pub fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
            event: Event::new(),
        }
    }

    /// Opens the gate. Returns `true` only for the call that actually opened it.
    pub fn open(&self) -> bool {
        if self.open.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.event.notify(usize::MAX);
        true
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        loop {
            if self.is_open() {
                return;
            }
            // Register before re-checking so an `open` racing with us cannot be missed.
            let listener = self.event.listen();
            if self.is_open() {
                return;
            }
            listener.await;
        }
    }
}

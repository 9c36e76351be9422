//! Shared helpers for integration tests.
#![allow(dead_code)]

use ftl::events::{Event, EventSink};
use parking_lot::Mutex;
use std::sync::Arc;

/// Sink that records every event for later assertions.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<Event>>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count<F: Fn(&Event) -> bool>(&self, pred: F) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

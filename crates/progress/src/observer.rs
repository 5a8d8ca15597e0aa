//! Observer implementations.

use optimus_core::{Observer, ProgressEvent};
use std::sync::Mutex;
use tracing::{info, warn};

/// Writes every event to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn notify(&self, event: ProgressEvent) {
        if event.is_failure() {
            warn!("{}", event);
        } else {
            info!("{}", event);
        }
    }
}

/// Collects events so callers can return them.
#[derive(Debug, Default)]
pub struct BufferedObserver {
    events: Mutex<Vec<ProgressEvent>>,
}

impl BufferedObserver {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the events collected so far.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Collected events that report a problem.
    pub fn failures(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().filter(|e| e.is_failure()).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Observer for BufferedObserver {
    fn notify(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

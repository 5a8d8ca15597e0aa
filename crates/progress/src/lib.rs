//! Progress reporting for Optimus.
//!
//! Observers receive synchronous progress while a single operation runs;
//! the event bus carries lifecycle events between long running components.

#![warn(missing_docs)]

pub mod bus;
pub mod events;
pub mod observer;

pub use bus::EventBus;
pub use events::{DeploymentEvent, Event, ReplayEvent};
pub use observer::{BufferedObserver, TracingObserver};

//! Progress events emitted by the push core.
//!
//! The sink is injected; the core never logs directly except through it.
//! Events from a single step arrive in program order, events across
//! concurrent steps carry no ordering.

use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, warn};

use crate::image::Digest;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug)]
pub enum Event {
    Log {
        level: LogLevel,
        message: String,
    },
    Progress {
        unit: String,
        total: u64,
        done: u64,
    },
    TimerSpan {
        name: &'static str,
        elapsed: Duration,
    },
    /// Terminal event of a successful push, emitted exactly once after
    /// every tag has been uploaded.
    ImageCreated {
        reference: String,
        image_digest: Digest,
        config_digest: Digest,
    },
}

pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: Event);
}

/// Routes events to `tracing` at the matching level.
#[derive(Clone, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn dispatch(&self, event: Event) {
        match event {
            Event::Log { level, message } => match level {
                LogLevel::Debug => debug!("{message}"),
                LogLevel::Info => info!("{message}"),
                LogLevel::Warn => warn!("{message}"),
                LogLevel::Error => error!("{message}"),
            },
            Event::Progress { unit, total, done } => debug!(%unit, total, done, "progress"),
            Event::TimerSpan { name, elapsed } => debug!(name, ?elapsed, "timed"),
            Event::ImageCreated {
                reference,
                image_digest,
                config_digest,
            } => info!(%reference, %image_digest, %config_digest, "image created"),
        }
    }
}

/// Collects events into a channel, for callers that render progress
/// themselves and for tests asserting delivery order.
#[derive(Clone, Debug)]
pub struct ChannelSink(mpsc::Sender<Event>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Self(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn dispatch(&self, event: Event) {
        // A dropped receiver means nobody is listening anymore.
        let _ = self.0.send(event);
    }
}

/// Measures one step body; dispatches a `TimerSpan` when dropped.
pub(crate) struct Timer {
    name: &'static str,
    start: Instant,
    sink: Arc<dyn EventSink>,
}

impl Timer {
    pub(crate) fn start(sink: Arc<dyn EventSink>, name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            sink,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.sink.dispatch(Event::TimerSpan {
            name: self.name,
            elapsed: self.start.elapsed(),
        });
    }
}

pub(crate) fn log(sink: &dyn EventSink, level: LogLevel, message: impl Into<String>) {
    sink.dispatch(Event::Log {
        level,
        message: message.into(),
    });
}

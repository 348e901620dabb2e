//! Progress, timeout and error notifications for the host application.
//!
//! Callbacks run synchronously on the thread driving the session, in
//! registration order. They never run on the background reader, so a slow
//! callback delays the next packet but cannot stall byte accumulation.
//! Callbacks should still return promptly; hand heavy work to a channel.

use serde::{Deserialize, Serialize};

/// Kind of event a callback subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Progress,
    Timeout,
    Error,
}

/// An event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum DfuEvent {
    /// Firmware transfer progress.
    Progress {
        /// Percent complete (0-100).
        percent: u8,
        /// The data phase finished.
        done: bool,
        message: String,
    },
    /// An acknowledgement did not arrive in time.
    Timeout { message: String },
    /// A transport failure the host should surface.
    Error { message: String },
}

impl DfuEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DfuEvent::Progress { .. } => EventKind::Progress,
            DfuEvent::Timeout { .. } => EventKind::Timeout,
            DfuEvent::Error { .. } => EventKind::Error,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DfuEvent::Progress { message, .. }
            | DfuEvent::Timeout { message }
            | DfuEvent::Error { message } => message,
        }
    }
}

type Callback = Box<dyn Fn(&DfuEvent) + Send>;

/// Event subscription table.
///
/// Registration is additive; there is no unsubscribe.
#[derive(Default)]
pub struct EventBus {
    progress: Vec<Callback>,
    timeout: Vec<Callback>,
    error: Vec<Callback>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind.
    pub fn on<F>(&mut self, kind: EventKind, callback: F)
    where
        F: Fn(&DfuEvent) + Send + 'static,
    {
        self.slot_mut(kind).push(Box::new(callback));
    }

    /// Deliver an event to every subscriber of its kind.
    pub fn emit(&self, event: &DfuEvent) {
        for callback in self.slot(event.kind()) {
            callback(event);
        }
    }

    fn slot(&self, kind: EventKind) -> &[Callback] {
        match kind {
            EventKind::Progress => &self.progress,
            EventKind::Timeout => &self.timeout,
            EventKind::Error => &self.error,
        }
    }

    fn slot_mut(&mut self, kind: EventKind) -> &mut Vec<Callback> {
        match kind {
            EventKind::Progress => &mut self.progress,
            EventKind::Timeout => &mut self.timeout,
            EventKind::Error => &mut self.error,
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("progress", &self.progress.len())
            .field("timeout", &self.timeout.len())
            .field("error", &self.error.len())
            .finish()
    }
}

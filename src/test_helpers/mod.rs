//! Shared test doubles: a scripted bootloader peer, recording pacer and event
//! recorder, plus package fixtures.

pub mod bootloader;
pub mod fixtures;
pub mod temp;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dfu::events::{DfuEvent, EventBus, EventKind};
use crate::dfu::transport::Pacer;

pub use bootloader::{Reply, ScriptedBootloader};
pub use temp::TestContext;

/// Route `log` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Pacer that records requested waits instead of sleeping.
///
/// When watching a [`ScriptedBootloader`], each pause also records how many
/// frames the host had written at that point.
#[derive(Clone, Default)]
pub struct RecordingPacer {
    pauses: Arc<Mutex<Vec<(Duration, usize)>>>,
    device: Option<ScriptedBootloader>,
}

impl RecordingPacer {
    pub fn watching(device: &ScriptedBootloader) -> Self {
        Self {
            pauses: Arc::default(),
            device: Some(device.clone()),
        }
    }

    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses_with_writes()
            .into_iter()
            .map(|(duration, _)| duration)
            .collect()
    }

    pub fn pauses_with_writes(&self) -> Vec<(Duration, usize)> {
        self.pauses.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.pauses.lock().unwrap().clear();
    }
}

impl Pacer for RecordingPacer {
    fn pause(&self, duration: Duration) {
        let writes = self
            .device
            .as_ref()
            .map_or(0, |device| device.writes().len());
        self.pauses.lock().unwrap().push((duration, writes));
    }
}

/// Collects every event emitted on the buses it is attached to.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<DfuEvent>>>,
}

impl EventRecorder {
    pub fn attach_to(&self, bus: &mut EventBus) {
        for kind in [EventKind::Progress, EventKind::Timeout, EventKind::Error] {
            let events = Arc::clone(&self.events);
            bus.on(kind, move |event| events.lock().unwrap().push(event.clone()));
        }
    }

    pub fn events(&self) -> Vec<DfuEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<DfuEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.kind() == kind)
            .collect()
    }

    /// Percent values of all progress events, in order.
    pub fn progress(&self) -> Vec<u8> {
        self.events()
            .iter()
            .filter_map(|event| match event {
                DfuEvent::Progress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect()
    }
}

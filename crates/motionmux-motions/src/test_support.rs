//! Shared doubles for the producer tests.

use std::sync::{Arc, Mutex};

use motionmux_kernel::{EngineConfig, MotionEngine};
use motionmux_types::{EventKind, EventSink, MotionEvent, MotionId, SlotLayout, Transition};

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<MotionEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<MotionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Transitions posted by `id`, any kind.
    pub fn transitions(&self, id: MotionId) -> Vec<Transition> {
        self.events()
            .into_iter()
            .filter(|e| e.source == id)
            .map(|e| e.transition)
            .collect()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<MotionEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn post_event(&self, event: MotionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Joint-only engine with the default 4 x 8 ms tick.
pub fn engine_with(slots: usize, sink: Arc<RecordingSink>) -> MotionEngine {
    MotionEngine::new(EngineConfig::with_slots(slots), sink).unwrap()
}

pub fn engine_with_layout(layout: SlotLayout, sink: Arc<RecordingSink>) -> MotionEngine {
    MotionEngine::with_layout(EngineConfig::with_slots(layout.len()), layout, sink).unwrap()
}

//! Topic-based publish/subscribe bus for motion events.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives every
//! message and a slow subscriber only ever loses its own backlog.  Publishing
//! never blocks, which makes the bus safe to hand to the engine as its
//! [`EventSink`]: events are posted from inside the tick.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::All`] | Every event, whatever its kind |
//! | [`Topic::Motion`] | Producer lifecycle and "target reached" |
//! | [`Topic::EmergencyStop`] | Freeze / release |
//! | [`Topic::Walk`] | Gait start / finish |
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use motionmux_middleware::{EventBus, Topic};
//! use motionmux_types::{EventKind, EventSink, MotionEvent, MotionId, Transition};
//! use std::time::Duration;
//!
//! let bus = Arc::new(EventBus::default());
//! let mut stops = bus.subscribe_to(Topic::EmergencyStop);
//!
//! bus.post_event(MotionEvent::new(
//!     EventKind::EmergencyStop,
//!     MotionId::from_raw(1),
//!     Transition::Activate,
//!     Duration::ZERO,
//!     Duration::ZERO,
//! ));
//! assert!(stops.try_recv().is_ok());
//! ```

use motionmux_types::{EventKind, EventSink, MotionEvent, MuxError};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default channel capacity (events buffered before slow subscribers lag).
pub const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event regardless of kind.
    All,
    Motion,
    EmergencyStop,
    Walk,
}

impl Topic {
    /// The kind-specific lane an event is routed to (besides [`Topic::All`]).
    pub fn for_kind(kind: EventKind) -> Self {
        match kind {
            EventKind::Motion => Topic::Motion,
            EventKind::EmergencyStop => Topic::EmergencyStop,
            EventKind::Walk => Topic::Walk,
        }
    }
}

/// Shared event bus.  Clone it cheaply; all clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<MotionEvent>,
    motion: broadcast::Sender<MotionEvent>,
    emergency_stop: broadcast::Sender<MotionEvent>,
    walk: broadcast::Sender<MotionEvent>,
}

impl EventBus {
    /// Create a bus; `capacity` applies to every topic independently.
    ///
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        let (motion, _) = broadcast::channel(capacity);
        let (emergency_stop, _) = broadcast::channel(capacity);
        let (walk, _) = broadcast::channel(capacity);
        Self {
            all,
            motion,
            emergency_stop,
            walk,
        }
    }

    // ── Publishing ───────────────────────────────────────────────────────────

    /// Publish `event` to one topic only.
    ///
    /// Returns the number of receivers handed the event, or
    /// [`MuxError::Channel`] when nobody is listening on that topic.
    pub fn publish_to(&self, topic: Topic, event: MotionEvent) -> Result<usize, MuxError> {
        self.sender(topic)
            .send(event)
            .map_err(|_| MuxError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Publish `event` to [`Topic::All`] and to its kind's lane.
    ///
    /// Returns the total number of receivers reached; zero is not an error.
    pub fn publish(&self, event: MotionEvent) -> usize {
        let lane = Topic::for_kind(event.kind);
        let mut delivered = self.all.send(event.clone()).unwrap_or(0);
        delivered += self.sender(lane).send(event).unwrap_or(0);
        delivered
    }

    // ── Subscribing ──────────────────────────────────────────────────────────

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.sender(topic).receiver_count()
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<MotionEvent> {
        match topic {
            Topic::All => &self.all,
            Topic::Motion => &self.motion,
            Topic::EmergencyStop => &self.emergency_stop,
            Topic::Walk => &self.walk,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventSink for EventBus {
    fn post_event(&self, event: MotionEvent) {
        let (kind, source, transition) = (event.kind, event.source, event.transition);
        let delivered = self.publish(event);
        trace!(?kind, %source, ?transition, delivered, "event published");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Receiver
// ────────────────────────────────────────────────────────────────────────────

/// A receiver bound to a single [`Topic`].  Obtained via
/// [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<MotionEvent>,
}

impl TopicReceiver {
    /// Wait for the next event.  Lag is logged and skipped; `None` means the
    /// bus is gone.
    pub async fn recv(&mut self) -> Option<MotionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll, for synchronous consumers such as the control
    /// thread or a CLI printer.
    pub fn try_recv(&mut self) -> Result<MotionEvent, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain everything currently buffered, skipping over lag.
    pub fn drain(&mut self) -> Vec<MotionEvent> {
        let mut out = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "event subscriber lagged");
                }
                Err(_) => return out,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

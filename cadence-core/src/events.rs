//! Playback events, delivered over channels to whoever owns the pipeline.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::error::PlaybackError;
use crate::sync::PlaybackState;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    BufferingStarted,
    BufferingCompleted {
        error: Option<PlaybackError>,
    },
    /// Terminal. Fired once, after which the pipeline is torn down.
    PlaybackStopped {
        error: Option<PlaybackError>,
    },
    SeekCompleted {
        id: u64,
        result_ms: i64,
        error: Option<PlaybackError>,
    },
    StateChanged {
        from: PlaybackState,
        to: PlaybackState,
    },
    SpeedChanged {
        speed: f64,
    },
    Ended,
}

/// Fan-out of events to any number of subscribers.
///
/// Subscribers that drop their receiver are pruned on the next emit.
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PlaybackEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: PlaybackEvent) {
        tracing::trace!("event: {:?}", event);
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.emit(PlaybackEvent::BufferingStarted);
        assert_eq!(a.try_recv(), Ok(PlaybackEvent::BufferingStarted));
        assert_eq!(b.try_recv(), Ok(PlaybackEvent::BufferingStarted));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        bus.emit(PlaybackEvent::Ended);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(keep.try_recv(), Ok(PlaybackEvent::Ended));
    }
}

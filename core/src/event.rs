use crate::dtmf::{DtmfDigit, DtmfEvent};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RingStopReason {
    Completed,
    Cancelled,
    Answered,
    Failed,
}

/// Everything the line reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LineEvent {
    OffHook {
        voltage: f32,
    },
    OnHook {
        voltage: f32,
    },
    Dtmf {
        digit: DtmfDigit,
        duration_ms: u32,
        signal_level_dbm: f32,
    },
    RingStart {
        pattern: String,
    },
    RingStop {
        reason: RingStopReason,
    },
    VoltageSample {
        volts: f32,
    },
    Error {
        message: String,
    },
}

impl From<&DtmfEvent> for LineEvent {
    fn from(event: &DtmfEvent) -> Self {
        LineEvent::Dtmf {
            digit: event.digit,
            duration_ms: event.duration_ms,
            signal_level_dbm: event.signal_level_dbm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhoneEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LineEvent,
}

/// Fire-and-forget fan-out to any number of listeners.
///
/// Slow listeners lose the oldest events rather than holding up the line.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PhoneEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many listeners received it.
    pub fn emit(&self, event: LineEvent) -> usize {
        let event = PhoneEvent {
            timestamp: Utc::now(),
            event,
        };
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!("No listeners for {:?}", event.event);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhoneEvent> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(crate::EVENT_CHANNEL_CAPACITY)
    }
}

//! Broadcast of received frames and status to external consumers

use chrono::Utc;
use tokio::sync::broadcast;
use vbs_core::{BusEvent, BusKind, BusStatus, Frame};

/// Default number of events buffered per receiver
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

/// Fan-out of [`BusEvent`]s
///
/// Publishing never blocks. Having no receivers is not an error; slow
/// receivers observe `Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<BusEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish(&self, event: BusEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    /// Publish a frame received on `bus`
    pub fn frame_received(&self, bus: BusKind, frame: &Frame) {
        let timestamp = Utc::now();
        let event = match bus {
            BusKind::Can => BusEvent::CanFrameReceived {
                timestamp,
                id: frame.id(),
                data: frame.data().to_vec(),
            },
            BusKind::J1708 => BusEvent::J1708FrameReceived {
                timestamp,
                priority: frame.priority().unwrap_or_default(),
                id: frame.id(),
                data: frame.data().to_vec(),
            },
        };
        self.publish(event);
    }

    pub fn status(&self, status: BusStatus) {
        self.publish(BusEvent::Status {
            timestamp: Utc::now(),
            status,
        });
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_CAPACITY)
    }
}

//! J1708 bus controller
//!
//! J1708 shares the transceiver with CAN but has a fixed line speed, so there
//! is no discovery and every received message goes straight to the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error, info};
use vbs_core::{BusKind, Frame, VbsError, VbsResult};

use crate::manager::{BusCallback, BusResourceManager};
use crate::queue::FrameQueue;
use crate::sink::BroadcastSink;
use crate::worker::{BusWorkerPair, WorkerSlot};

pub struct J1708Bus {
    manager: Arc<BusResourceManager>,
    sink: BroadcastSink,
    queue: Arc<FrameQueue>,
    write_idle: Duration,
    started: AtomicBool,
    workers: WorkerSlot,
    this: Weak<J1708Bus>,
}

impl J1708Bus {
    pub fn new(
        manager: Arc<BusResourceManager>,
        sink: BroadcastSink,
        queue_capacity: usize,
        write_idle: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            manager,
            sink,
            queue: Arc::new(FrameQueue::new(queue_capacity)),
            write_idle,
            started: AtomicBool::new(false),
            workers: WorkerSlot::default(),
            this: this.clone(),
        })
    }

    /// Whether the transceiver has a J1708 channel at all
    pub fn is_supported(&self) -> bool {
        self.manager.supports(BusKind::J1708)
    }

    pub fn start(&self) -> VbsResult<()> {
        if !self.is_supported() {
            return Err(VbsError::Unsupported(format!(
                "J1708 is not available on {}",
                self.manager.transport().interface()
            )));
        }

        self.stop();

        info!("Starting J1708");
        self.started.store(true, Ordering::SeqCst);
        let name = BusKind::J1708.name();
        if self
            .manager
            .start(name, Some(self.ready_callback()), Some(self.terminated_callback()))
        {
            Ok(())
        } else {
            Err(VbsError::StartFailed("J1708 link setup failed".to_string()))
        }
    }

    pub fn stop(&self) {
        self.workers.clear();
        self.manager.stop(BusKind::J1708.name());
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn stop_all(&self) {
        self.workers.clear();
        self.manager.stop_all();
        self.started.store(false, Ordering::SeqCst);
    }

    /// Queue a message for transmission; false when the queue is full
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.queue.enqueue(frame)
    }

    pub fn abort_transmits(&self) {
        self.queue.clear();
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_read_ready(&self) -> bool {
        self.workers.is_read_ready()
    }

    pub fn is_write_ready(&self) -> bool {
        self.workers.is_write_ready()
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    fn ready_callback(&self) -> BusCallback {
        let this = self.this.clone();
        Arc::new(move || {
            if let Some(bus) = this.upgrade() {
                bus.attach();
            }
        })
    }

    fn terminated_callback(&self) -> BusCallback {
        let this = self.this.clone();
        Arc::new(move || {
            if let Some(bus) = this.upgrade() {
                bus.workers.clear();
            }
        })
    }

    fn attach(&self) {
        let Some(socket) = self.manager.socket() else {
            debug!("J1708 ready but no link, not starting workers");
            return;
        };

        let sink = self.sink.clone();
        let handler = Arc::new(move |frame: Frame| sink.frame_received(BusKind::J1708, &frame));
        // The CAN link mode does not restrict the J1708 channel
        let pair = BusWorkerPair::read_write(
            BusKind::J1708,
            self.manager.transport().clone(),
            socket,
            handler,
            self.queue.clone(),
            self.write_idle,
        );

        match pair {
            Ok(pair) => self.workers.replace(pair),
            Err(e) => error!(error = %e, "Failed to start J1708 workers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use pretty_assertions::assert_eq;
    use vbs_core::{BusEvent, LinkMode};

    use crate::config::MockConfig;
    use crate::dispatcher::Dispatcher;
    use crate::transport::mock::MockTransport;

    fn fixture(j1708: bool) -> (Arc<MockTransport>, BroadcastSink, Arc<J1708Bus>) {
        let transport = Arc::new(MockTransport::new(&MockConfig {
            j1708,
            ..Default::default()
        }));
        let dispatcher = Arc::new(Dispatcher::new().unwrap());
        let manager = Arc::new(BusResourceManager::new(
            transport.clone(),
            dispatcher,
            Duration::ZERO,
        ));
        let sink = BroadcastSink::default();
        let bus = J1708Bus::new(manager, sink.clone(), 10, Duration::from_millis(1));
        (transport, sink, bus)
    }

    fn wait(pred: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !pred() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    #[test]
    fn test_unsupported_transport() {
        let (transport, _sink, bus) = fixture(false);
        assert!(matches!(bus.start(), Err(VbsError::Unsupported(_))));
        assert!(!bus.is_started());
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_start_uses_blocking_can_defaults() {
        let (transport, _sink, bus) = fixture(true);
        bus.start().unwrap();

        assert!(wait(|| bus.is_read_ready() && bus.is_write_ready()));
        assert_eq!(transport.current_mode(), Some(LinkMode::ListenOnly));
        assert_eq!(transport.bitrate_history(), vec![250_000]);
    }

    #[test]
    fn test_received_messages_are_broadcast() {
        let (transport, sink, bus) = fixture(true);
        let mut events = sink.subscribe();
        bus.start().unwrap();
        assert!(wait(|| bus.is_read_ready()));

        transport.inject(BusKind::J1708, Frame::j1708(8, 0x80, vec![0x55, 0xAA]).unwrap());

        let deadline = Instant::now() + Duration::from_secs(3);
        let event = loop {
            match events.try_recv() {
                Ok(event) => break event,
                Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(2)),
                Err(e) => panic!("no J1708 event: {:?}", e),
            }
        };
        match event {
            BusEvent::J1708FrameReceived { priority, id, data, .. } => {
                assert_eq!(priority, 8);
                assert_eq!(id, 0x80);
                assert_eq!(data, vec![0x55, 0xAA]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_send_and_stop() {
        let (transport, _sink, bus) = fixture(true);
        bus.start().unwrap();
        assert!(wait(|| bus.is_write_ready()));

        let frame = Frame::j1708(3, 0x81, vec![1, 2, 3]).unwrap();
        assert!(bus.send_frame(frame.clone()));
        assert!(transport.wait_for_sent(1, Duration::from_secs(3)));
        assert_eq!(transport.sent_frames()[0], (BusKind::J1708, frame));

        bus.stop();
        assert!(!bus.is_started());
        assert!(!bus.is_read_ready());
        assert!(!transport.is_link_up());
    }
}

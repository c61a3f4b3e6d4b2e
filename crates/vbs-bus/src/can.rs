//! CAN bus controller
//!
//! Starts the CAN consumer in one of three modes:
//! - auto-detect: forget any confirmed bitrate and run discovery (listen-only)
//! - confirmed: the requested bitrate was confirmed before, start read/write
//! - unconfirmed: listen-only until the first frame proves the bitrate
//!
//! The first frame received while unconfirmed confirms the bitrate it was
//! decoded at and reopens the link in normal mode. That happens exactly once
//! per start.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use vbs_core::{BusKind, FlowControlRecord, Frame, HardwareFilter, VbsError, VbsResult};

use crate::discovery::DiscoveryController;
use crate::manager::{BusCallback, BusResourceManager, CHARACTERISTICS_OWNER};
use crate::queue::FrameQueue;
use crate::sink::BroadcastSink;
use crate::state::{PersistenceGateway, StateKey};
use crate::worker::{BusWorkerPair, FrameHandler, WorkerSlot};

/// Parameters of a CAN start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanStartRequest {
    pub bitrate: u32,
    /// Cycle candidate bitrates until traffic is seen
    #[serde(default)]
    pub auto_detect: bool,
    /// Treat `bitrate` as confirmed and skip listen-only verification
    #[serde(default)]
    pub skip_verify: bool,
    pub filters: Vec<HardwareFilter>,
    #[serde(default)]
    pub flow_controls: Vec<FlowControlRecord>,
}

pub struct CanBus {
    manager: Arc<BusResourceManager>,
    discovery: Arc<DiscoveryController>,
    persistence: Arc<dyn PersistenceGateway>,
    sink: BroadcastSink,
    queue: Arc<FrameQueue>,
    write_idle: Duration,
    confirmed: AtomicU32,
    started: AtomicBool,
    workers: WorkerSlot,
    this: Weak<CanBus>,
}

/// Routes frames from a worker pair, remembering the bitrate its link runs at
struct CanFrameHandler {
    bus: Weak<CanBus>,
    bitrate: u32,
}

impl FrameHandler for CanFrameHandler {
    fn on_frame(&self, frame: Frame) {
        if let Some(bus) = self.bus.upgrade() {
            bus.on_frame(frame, self.bitrate);
        }
    }
}

impl CanBus {
    pub fn new(
        manager: Arc<BusResourceManager>,
        discovery: Arc<DiscoveryController>,
        persistence: Arc<dyn PersistenceGateway>,
        sink: BroadcastSink,
        queue_capacity: usize,
        write_idle: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            manager,
            discovery,
            persistence,
            sink,
            queue: Arc::new(FrameQueue::new(queue_capacity)),
            write_idle,
            confirmed: AtomicU32::new(0),
            started: AtomicBool::new(false),
            workers: WorkerSlot::default(),
            this: this.clone(),
        })
    }

    /// Start (or restart) the CAN consumer
    ///
    /// Any previous session is stopped first. Fails without touching the
    /// link when no filters are given; fails after registering when the
    /// hardware rejects the setup.
    pub fn start(&self, request: CanStartRequest) -> VbsResult<()> {
        if request.bitrate == 0 {
            return Err(VbsError::Config("CAN bitrate must be non-zero".to_string()));
        }
        if request.filters.is_empty() {
            return Err(VbsError::InvalidFilter("no CAN filters specified".to_string()));
        }

        self.stop();

        if request.skip_verify {
            self.set_confirmed_bitrate(request.bitrate);
        }

        let confirmed = self.confirmed_bitrate();
        let mode = if request.auto_detect {
            "auto-detect"
        } else if confirmed == request.bitrate {
            "normal"
        } else {
            "verify"
        };
        info!(bitrate = request.bitrate, mode, filters = request.filters.len(), "Starting CAN");

        self.started.store(true, Ordering::SeqCst);
        let started = if request.auto_detect {
            self.clear_confirmed_bitrate();
            self.discovery.start_discovery(
                request.bitrate,
                request.filters,
                request.flow_controls,
                self.ready_callback(false),
                Some(self.terminated_callback()),
            )
        } else if confirmed == request.bitrate {
            self.manager.set_characteristics(
                false,
                request.bitrate,
                request.filters,
                request.flow_controls,
            );
            self.manager.start(
                CHARACTERISTICS_OWNER,
                Some(self.ready_callback(true)),
                Some(self.terminated_callback()),
            )
        } else {
            self.clear_confirmed_bitrate();
            self.manager.set_characteristics(
                true,
                request.bitrate,
                request.filters,
                request.flow_controls,
            );
            self.manager.start(
                CHARACTERISTICS_OWNER,
                Some(self.ready_callback(false)),
                Some(self.terminated_callback()),
            )
        };

        if started {
            Ok(())
        } else {
            Err(VbsError::StartFailed("CAN link setup failed".to_string()))
        }
    }

    /// Stop the CAN consumer; other consumers keep the link
    pub fn stop(&self) {
        self.workers.clear();
        if self.discovery.is_in_discovery() {
            self.discovery.stop_discovery();
        } else {
            self.manager.stop(CHARACTERISTICS_OWNER);
        }
        self.started.store(false, Ordering::SeqCst);
    }

    /// Stop CAN along with every other consumer, tearing the link down once
    pub fn stop_all(&self) {
        self.workers.clear();
        self.discovery.reset();
        self.manager.stop_all();
        self.started.store(false, Ordering::SeqCst);
    }

    /// Queue a frame for transmission; false when the queue is full
    pub fn send_frame(&self, frame: Frame) -> bool {
        self.queue.enqueue(frame)
    }

    /// Drop every frame waiting for transmission
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

    /// Bitrate of the current link, 0 without a link
    pub fn bitrate(&self) -> u32 {
        self.manager.bitrate()
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    pub fn discovery(&self) -> &Arc<DiscoveryController> {
        &self.discovery
    }

    pub fn confirmed_bitrate(&self) -> u32 {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn set_confirmed_bitrate(&self, bitrate: u32) {
        self.confirmed.store(bitrate, Ordering::SeqCst);
        self.persistence
            .put_int(StateKey::CanConfirmedBitrate, i64::from(bitrate));
        debug!(bitrate, "CAN bitrate confirmed");
    }

    pub fn clear_confirmed_bitrate(&self) {
        self.set_confirmed_bitrate(0);
    }

    /// Take the confirmed bitrate from persistence (used when resuming)
    pub fn load_confirmed_bitrate(&self) -> u32 {
        let bitrate = u32::try_from(self.persistence.get_int(StateKey::CanConfirmedBitrate))
            .unwrap_or(0);
        self.confirmed.store(bitrate, Ordering::SeqCst);
        debug!(bitrate, "Loaded confirmed CAN bitrate");
        bitrate
    }

    fn on_frame(&self, frame: Frame, link_bitrate: u32) {
        if self.confirmed.load(Ordering::SeqCst) != 0 {
            self.sink.frame_received(BusKind::Can, &frame);
            return;
        }

        // Only the first frame of this start gets to confirm
        if link_bitrate == 0
            || self
                .confirmed
                .compare_exchange(0, link_bitrate, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return;
        }

        info!(
            bitrate = link_bitrate,
            id = format!("0x{:08X}", frame.id()),
            data = %hex::encode(frame.data()),
            "Traffic observed, switching CAN to normal mode"
        );
        self.discovery.mark_discovered(link_bitrate);
        self.persistence
            .put_int(StateKey::CanConfirmedBitrate, i64::from(link_bitrate));

        self.manager.set_bitrate(link_bitrate);
        self.manager.set_normal_mode();
        if !self
            .manager
            .restart(Some(CHARACTERISTICS_OWNER), Some(self.ready_callback(true)), None)
        {
            warn!(bitrate = link_bitrate, "Failed to reopen CAN in normal mode");
        }
    }

    fn ready_callback(&self, read_write: bool) -> BusCallback {
        let this = self.this.clone();
        Arc::new(move || {
            if let Some(bus) = this.upgrade() {
                bus.attach(read_write);
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

    /// Spawn workers on the current link (dispatcher thread)
    fn attach(&self, read_write: bool) {
        let Some(socket) = self.manager.socket() else {
            debug!("CAN ready but no link, not starting workers");
            return;
        };

        let handler = Arc::new(CanFrameHandler {
            bus: self.this.clone(),
            bitrate: socket.bitrate,
        });
        let transport = self.manager.transport().clone();
        let pair = if read_write && socket.can_transmit() {
            BusWorkerPair::read_write(
                BusKind::Can,
                transport,
                socket,
                handler,
                self.queue.clone(),
                self.write_idle,
            )
        } else {
            BusWorkerPair::read_only(BusKind::Can, transport, socket, handler)
        };

        match pair {
            Ok(pair) => self.workers.replace(pair),
            Err(e) => error!(error = %e, "Failed to start CAN workers"),
        }
    }
}

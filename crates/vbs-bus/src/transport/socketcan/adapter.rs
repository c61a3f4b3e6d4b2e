//! Raw SocketCAN transport
//!
//! Link control (up/down, bitrate, listen-only) goes through netlink on the
//! configured interface. Sockets are nonblocking and polled so a reader
//! notices promptly when the resource manager closes its socket.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socketcan::{
    CanCtrlMode, CanFilter, CanFrame, CanInterface, CanSocket, EmbeddedFrame,
    ExtendedId, Frame as _, Socket, SocketOptions, StandardId,
};
use tracing::{debug, info, warn};
use vbs_core::{BusKind, FlowControlRecord, Frame, FrameType, HardwareFilter, LinkMode};

use crate::config::SocketCanConfig;
use crate::transport::{BusSocket, HardwareTransport, SocketId, TransportError};

/// Extended frame flag in a kernel CAN id
const CAN_EFF_FLAG: u32 = 0x8000_0000;

#[derive(Default)]
struct StagedLink {
    filters: Vec<HardwareFilter>,
    flow_controls: Vec<FlowControlRecord>,
    sockets: HashMap<SocketId, Arc<CanSocket>>,
}

/// SocketCAN transport driving one CAN interface
pub struct SocketCanTransport {
    config: SocketCanConfig,
    staged: Mutex<StagedLink>,
}

impl SocketCanTransport {
    pub fn new(config: &SocketCanConfig) -> Result<Self, TransportError> {
        // Fail early if the interface does not exist
        Self::interface_handle(&config.interface)?;

        info!(interface = %config.interface, "SocketCAN transport created");

        Ok(Self {
            config: config.clone(),
            staged: Mutex::new(StagedLink::default()),
        })
    }

    fn interface_handle(name: &str) -> Result<CanInterface, TransportError> {
        CanInterface::open(name).map_err(|e| {
            TransportError::LinkControl(format!("Failed to open interface {}: {}", name, e))
        })
    }

    fn link(&self) -> Result<CanInterface, TransportError> {
        Self::interface_handle(&self.config.interface)
    }

    fn socket(&self, id: SocketId) -> Result<Arc<CanSocket>, TransportError> {
        self.staged
            .lock()
            .sockets
            .get(&id)
            .cloned()
            .ok_or(TransportError::ConnectionClosed)
    }

    fn kernel_filter(filter: &HardwareFilter) -> CanFilter {
        match filter.frame_type {
            FrameType::Extended => {
                CanFilter::new(filter.id | CAN_EFF_FLAG, filter.mask | CAN_EFF_FLAG)
            }
            FrameType::Standard => CanFilter::new(filter.id, filter.mask | CAN_EFF_FLAG),
        }
    }

    fn to_can_frame(frame: &Frame) -> Result<CanFrame, TransportError> {
        let built = match frame.frame_type() {
            FrameType::Extended => {
                ExtendedId::new(frame.id()).and_then(|id| CanFrame::new(id, frame.data()))
            }
            FrameType::Standard => u16::try_from(frame.id())
                .ok()
                .and_then(StandardId::new)
                .and_then(|id| CanFrame::new(id, frame.data())),
        };
        built.ok_or_else(|| {
            TransportError::InvalidConfig(format!("Cannot encode frame {}", frame))
        })
    }

    fn from_can_frame(frame: &CanFrame) -> Result<Frame, TransportError> {
        let frame_type = if EmbeddedFrame::is_extended(frame) {
            FrameType::Extended
        } else {
            FrameType::Standard
        };
        Frame::new(frame.raw_id(), EmbeddedFrame::data(frame).to_vec(), frame_type)
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))
    }

    /// Answer any flow-control records triggered by `frame`
    fn answer_flow_controls(&self, socket: &CanSocket, frame: &Frame) {
        let records = self.staged.lock().flow_controls.clone();
        for record in records.iter().filter(|r| r.triggers_on(frame)) {
            let response = record
                .response()
                .map_err(|e| TransportError::InvalidConfig(e.to_string()))
                .and_then(|r| Self::to_can_frame(&r));
            match response {
                Ok(response) => {
                    if let Err(e) = socket.write_frame(&response) {
                        warn!(
                            search_id = format!("0x{:08X}", record.search_id),
                            error = %e,
                            "Failed to send flow-control response"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Invalid flow-control record"),
            }
        }
    }
}

impl HardwareTransport for SocketCanTransport {
    fn interface(&self) -> &str {
        &self.config.interface
    }

    fn supports(&self, bus: BusKind) -> bool {
        bus == BusKind::Can
    }

    fn link_up(&self) -> Result<(), TransportError> {
        self.link()?
            .bring_up()
            .map_err(|e| TransportError::LinkControl(format!("link up: {}", e)))
    }

    fn link_down(&self) -> Result<(), TransportError> {
        self.link()?
            .bring_down()
            .map_err(|e| TransportError::LinkControl(format!("link down: {}", e)))
    }

    fn set_bitrate(&self, bitrate: u32) -> Result<(), TransportError> {
        self.link()?
            .set_bitrate(bitrate, None)
            .map_err(|e| TransportError::LinkControl(format!("bitrate {}: {}", bitrate, e)))
    }

    fn set_mode(&self, mode: LinkMode) -> Result<(), TransportError> {
        let listen_only = mode == LinkMode::ListenOnly;
        self.link()?
            .set_ctrlmode(CanCtrlMode::ListenOnly, listen_only)
            .map_err(|e| TransportError::LinkControl(format!("mode {}: {}", mode.as_str(), e)))
    }

    fn apply_filters(&self, filters: &[HardwareFilter]) -> Result<(), TransportError> {
        self.staged.lock().filters = filters.to_vec();
        Ok(())
    }

    fn apply_flow_controls(&self, records: &[FlowControlRecord]) -> Result<(), TransportError> {
        self.staged.lock().flow_controls = records.to_vec();
        Ok(())
    }

    fn open(&self) -> Result<SocketId, TransportError> {
        let socket = CanSocket::open(&self.config.interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open raw CAN socket on {}: {}",
                self.config.interface, e
            ))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        let mut staged = self.staged.lock();
        if !staged.filters.is_empty() {
            let filters: Vec<CanFilter> = staged.filters.iter().map(Self::kernel_filter).collect();
            socket
                .set_filters(&filters)
                .map_err(|e| TransportError::InvalidConfig(format!("Failed to set filters: {}", e)))?;
        }

        let id = socket.as_raw_fd();
        staged.sockets.insert(id, Arc::new(socket));
        debug!(socket = id, interface = %self.config.interface, "Opened raw CAN socket");
        Ok(id)
    }

    fn bind(&self, socket: SocketId) -> Result<u32, TransportError> {
        // Raw sockets are bound to the interface on open; channel 0 is the only channel
        self.socket(socket).map(|_| 0)
    }

    fn close(&self, socket: SocketId) -> Result<(), TransportError> {
        if self.staged.lock().sockets.remove(&socket).is_some() {
            debug!(socket, "Closed raw CAN socket");
        }
        Ok(())
    }

    fn send(&self, socket: &BusSocket, bus: BusKind, frame: &Frame) -> Result<(), TransportError> {
        if bus != BusKind::Can {
            return Err(TransportError::Unsupported(format!("{} over SocketCAN", bus)));
        }
        let raw = self.socket(socket.socket)?;
        let can_frame = Self::to_can_frame(frame)?;

        loop {
            match raw.write_frame(&can_frame) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Transmit queue full; wait unless the socket went away
                    self.socket(socket.socket)?;
                    std::thread::sleep(Duration::from_millis(self.config.poll_interval_ms));
                }
                Err(e) => return Err(TransportError::SendFailed(e.to_string())),
            }
        }
    }

    fn receive(&self, socket: &BusSocket, bus: BusKind) -> Result<Frame, TransportError> {
        if bus != BusKind::Can {
            return Err(TransportError::Unsupported(format!("{} over SocketCAN", bus)));
        }

        loop {
            // Re-resolve each pass so a close from another thread ends the read
            let raw = self.socket(socket.socket)?;
            match raw.read_frame() {
                Ok(can_frame) => {
                    if can_frame.is_error_frame() || EmbeddedFrame::is_remote_frame(&can_frame) {
                        continue;
                    }
                    let frame = Self::from_can_frame(&can_frame)?;
                    if socket.can_transmit() {
                        self.answer_flow_controls(&raw, &frame);
                    }
                    return Ok(frame);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(self.config.poll_interval_ms));
                }
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

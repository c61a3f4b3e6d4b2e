//! Hardware transport trait and socket handle

use vbs_core::{BusKind, FlowControlRecord, Frame, HardwareFilter, LinkMode};

use super::TransportError;

/// Raw socket number handed out by the driver
pub type SocketId = i32;

/// Handle to an open, bound hardware socket
///
/// Created and destroyed only by the resource manager; workers receive a
/// clone and use it for blocking I/O. The handle remembers the link
/// parameters it was opened with so a received frame can be attributed to
/// the bitrate it was decoded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSocket {
    pub socket: SocketId,
    pub channel: u32,
    pub bitrate: u32,
    pub mode: LinkMode,
}

impl BusSocket {
    pub fn can_transmit(&self) -> bool {
        self.mode == LinkMode::Normal
    }
}

/// Blocking primitives of the vehicle bus driver
///
/// Every call may fail. Link configuration calls (`set_bitrate`,
/// `set_mode`, `apply_filters`, `apply_flow_controls`) only take effect while
/// the link is down. `send` and `receive` block the calling worker thread; a
/// blocked call must return an error promptly once its socket is closed or
/// the link is brought down from another thread.
pub trait HardwareTransport: Send + Sync {
    /// Interface this transport drives (e.g., "can0")
    fn interface(&self) -> &str;

    /// Whether the hardware variant carries the given bus type
    fn supports(&self, bus: BusKind) -> bool;

    fn link_up(&self) -> Result<(), TransportError>;

    fn link_down(&self) -> Result<(), TransportError>;

    fn set_bitrate(&self, bitrate: u32) -> Result<(), TransportError>;

    fn set_mode(&self, mode: LinkMode) -> Result<(), TransportError>;

    fn apply_filters(&self, filters: &[HardwareFilter]) -> Result<(), TransportError>;

    /// Install flow-control records, unmodified and in order
    fn apply_flow_controls(&self, records: &[FlowControlRecord]) -> Result<(), TransportError>;

    fn open(&self) -> Result<SocketId, TransportError>;

    /// Bind an open socket, returning the channel index
    fn bind(&self, socket: SocketId) -> Result<u32, TransportError>;

    fn close(&self, socket: SocketId) -> Result<(), TransportError>;

    /// Send one frame, blocking until the driver accepts it
    fn send(&self, socket: &BusSocket, bus: BusKind, frame: &Frame) -> Result<(), TransportError>;

    /// Receive one frame, blocking until one arrives or the link goes away
    fn receive(&self, socket: &BusSocket, bus: BusKind) -> Result<Frame, TransportError>;
}

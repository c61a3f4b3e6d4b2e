//! Events delivered to external consumers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Periodic readiness summary of all buses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStatus {
    pub can_rx_ready: bool,
    pub can_tx_ready: bool,
    /// Bitrate of the current link, 0 when no link is set up
    pub can_bitrate: u32,
    pub j1708_rx_ready: bool,
    pub j1708_tx_ready: bool,
}

/// Broadcast event taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// A CAN frame was received while the bitrate is confirmed
    CanFrameReceived {
        timestamp: DateTime<Utc>,
        id: u32,
        #[serde(with = "super::hex_bytes")]
        data: Vec<u8>,
    },
    /// A J1708 message was received
    J1708FrameReceived {
        timestamp: DateTime<Utc>,
        priority: u8,
        id: u32,
        #[serde(with = "super::hex_bytes")]
        data: Vec<u8>,
    },
    /// Periodic status
    Status {
        timestamp: DateTime<Utc>,
        #[serde(flatten)]
        status: BusStatus,
    },
}

//! Link configuration staged on the resource manager

use serde::{Deserialize, Serialize};

use super::filter::{FlowControlRecord, HardwareFilter};
use super::frame::FrameType;

/// Bitrate used when none is specified; also the first discovery candidate
pub const DEFAULT_BITRATE: u32 = 250_000;

/// Physical link mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkMode {
    /// Receive only; nothing is acknowledged or transmitted
    ListenOnly,
    /// Receive and transmit
    Normal,
}

impl LinkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListenOnly => "listen-only",
            Self::Normal => "normal",
        }
    }
}

/// Configuration applied at the next link setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusCharacteristics {
    pub listen_only: bool,
    pub bitrate: u32,
    #[serde(default)]
    pub filters: Vec<HardwareFilter>,
    #[serde(default)]
    pub flow_controls: Vec<FlowControlRecord>,
}

impl BusCharacteristics {
    pub fn new(
        listen_only: bool,
        bitrate: u32,
        filters: Vec<HardwareFilter>,
        flow_controls: Vec<FlowControlRecord>,
    ) -> Self {
        Self {
            listen_only,
            bitrate,
            filters,
            flow_controls,
        }
    }

    /// Listen-only at the default bitrate with filters that block all
    /// regular CAN traffic; used when only non-CAN consumers hold the link
    pub fn blocking_default() -> Self {
        Self {
            listen_only: true,
            bitrate: DEFAULT_BITRATE,
            filters: vec![
                HardwareFilter::new(0x8000_0000, 0x03FF_FFFF, FrameType::Extended),
                HardwareFilter::new(0, 0x7FF, FrameType::Standard),
            ],
            flow_controls: Vec::new(),
        }
    }

    pub fn mode(&self) -> LinkMode {
        if self.listen_only {
            LinkMode::ListenOnly
        } else {
            LinkMode::Normal
        }
    }
}

impl Default for BusCharacteristics {
    fn default() -> Self {
        Self::blocking_default()
    }
}

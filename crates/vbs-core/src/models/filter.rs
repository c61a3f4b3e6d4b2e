//! Receive-acceptance filters and driver-level flow-control records

use serde::{Deserialize, Serialize};

use super::frame::{Frame, FrameType, MAX_CAN_PAYLOAD};
use crate::error::{VbsError, VbsResult};

/// Receive-acceptance rule applied by the physical layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareFilter {
    pub id: u32,
    pub mask: u32,
    #[serde(rename = "type", default)]
    pub frame_type: FrameType,
}

impl HardwareFilter {
    pub fn new(id: u32, mask: u32, frame_type: FrameType) -> Self {
        Self {
            id,
            mask,
            frame_type,
        }
    }

    /// Filter accepting extended frames whose masked id equals `id & mask`
    pub fn extended(id: u32, mask: u32) -> Self {
        Self::new(id, mask, FrameType::Extended)
    }

    /// Whether a frame passes this filter
    pub fn matches(&self, frame: &Frame) -> bool {
        frame.frame_type() == self.frame_type && (frame.id() & self.mask) == (self.id & self.mask)
    }

    /// Pair id and mask lists into extended filters
    ///
    /// Fails when either list is empty or the lengths differ.
    pub fn combine(ids: &[u32], masks: &[u32]) -> VbsResult<Vec<Self>> {
        if ids.is_empty() || masks.is_empty() {
            return Err(VbsError::InvalidFilter("no CAN filters specified".to_string()));
        }
        if ids.len() != masks.len() {
            return Err(VbsError::InvalidFilter(format!(
                "{} filter ids but {} masks",
                ids.len(),
                masks.len()
            )));
        }
        Ok(ids
            .iter()
            .zip(masks)
            .map(|(&id, &mask)| Self::extended(id, mask))
            .collect())
    }
}

/// Static request/response pair answered by the hardware layer without
/// application involvement
///
/// Records are passed to the driver unmodified and in their original order;
/// duplicate search ids are not merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowControlRecord {
    pub search_id: u32,
    pub response_id: u32,
    #[serde(with = "super::hex_bytes")]
    pub data: Vec<u8>,
    #[serde(rename = "type", default)]
    pub message_type: FrameType,
}

impl FlowControlRecord {
    pub fn new(
        search_id: u32,
        response_id: u32,
        data: impl Into<Vec<u8>>,
        message_type: FrameType,
    ) -> VbsResult<Self> {
        let data = data.into();
        if data.len() > MAX_CAN_PAYLOAD {
            return Err(VbsError::InvalidFilter(format!(
                "flow control 0x{:X} response of {} bytes exceeds {}",
                search_id,
                data.len(),
                MAX_CAN_PAYLOAD
            )));
        }
        Ok(Self {
            search_id,
            response_id,
            data,
            message_type,
        })
    }

    /// Whether an inbound frame triggers this record
    pub fn triggers_on(&self, frame: &Frame) -> bool {
        frame.frame_type() == self.message_type && frame.id() == self.search_id
    }

    /// The canned response frame
    pub fn response(&self) -> VbsResult<Frame> {
        Frame::new(self.response_id, self.data.clone(), self.message_type)
    }
}

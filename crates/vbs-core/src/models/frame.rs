//! Bus frame model

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{VbsError, VbsResult};

/// Largest payload carried by a classic CAN frame
pub const MAX_CAN_PAYLOAD: usize = 8;

/// Largest payload carried by a J1708 message (MID excluded)
pub const MAX_J1708_PAYLOAD: usize = 21;

/// Highest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Highest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// CAN identifier format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    /// 11-bit identifier
    Standard,
    /// 29-bit identifier
    #[default]
    Extended,
}

impl FrameType {
    /// Convert the numeric type code used in port configuration (0 = standard, 1 = extended)
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Standard),
            1 => Some(Self::Extended),
            _ => None,
        }
    }

    /// Numeric type code, inverse of [`FrameType::from_code`]
    pub fn code(self) -> u8 {
        match self {
            Self::Standard => 0,
            Self::Extended => 1,
        }
    }

    fn max_id(self) -> u32 {
        match self {
            Self::Standard => MAX_STANDARD_ID,
            Self::Extended => MAX_EXTENDED_ID,
        }
    }
}

/// A single frame moved between the hardware and the in-memory queues
///
/// Frames are immutable once constructed. CAN frames carry no priority;
/// J1708 messages carry their priority and use the id field for the MID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    id: u32,
    #[serde(with = "super::hex_bytes")]
    data: Vec<u8>,
    frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
}

impl Frame {
    /// Create a CAN frame, validating the id range and payload length
    pub fn new(id: u32, data: impl Into<Vec<u8>>, frame_type: FrameType) -> VbsResult<Self> {
        let data = data.into();
        if id > frame_type.max_id() {
            return Err(VbsError::InvalidFrame(format!(
                "id 0x{:X} exceeds {:?} range",
                id, frame_type
            )));
        }
        if data.len() > MAX_CAN_PAYLOAD {
            return Err(VbsError::InvalidFrame(format!(
                "payload of {} bytes exceeds {}",
                data.len(),
                MAX_CAN_PAYLOAD
            )));
        }
        Ok(Self {
            id,
            data,
            frame_type,
            priority: None,
        })
    }

    /// Create a 29-bit CAN frame
    pub fn extended(id: u32, data: impl Into<Vec<u8>>) -> VbsResult<Self> {
        Self::new(id, data, FrameType::Extended)
    }

    /// Create an 11-bit CAN frame
    pub fn standard(id: u32, data: impl Into<Vec<u8>>) -> VbsResult<Self> {
        Self::new(id, data, FrameType::Standard)
    }

    /// Create a J1708 message; `id` is the message identifier (MID)
    pub fn j1708(priority: u8, id: u32, data: impl Into<Vec<u8>>) -> VbsResult<Self> {
        let data = data.into();
        if id > 0xFF {
            return Err(VbsError::InvalidFrame(format!("J1708 MID 0x{:X} exceeds 0xFF", id)));
        }
        if data.len() > MAX_J1708_PAYLOAD {
            return Err(VbsError::InvalidFrame(format!(
                "J1708 payload of {} bytes exceeds {}",
                data.len(),
                MAX_J1708_PAYLOAD
            )));
        }
        Ok(Self {
            id,
            data,
            frame_type: FrameType::Standard,
            priority: Some(priority),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    pub fn is_extended(&self) -> bool {
        self.frame_type == FrameType::Extended
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame_type {
            FrameType::Extended => write!(f, "0x{:08X}", self.id)?,
            FrameType::Standard => write!(f, "0x{:03X}", self.id)?,
        }
        if let Some(priority) = self.priority {
            write!(f, " p{}", priority)?;
        }
        write!(f, " [{}] {}", self.data.len(), hex::encode_upper(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extended_frame() {
        let frame = Frame::extended(0x18FE_E000, [1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(frame.id(), 0x18FE_E000);
        assert_eq!(frame.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(frame.is_extended());
        assert_eq!(frame.priority(), None);
        assert_eq!(frame.to_string(), "0x18FEE000 [8] 0102030405060708");
    }

    #[test]
    fn test_rejects_long_payload() {
        assert!(Frame::extended(0x100, vec![0u8; 9]).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_id() {
        assert!(Frame::standard(0x800, vec![]).is_err());
        assert!(Frame::extended(0x2000_0000, vec![]).is_err());
    }

    #[test]
    fn test_j1708_frame() {
        let frame = Frame::j1708(3, 0x80, vec![0u8; 12]).unwrap();
        assert_eq!(frame.priority(), Some(3));
        assert_eq!(frame.to_string(), "0x080 p3 [12] 000000000000000000000000");
        assert!(Frame::j1708(3, 0x100, vec![]).is_err());
    }

    #[test]
    fn test_frame_type_codes() {
        assert_eq!(FrameType::from_code(0), Some(FrameType::Standard));
        assert_eq!(FrameType::from_code(1), Some(FrameType::Extended));
        assert_eq!(FrameType::from_code(2), None);
        assert_eq!(FrameType::Extended.code(), 1);
    }

    #[test]
    fn test_frame_serializes_hex_payload() {
        let frame = Frame::standard(0x123, vec![0xDE, 0xAD]).unwrap();
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["data"], "dead");
        assert_eq!(json["frame_type"], "standard");
        let back: Frame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }
}

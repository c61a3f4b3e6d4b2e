//! Parsing helpers for ids and payloads supplied as text

use crate::error::{VbsError, VbsResult};

/// Parse a CAN ID from string (supports hex with 0x prefix)
pub fn parse_can_id(s: &str) -> VbsResult<u32> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };

    u32::from_str_radix(digits, radix)
        .map_err(|e| VbsError::Config(format!("Invalid CAN ID '{}': {}", s, e)))
}

/// Parse a comma separated byte list such as `"0x10, 0x34, 86"`
pub fn parse_payload(s: &str) -> VbsResult<Vec<u8>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }

    s.split(',')
        .map(|part| {
            let value = parse_can_id(part)?;
            u8::try_from(value).map_err(|_| {
                VbsError::Config(format!("Payload byte '{}' out of range", part.trim()))
            })
        })
        .collect()
}

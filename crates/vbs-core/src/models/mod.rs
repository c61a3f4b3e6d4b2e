//! Shared data models for the vehicle bus service

mod bus;
mod characteristics;
mod event;
mod filter;
mod frame;

pub use bus::*;
pub use characteristics::*;
pub use event::*;
pub use filter::*;
pub use frame::*;

/// Serde helper encoding byte payloads as lowercase hex strings
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

//! vbs-core - Core types for the vehicle bus service
//!
//! This crate holds the data model shared by the bus runtime and the daemon:
//! frames, hardware filters, flow-control records, staged link
//! characteristics, and the events emitted to external consumers.

pub mod error;
pub mod models;
pub mod parse;

pub use error::{VbsError, VbsResult};
pub use models::*;
pub use parse::{parse_can_id, parse_payload};

//! Transport layer for the vehicle bus hardware
//!
//! This module provides the hardware transports the resource manager drives:
//! - SocketCAN transport for raw CAN (Linux only, `socketcan` feature)
//! - Mock transport for testing and for running without hardware
//!
//! # Example
//!
//! ```ignore
//! use vbs_bus::transport::create_transport;
//! use vbs_bus::config::TransportConfig;
//!
//! let transport = create_transport(&TransportConfig::Mock(Default::default()))?;
//! transport.link_down()?;
//! ```

mod adapter;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{BusSocket, HardwareTransport, SocketId};
pub use error::TransportError;

use std::sync::Arc;

use crate::config::TransportConfig;

/// Create a hardware transport based on configuration
pub fn create_transport(
    config: &TransportConfig,
) -> Result<Arc<dyn HardwareTransport>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let transport = socketcan::SocketCanTransport::new(cfg)?;
            Ok(Arc::new(transport))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::Mock(cfg) => {
            let transport = mock::MockTransport::new(cfg);
            Ok(Arc::new(transport))
        }
    }
}

//! Logical bus identities

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VbsError;

/// A logical consumer of the shared transceiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusKind {
    #[serde(rename = "CAN")]
    Can,
    #[serde(rename = "J1708")]
    J1708,
}

impl BusKind {
    /// Consumer name registered with the resource manager
    pub fn name(self) -> &'static str {
        match self {
            Self::Can => "CAN",
            Self::J1708 => "J1708",
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BusKind {
    type Err = VbsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CAN" => Ok(Self::Can),
            "J1708" => Ok(Self::J1708),
            other => Err(VbsError::Config(format!("Unknown bus '{}'", other))),
        }
    }
}

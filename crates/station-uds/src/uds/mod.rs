//! UDS (Unified Diagnostic Services) protocol layer
//!
//! Request building and response interpretation for the three services the
//! station uses: DiagnosticSessionControl, TesterPresent and
//! ReadDataByIdentifier.

pub mod did;
mod nrc;
mod services;

pub use did::{DataIdentifier, Reading, Vin, Voltage, BATTERY_VOLTAGE, VIN};
pub use nrc::NegativeResponseCode;
pub use services::{Exchange, UdsClient, UdsOperation, UdsRequest, UdsResponse};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Added to a request SID to form its positive response SID
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

    /// Positive response SID for a request SID
    pub const fn positive(service_id: u8) -> u8 {
        service_id + POSITIVE_RESPONSE_OFFSET
    }
}

/// Data Identifiers read by the station
pub mod standard_did {
    /// Vehicle Identification Number (ISO 14229-1 Annex C)
    pub const VIN: u16 = 0xF190;
    /// Battery voltage, 1 byte at 0.1 V/bit
    pub const BATTERY_VOLTAGE: u16 = 0xE142;
}

/// DiagnosticSessionControl (0x10) sub-functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Default,
    Programming,
    Extended,
}

impl SessionType {
    pub fn sub_function(self) -> u8 {
        match self {
            Self::Default => 0x01,
            Self::Programming => 0x02,
            Self::Extended => 0x03,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Programming => "programming",
            Self::Extended => "extended",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" | "01" | "0x01" => Ok(Self::Default),
            "programming" | "02" | "0x02" => Ok(Self::Programming),
            "extended" | "03" | "0x03" => Ok(Self::Extended),
            other => Err(format!(
                "unknown session '{}' (expected default, programming or extended)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_response_ids() {
        assert_eq!(service_id::positive(service_id::DIAGNOSTIC_SESSION_CONTROL), 0x50);
        assert_eq!(service_id::positive(service_id::READ_DATA_BY_ID), 0x62);
        assert_eq!(service_id::positive(service_id::TESTER_PRESENT), 0x7E);
    }

    #[test]
    fn test_session_type_parse() {
        assert_eq!("Extended".parse::<SessionType>().unwrap(), SessionType::Extended);
        assert_eq!("0x02".parse::<SessionType>().unwrap(), SessionType::Programming);
        assert_eq!(SessionType::Default.sub_function(), 0x01);
        assert!("eol".parse::<SessionType>().is_err());
    }
}

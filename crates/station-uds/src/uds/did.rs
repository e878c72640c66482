//! Data identifiers and their decoders
//!
//! A [`DataIdentifier`] couples a DID with the function that turns the bytes
//! after the `62 <DID>` echo into a typed value. Reads of different DIDs share
//! one engine and differ only in this value.

use std::fmt;

use serde::Serialize;

use super::{standard_did, Exchange, UdsOperation};
use crate::error::{DiagnosticError, DiagnosticResult};

/// Length of a VIN in bytes
pub const VIN_LEN: usize = 17;

/// A readable DID with its decoder
pub struct DataIdentifier<T> {
    pub did: u16,
    pub name: &'static str,
    decoder: fn(&[u8]) -> DiagnosticResult<T>,
}

impl<T> DataIdentifier<T> {
    pub const fn new(did: u16, name: &'static str, decoder: fn(&[u8]) -> DiagnosticResult<T>) -> Self {
        Self { did, name, decoder }
    }

    pub fn decode(&self, data: &[u8]) -> DiagnosticResult<T> {
        (self.decoder)(data)
    }

    pub fn operation(&self) -> UdsOperation {
        UdsOperation::ReadDataByIdentifier(self.did)
    }
}

impl<T> Clone for DataIdentifier<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DataIdentifier<T> {}

impl<T> fmt::Debug for DataIdentifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataIdentifier")
            .field("did", &format_args!("0x{:04X}", self.did))
            .field("name", &self.name)
            .finish()
    }
}

impl<T> fmt::Display for DataIdentifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.name, self.did)
    }
}

/// A decoded DID value together with the exchange it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Reading<T> {
    pub value: T,
    pub exchange: Exchange,
}

/// Vehicle Identification Number (DID 0xF190)
pub const VIN: DataIdentifier<Vin> = DataIdentifier::new(standard_did::VIN, "VIN", Vin::decode);

/// Battery voltage (DID 0xE142)
pub const BATTERY_VOLTAGE: DataIdentifier<Voltage> =
    DataIdentifier::new(standard_did::BATTERY_VOLTAGE, "Battery Voltage", Voltage::decode);

/// Validated 17-character VIN
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Vin(String);

impl Vin {
    /// Decode the raw DID bytes
    ///
    /// The VIN must be exactly 17 printable ASCII letters or digits. Letters
    /// are upper-cased; `I`, `O` and `Q` are never valid.
    pub fn decode(data: &[u8]) -> DiagnosticResult<Self> {
        if data.len() != VIN_LEN {
            return Err(DiagnosticError::invalid_data(format!(
                "VIN must be {} bytes, got {}",
                VIN_LEN,
                data.len()
            )));
        }

        let mut vin = String::with_capacity(VIN_LEN);
        for (i, &byte) in data.iter().enumerate() {
            let c = char::from(byte).to_ascii_uppercase();
            if !c.is_ascii_alphanumeric() {
                return Err(DiagnosticError::invalid_data(format!(
                    "VIN byte {} is 0x{:02X}, not a letter or digit",
                    i, byte
                )));
            }
            if matches!(c, 'I' | 'O' | 'Q') {
                return Err(DiagnosticError::invalid_data(format!(
                    "VIN contains forbidden letter '{}' at position {}",
                    c,
                    i + 1
                )));
            }
            vin.push(c);
        }
        Ok(Self(vin))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Vin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Battery voltage in volts
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Voltage {
    pub volts: f64,
}

impl Voltage {
    /// Volts per bit of the raw value
    pub const RESOLUTION: f64 = 0.1;

    /// Decode the first data byte at 0.1 V/bit, rounded to 0.01 V
    pub fn decode(data: &[u8]) -> DiagnosticResult<Self> {
        let raw = *data
            .first()
            .ok_or_else(|| DiagnosticError::invalid_data("battery voltage response carries no data"))?;
        let volts = (f64::from(raw) * Self::RESOLUTION * 100.0).round() / 100.0;
        Ok(Self { volts })
    }
}

impl fmt::Display for Voltage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} V", self.volts)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_voltage_decodes_tenths() {
        let voltage = BATTERY_VOLTAGE.decode(&[0x96]).unwrap();
        assert_eq!(voltage.volts, 15.0);
        assert_eq!(voltage.to_string(), "15.0 V");

        assert_eq!(Voltage::decode(&[0x7B, 0xFF]).unwrap().volts, 12.3);
        assert_eq!(Voltage::decode(&[0x00]).unwrap().volts, 0.0);
    }

    #[test]
    fn test_voltage_without_data_is_invalid() {
        assert!(matches!(Voltage::decode(&[]), Err(DiagnosticError::InvalidData(_))));
    }

    #[test]
    fn test_vin_exact_string() {
        let vin = VIN.decode(b"WVWZZZ1JZXW000001").unwrap();
        assert_eq!(vin.as_str(), "WVWZZZ1JZXW000001");
    }

    #[test]
    fn test_vin_is_upper_cased() {
        let vin = Vin::decode(b"wvwzzz1jzxw000001").unwrap();
        assert_eq!(vin.to_string(), "WVWZZZ1JZXW000001");
    }

    #[test]
    fn test_vin_wrong_length_is_invalid() {
        assert!(matches!(Vin::decode(b"WVWZZZ1JZXW00000"), Err(DiagnosticError::InvalidData(_))));
        assert!(matches!(Vin::decode(b"WVWZZZ1JZXW0000012"), Err(DiagnosticError::InvalidData(_))));
        assert!(Vin::decode(b"").is_err());
    }

    #[test]
    fn test_vin_forbidden_letters() {
        for bad in [b"WVWZZZ1JZXI000001", b"WVWZZZ1JZXO000001", b"WVWZZZ1JZXQ000001", b"wvwzzz1jzxq000001"] {
            assert!(matches!(Vin::decode(bad), Err(DiagnosticError::InvalidData(_))));
        }
    }

    #[test]
    fn test_vin_rejects_non_alphanumeric() {
        assert!(Vin::decode(b"WVWZZZ1JZXW00000 ").is_err());
        assert!(Vin::decode(&[0u8; VIN_LEN]).is_err());
    }

    #[test]
    fn test_data_identifier_operation() {
        assert_eq!(VIN.operation(), UdsOperation::ReadDataByIdentifier(0xF190));
        assert_eq!(BATTERY_VOLTAGE.to_string(), "Battery Voltage (0xE142)");
    }
}

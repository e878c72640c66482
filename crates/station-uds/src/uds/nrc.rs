//! UDS Negative Response Codes (NRC)

use std::fmt;

use serde::{Serialize, Serializer};

macro_rules! negative_response_codes {
    ($($name:ident = $value:literal => $text:literal,)+) => {
        /// UDS Negative Response Codes (ISO 14229-1 Annex A)
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NegativeResponseCode {
            $($name,)+
            /// Reserved or manufacturer-specific NRC
            Unknown(u8),
        }

        impl From<u8> for NegativeResponseCode {
            fn from(value: u8) -> Self {
                match value {
                    $($value => Self::$name,)+
                    other => Self::Unknown(other),
                }
            }
        }

        impl From<NegativeResponseCode> for u8 {
            fn from(nrc: NegativeResponseCode) -> Self {
                match nrc {
                    $(NegativeResponseCode::$name => $value,)+
                    NegativeResponseCode::Unknown(v) => v,
                }
            }
        }

        impl NegativeResponseCode {
            /// Short human-readable meaning of the code
            pub fn description(&self) -> &'static str {
                match self {
                    $(Self::$name => $text,)+
                    Self::Unknown(_) => "reserved or manufacturer specific",
                }
            }
        }

        impl fmt::Display for NegativeResponseCode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$name => f.write_str(stringify!($name)),)+
                    Self::Unknown(v) => write!(f, "Unknown(0x{:02X})", v),
                }
            }
        }
    };
}

negative_response_codes! {
    GeneralReject = 0x10 => "general reject",
    ServiceNotSupported = 0x11 => "service not supported",
    SubFunctionNotSupported = 0x12 => "sub-function not supported",
    IncorrectMessageLengthOrFormat = 0x13 => "incorrect message length or invalid format",
    ResponseTooLong = 0x14 => "response too long",
    BusyRepeatRequest = 0x21 => "busy, repeat request",
    ConditionsNotCorrect = 0x22 => "conditions not correct",
    RequestSequenceError = 0x24 => "request sequence error",
    NoResponseFromSubnet = 0x25 => "no response from subnet component",
    FailurePreventsExecution = 0x26 => "failure prevents execution of requested action",
    RequestOutOfRange = 0x31 => "request out of range",
    SecurityAccessDenied = 0x33 => "security access denied",
    InvalidKey = 0x35 => "invalid key",
    ExceededNumberOfAttempts = 0x36 => "exceeded number of attempts",
    RequiredTimeDelayNotExpired = 0x37 => "required time delay not expired",
    UploadDownloadNotAccepted = 0x70 => "upload/download not accepted",
    TransferDataSuspended = 0x71 => "transfer data suspended",
    GeneralProgrammingFailure = 0x72 => "general programming failure",
    WrongBlockSequenceCounter = 0x73 => "wrong block sequence counter",
    ResponsePending = 0x78 => "request correctly received, response pending",
    SubFunctionNotSupportedInActiveSession = 0x7E => "sub-function not supported in active session",
    ServiceNotSupportedInActiveSession = 0x7F => "service not supported in active session",
    VoltageTooHigh = 0x92 => "voltage too high",
    VoltageTooLow = 0x93 => "voltage too low",
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

/// Serialized as the raw code byte
impl Serialize for NegativeResponseCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8((*self).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_round_trip_through_u8() {
        for raw in [0x10u8, 0x21, 0x31, 0x78, 0x7F, 0x93] {
            let nrc = NegativeResponseCode::from(raw);
            assert!(!matches!(nrc, NegativeResponseCode::Unknown(_)));
            assert_eq!(u8::from(nrc), raw);
        }
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let nrc = NegativeResponseCode::from(0xF3);
        assert_eq!(nrc, NegativeResponseCode::Unknown(0xF3));
        assert_eq!(u8::from(nrc), 0xF3);
        assert_eq!(nrc.to_string(), "Unknown(0xF3)");
    }

    #[test]
    fn test_display_and_hex() {
        let nrc = NegativeResponseCode::ResponsePending;
        assert_eq!(format!("{} (0x{:02X})", nrc, nrc), "ResponsePending (0x78)");
    }
}

//! Diagnostic outcome types
//!
//! Every engine operation returns a [`DiagnosticResult`]. Nothing below the
//! orchestration layer panics or escalates; the caller decides what a
//! failure means.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;
use crate::uds::NegativeResponseCode;

/// Outcome of one diagnostic operation
pub type DiagnosticResult<T> = Result<T, DiagnosticError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DiagnosticError {
    /// No (complete) response before the deadline
    #[error("Timeout waiting for ECU response")]
    Timeout,

    /// ECU rejected the request
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    /// PCI, length or sequence violation in the ISO-TP stream, or an
    /// unexpected UDS response layout
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Adapter-level I/O error
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// Well-formed positive response carrying an invalid value
    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl DiagnosticError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame(reason.into())
    }

    pub fn invalid_data(reason: impl Into<String>) -> Self {
        Self::InvalidData(reason.into())
    }

    /// Whether another attempt of the same request may succeed
    ///
    /// Timeouts and corrupted frames are transient. Negative responses are
    /// final except `busyRepeatRequest`; `responsePending` is treated like any
    /// other NRC.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::MalformedFrame(_) => true,
            Self::NegativeResponse { nrc, .. } => *nrc == NegativeResponseCode::BusyRepeatRequest,
            Self::TransportFailure(_)
            | Self::InvalidData(_)
            | Self::Cancelled
            | Self::Configuration(_) => false,
        }
    }

    /// Negative response code, if the ECU rejected the request
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }

    /// Stable lowercase tag for reports (`timeout`, `negative_response`, ...)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::NegativeResponse { .. } => "negative_response",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::TransportFailure(_) => "transport_failure",
            Self::InvalidData(_) => "invalid_data",
            Self::Cancelled => "cancelled",
            Self::Configuration(_) => "configuration",
        }
    }
}

impl From<ConfigError> for DiagnosticError {
    fn from(err: ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(DiagnosticError::Timeout.is_retryable());
        assert!(DiagnosticError::malformed("bad sequence").is_retryable());
        assert!(!DiagnosticError::TransportFailure(TransportError::ConnectionClosed).is_retryable());
        assert!(!DiagnosticError::Cancelled.is_retryable());
    }

    #[test]
    fn test_only_busy_nrc_is_retryable() {
        let busy = DiagnosticError::NegativeResponse {
            service_id: 0x22,
            nrc: NegativeResponseCode::BusyRepeatRequest,
        };
        let pending = DiagnosticError::NegativeResponse {
            service_id: 0x22,
            nrc: NegativeResponseCode::ResponsePending,
        };
        let out_of_range = DiagnosticError::NegativeResponse {
            service_id: 0x22,
            nrc: NegativeResponseCode::RequestOutOfRange,
        };
        assert!(busy.is_retryable());
        assert!(!pending.is_retryable());
        assert!(!out_of_range.is_retryable());
    }

    #[test]
    fn test_negative_response_message() {
        let err = DiagnosticError::NegativeResponse {
            service_id: 0x3E,
            nrc: NegativeResponseCode::from(0x12),
        };
        assert_eq!(
            err.to_string(),
            "Negative response: SubFunctionNotSupported (0x12) for service 0x3E"
        );
        assert_eq!(err.kind(), "negative_response");
    }
}

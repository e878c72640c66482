//! Transport layer for raw CAN frames
//!
//! This module provides the frame transports the ISO-TP layer runs on:
//! - SocketCAN adapter for raw CAN frames (Linux only)
//! - Virtual ECU for tests and bench runs without hardware
//!
//! A transport is wrapped in a [`Bus`], which enforces that exactly one
//! exchange (or one stream) talks on the request/response ID pair at a time.
//!
//! # Example
//!
//! ```ignore
//! use station_uds::config::CanConfig;
//! use station_uds::transport::{open, Bus};
//!
//! let bus = Bus::new(open(&CanConfig::default()).await?);
//! let mut lease = bus.acquire(&ctx).await?;
//! ```

mod adapter;
mod bus;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{Frame, Transport, MAX_FRAME_LEN, MAX_STANDARD_ID};
pub use bus::{Bus, BusLease};
pub use error::TransportError;
pub use mock::{VirtualEcu, VirtualEcuHandle};

use crate::config::{CanBackend, CanConfig, ConfigError};
use crate::error::DiagnosticResult;

/// Request/response arbitration ID pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressInfo {
    /// Transmit ID (tester -> ECU)
    pub tx_id: u16,
    /// Receive ID (ECU -> tester)
    pub rx_id: u16,
}

/// Open the transport described by `config`
///
/// Configuration problems (bad channel, bitrate, IDs or an unsupported
/// backend) fail immediately as [`DiagnosticError::Configuration`];
/// adapter errors surface as [`DiagnosticError::TransportFailure`].
///
/// [`DiagnosticError::Configuration`]: crate::error::DiagnosticError::Configuration
/// [`DiagnosticError::TransportFailure`]: crate::error::DiagnosticError::TransportFailure
pub async fn open(config: &CanConfig) -> DiagnosticResult<Box<dyn Transport>> {
    config.validate()?;
    let address = config.address_info()?;

    match config.resolved_backend()? {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        CanBackend::SocketCan => {
            let adapter = socketcan::SocketCanTransport::open(&config.channel, config.bitrate)?;
            Ok(Box::new(adapter))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        CanBackend::SocketCan => Err(ConfigError::UnsupportedBackend(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )
        .into()),
        CanBackend::Pcan => Err(ConfigError::UnsupportedBackend(format!(
            "pcan ({}): no PCAN driver in this build, use a SocketCAN channel",
            config.channel
        ))
        .into()),
        CanBackend::Virtual => Ok(Box::new(VirtualEcu::new(address))),
        CanBackend::Auto => Err(ConfigError::UnsupportedBackend(config.channel.clone()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticError;

    #[tokio::test]
    async fn test_open_virtual_backend() {
        let config = CanConfig {
            channel: "virtual".to_string(),
            ..Default::default()
        };
        let transport = open(&config).await.unwrap();
        assert!(transport.describe().starts_with("virtual"));
    }

    #[tokio::test]
    async fn test_open_pcan_is_configuration_error() {
        let err = open(&CanConfig::default()).await.err().unwrap();
        assert!(matches!(err, DiagnosticError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_bitrate_before_touching_adapter() {
        let config = CanConfig {
            channel: "virtual".to_string(),
            bitrate: 0,
            ..Default::default()
        };
        let err = open(&config).await.err().unwrap();
        assert!(matches!(err, DiagnosticError::Configuration(_)));
    }
}

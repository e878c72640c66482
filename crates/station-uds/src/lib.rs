//! station-uds - UDS over ISO-TP diagnostic engine for the test station
//!
//! This crate talks to ECUs over classic CAN: it segments and reassembles
//! ISO-TP messages, speaks the UDS services the station needs, retries
//! transient failures and samples values continuously.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  procedures / StreamPump                     │
//! │  read_vin, read_battery_voltage, check_ecus, streams         │
//! │                          │                                   │
//! │                  ┌───────┴────────┐                          │
//! │                  │ RetryScheduler │                          │
//! │                  └───────┬────────┘                          │
//! │                    ┌─────┴─────┐                             │
//! │                    │ UdsClient │                             │
//! │                    └─────┬─────┘                             │
//! │                   ┌──────┴───────┐                           │
//! │                   │ IsoTpSession │                           │
//! │                   └──────┬───────┘                           │
//! │              ┌───────────┴────────────┐                      │
//! │              │ Bus (exclusive lease)  │                      │
//! │              │ Transport: SocketCAN / │                      │
//! │              │ VirtualEcu             │                      │
//! │              └────────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every operation takes a [`DiagContext`] (event sink plus cancellation
//! token) and returns a [`DiagnosticResult`].

pub mod config;
pub mod context;
pub mod error;
pub mod isotp;
pub mod procedures;
pub mod retry;
pub mod stream;
pub mod transport;
pub mod uds;

pub use config::{ConfigError, StationConfig};
pub use context::{CancellationToken, DiagContext, EventSink, TracingSink};
pub use error::{DiagnosticError, DiagnosticResult};
pub use procedures::Settings;
pub use retry::RetryScheduler;
pub use stream::{PumpState, StreamEvent, StreamHandle, StreamPump};
pub use transport::{open, Bus, Frame, Transport, TransportError, VirtualEcu};
pub use uds::{DataIdentifier, NegativeResponseCode, SessionType, UdsClient};

// Raw CAN adapter (Linux + socketcan feature only)
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use transport::socketcan::SocketCanTransport;

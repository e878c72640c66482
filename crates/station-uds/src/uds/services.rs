//! UDS request/response exchange on top of ISO-TP

use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use super::{service_id, NegativeResponseCode};
use crate::config::TimingConfig;
use crate::context::{DiagContext, Level};
use crate::error::{DiagnosticError, DiagnosticResult};
use crate::isotp::IsoTpSession;
use crate::transport::{AddressInfo, Transport};

/// One UDS request: service ID, optional sub-function/DID bytes, payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsRequest {
    pub service_id: u8,
    pub parameter: Vec<u8>,
    pub payload: Vec<u8>,
}

impl UdsRequest {
    pub fn new(service_id: u8, parameter: &[u8]) -> Self {
        Self {
            service_id,
            parameter: parameter.to_vec(),
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.parameter.len() + self.payload.len());
        bytes.push(self.service_id);
        bytes.extend_from_slice(&self.parameter);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Interpreted UDS response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// `service_id` is the request SID the response answers
    Positive { service_id: u8, payload: Vec<u8> },
    Negative {
        service_id: u8,
        nrc: NegativeResponseCode,
    },
}

impl UdsResponse {
    /// Classify a complete response payload
    ///
    /// Anything starting with 0x7F is a negative response, whatever service
    /// it echoes. A negative response shorter than 3 bytes is malformed.
    pub fn parse(bytes: &[u8]) -> DiagnosticResult<Self> {
        match bytes {
            [] => Err(DiagnosticError::malformed("empty UDS response")),
            [service_id::NEGATIVE_RESPONSE, sid, nrc, ..] => Ok(Self::Negative {
                service_id: *sid,
                nrc: NegativeResponseCode::from(*nrc),
            }),
            [service_id::NEGATIVE_RESPONSE, ..] => Err(DiagnosticError::malformed(format!(
                "negative response too short ({} bytes)",
                bytes.len()
            ))),
            [sid, rest @ ..] if *sid >= service_id::POSITIVE_RESPONSE_OFFSET => Ok(Self::Positive {
                service_id: sid - service_id::POSITIVE_RESPONSE_OFFSET,
                payload: rest.to_vec(),
            }),
            [sid, ..] => Err(DiagnosticError::malformed(format!(
                "0x{:02X} is not a response service ID",
                sid
            ))),
        }
    }
}

/// The operations the client supports, as data
///
/// Retry and streaming run operations by value so one engine serves every
/// read instead of a copy per procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdsOperation {
    SessionControl(u8),
    TesterPresent,
    ReadDataByIdentifier(u16),
}

impl UdsOperation {
    pub fn request(&self) -> UdsRequest {
        match *self {
            Self::SessionControl(sub_function) => {
                UdsRequest::new(service_id::DIAGNOSTIC_SESSION_CONTROL, &[sub_function])
            }
            // Suppress-positive-response is not used; the station always wants the echo.
            Self::TesterPresent => UdsRequest::new(service_id::TESTER_PRESENT, &[0x00]),
            Self::ReadDataByIdentifier(did) => {
                UdsRequest::new(service_id::READ_DATA_BY_ID, &did.to_be_bytes())
            }
        }
    }

    pub fn service_id(&self) -> u8 {
        match self {
            Self::SessionControl(_) => service_id::DIAGNOSTIC_SESSION_CONTROL,
            Self::TesterPresent => service_id::TESTER_PRESENT,
            Self::ReadDataByIdentifier(_) => service_id::READ_DATA_BY_ID,
        }
    }

    /// Check the echo of a positive response and return the data after it
    fn accept(&self, payload: &[u8]) -> DiagnosticResult<Vec<u8>> {
        match *self {
            Self::SessionControl(sub_function) => match payload {
                [echo, params @ ..] if *echo & 0x7F == sub_function => Ok(params.to_vec()),
                [echo, ..] => Err(DiagnosticError::malformed(format!(
                    "session control echoed sub-function 0x{:02X}, requested 0x{:02X}",
                    echo, sub_function
                ))),
                [] => Err(DiagnosticError::malformed(
                    "session control response without sub-function",
                )),
            },
            Self::TesterPresent => match payload {
                [] => Ok(Vec::new()),
                [echo, ..] if *echo & 0x7F == 0x00 => Ok(Vec::new()),
                [echo, ..] => Err(DiagnosticError::malformed(format!(
                    "tester present echoed sub-function 0x{:02X}",
                    echo
                ))),
            },
            Self::ReadDataByIdentifier(did) => match payload {
                [hi, lo, data @ ..] if u16::from_be_bytes([*hi, *lo]) == did => Ok(data.to_vec()),
                [hi, lo, ..] => Err(DiagnosticError::malformed(format!(
                    "response for DID 0x{:04X}, requested 0x{:04X}",
                    u16::from_be_bytes([*hi, *lo]),
                    did
                ))),
                _ => Err(DiagnosticError::malformed(format!(
                    "read response for DID 0x{:04X} too short",
                    did
                ))),
            },
        }
    }
}

impl fmt::Display for UdsOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionControl(sub) => write!(f, "DiagnosticSessionControl 0x{:02X}", sub),
            Self::TesterPresent => f.write_str("TesterPresent"),
            Self::ReadDataByIdentifier(did) => write!(f, "ReadDataByIdentifier 0x{:04X}", did),
        }
    }
}

/// A successful exchange: raw UDS payloads plus the data after the echo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub data: Vec<u8>,
}

/// UDS client for one ECU address
///
/// The client holds no connection. Each call borrows the transport for the
/// length of one exchange, which is what keeps exchanges strictly sequential.
#[derive(Debug, Clone)]
pub struct UdsClient {
    address: AddressInfo,
    timing: TimingConfig,
}

impl UdsClient {
    pub fn new(address: AddressInfo, timing: TimingConfig) -> Self {
        Self { address, timing }
    }

    /// Same client with a different overall response timeout
    pub fn with_response_timeout(&self, timeout: Duration) -> Self {
        Self {
            address: self.address,
            timing: self.timing.with_response_timeout(timeout),
        }
    }

    pub fn address(&self) -> AddressInfo {
        self.address
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Diagnostic Session Control (0x10)
    pub async fn session_control(
        &self,
        transport: &mut dyn Transport,
        sub_function: u8,
        ctx: &DiagContext,
    ) -> DiagnosticResult<()> {
        self.execute(transport, UdsOperation::SessionControl(sub_function), ctx)
            .await
            .map(|_| ())
    }

    /// Tester Present (0x3E)
    pub async fn tester_present(
        &self,
        transport: &mut dyn Transport,
        ctx: &DiagContext,
    ) -> DiagnosticResult<()> {
        self.execute(transport, UdsOperation::TesterPresent, ctx)
            .await
            .map(|_| ())
    }

    /// Read Data By Identifier (0x22), returning the data after the DID echo
    pub async fn read_data_by_identifier(
        &self,
        transport: &mut dyn Transport,
        did: u16,
        ctx: &DiagContext,
    ) -> DiagnosticResult<Vec<u8>> {
        self.execute(transport, UdsOperation::ReadDataByIdentifier(did), ctx)
            .await
            .map(|exchange| exchange.data)
    }

    /// Run one operation: send the request, wait for and interpret the response
    pub async fn execute(
        &self,
        transport: &mut dyn Transport,
        operation: UdsOperation,
        ctx: &DiagContext,
    ) -> DiagnosticResult<Exchange> {
        ctx.checkpoint()?;
        let request = operation.request().encode();
        debug!(operation = %operation, request = %hex::encode_upper(&request), "UDS request");

        let mut session = IsoTpSession::new(transport, self.address, &self.timing, ctx);
        let response = session.request(&request).await?;

        match UdsResponse::parse(&response)? {
            UdsResponse::Negative { service_id, nrc } => {
                if service_id != operation.service_id() {
                    warn!(
                        echoed = service_id,
                        requested = operation.service_id(),
                        "Negative response echoes a different service"
                    );
                }
                ctx.log(
                    Level::WARN,
                    &format!("{} rejected: {} (0x{:02X})", operation, nrc, nrc),
                );
                Err(DiagnosticError::NegativeResponse { service_id, nrc })
            }
            UdsResponse::Positive {
                service_id,
                payload,
            } => {
                if service_id != operation.service_id() {
                    return Err(DiagnosticError::malformed(format!(
                        "positive response 0x{:02X} to service 0x{:02X}",
                        service_id::positive(service_id),
                        operation.service_id()
                    )));
                }
                let data = operation.accept(&payload)?;
                Ok(Exchange {
                    request,
                    response,
                    data,
                })
            }
        }
    }
}

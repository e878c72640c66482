//! ISO-TP (ISO 15765-2) segmentation over classic CAN
//!
//! The codec in this module is pure: it turns payloads into frame data and
//! frame data back into payloads. [`IsoTpSession`] drives it over a
//! [`Transport`](crate::transport::Transport) with deadlines and flow control.
//!
//! Frame layouts (byte 0 high nibble is the PCI type):
//!
//! ```text
//! SF  0L dd dd dd dd dd dd dd      L = payload length 1..7
//! FF  1H LL dd dd dd dd dd dd      HLL = total length 8..4095
//! CF  2N dd dd dd dd dd dd dd      N = sequence number 1..15, then 1 again
//! FC  3S BS ST 00 00 00 00 00      S = 0 continue, 1 wait, 2 overflow
//! ```

mod session;

use std::fmt;
use std::time::Duration;

pub use session::IsoTpSession;

use crate::error::{DiagnosticError, DiagnosticResult};

/// Largest payload that fits a Single Frame
pub const SF_MAX_PAYLOAD: usize = 7;
/// Payload bytes carried by a First Frame
pub const FF_PAYLOAD: usize = 6;
/// Payload bytes carried by a full Consecutive Frame
pub const CF_PAYLOAD: usize = 7;
/// Largest message expressible in the 12-bit First Frame length
pub const MAX_MESSAGE_LEN: usize = 0x0FFF;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

/// PCI type from the high nibble of byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciType {
    Single,
    First,
    Consecutive,
    FlowControl,
}

impl PciType {
    pub fn from_byte(byte0: u8) -> Option<Self> {
        match byte0 >> 4 {
            PCI_SINGLE => Some(Self::Single),
            PCI_FIRST => Some(Self::First),
            PCI_CONSECUTIVE => Some(Self::Consecutive),
            PCI_FLOW_CONTROL => Some(Self::FlowControl),
            _ => None,
        }
    }
}

/// Consecutive Frame sequence counter
///
/// Starts at 1 after a First Frame and cycles 1..=15, wrapping back to 1;
/// 0 is never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNumber(u8);

impl SequenceNumber {
    pub const FIRST: Self = Self(1);

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Self {
        if self.0 >= 15 {
            Self(1)
        } else {
            Self(self.0 + 1)
        }
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Flow Control
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

/// Parameters of a Flow Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub status: FlowStatus,
    /// Consecutive Frames allowed before the next Flow Control (0 = all)
    pub block_size: u8,
    /// Minimum gap between Consecutive Frames (STmin)
    pub separation_time: Duration,
}

impl FlowControl {
    pub fn continue_to_send(block_size: u8, separation_time_ms: u8) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            separation_time: Duration::from_millis(u64::from(separation_time_ms.min(0x7F))),
        }
    }

    pub fn parse(data: &[u8]) -> DiagnosticResult<Self> {
        if data.len() < 3 {
            return Err(DiagnosticError::malformed(format!(
                "flow control frame too short ({} bytes)",
                data.len()
            )));
        }
        let status = match data[0] & 0x0F {
            0x0 => FlowStatus::ContinueToSend,
            0x1 => FlowStatus::Wait,
            0x2 => FlowStatus::Overflow,
            other => {
                return Err(DiagnosticError::malformed(format!(
                    "invalid flow status 0x{:X}",
                    other
                )))
            }
        };
        Ok(Self {
            status,
            block_size: data[1],
            separation_time: decode_st_min(data[2]),
        })
    }

    /// `[0x3S, BS, STmin, 0, 0, 0, 0, 0]`
    pub fn encode(&self) -> Vec<u8> {
        let status = match self.status {
            FlowStatus::ContinueToSend => 0x0,
            FlowStatus::Wait => 0x1,
            FlowStatus::Overflow => 0x2,
        };
        let st_min = self.separation_time.as_millis().min(0x7F) as u8;
        vec![(PCI_FLOW_CONTROL << 4) | status, self.block_size, st_min, 0, 0, 0, 0, 0]
    }
}

/// STmin: 0x00-0x7F milliseconds, 0xF1-0xF9 100-900 microseconds.
/// Reserved values are read as the maximum (127 ms).
fn decode_st_min(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(u64::from(raw)),
        0xF1..=0xF9 => Duration::from_micros(u64::from(raw - 0xF0) * 100),
        _ => Duration::from_millis(0x7F),
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// One decoded ISO-TP frame, borrowing the CAN data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoTpFrame<'a> {
    Single { payload: &'a [u8] },
    First { total_len: usize, payload: &'a [u8] },
    Consecutive { sequence: u8, payload: &'a [u8] },
    FlowControl(FlowControl),
}

impl<'a> IsoTpFrame<'a> {
    pub fn parse(data: &'a [u8]) -> DiagnosticResult<Self> {
        let byte0 = *data
            .first()
            .ok_or_else(|| DiagnosticError::malformed("empty CAN frame"))?;
        let pci = PciType::from_byte(byte0).ok_or_else(|| {
            DiagnosticError::malformed(format!("unknown PCI type 0x{:X}", byte0 >> 4))
        })?;

        match pci {
            PciType::Single => {
                let len = usize::from(byte0 & 0x0F);
                if len > SF_MAX_PAYLOAD {
                    return Err(DiagnosticError::malformed(format!(
                        "invalid single frame length {}",
                        len
                    )));
                }
                if data.len() < 1 + len {
                    return Err(DiagnosticError::malformed(format!(
                        "single frame declares {} bytes but carries {}",
                        len,
                        data.len() - 1
                    )));
                }
                Ok(Self::Single {
                    payload: &data[1..1 + len],
                })
            }
            PciType::First => {
                if data.len() < 2 {
                    return Err(DiagnosticError::malformed("first frame too short"));
                }
                let total_len = (usize::from(byte0 & 0x0F) << 8) | usize::from(data[1]);
                if total_len <= SF_MAX_PAYLOAD {
                    // 0 would be the escape for >4095-byte messages, which classic CAN
                    // stations do not use; 1..7 belongs in a Single Frame.
                    return Err(DiagnosticError::malformed(format!(
                        "invalid first frame length {}",
                        total_len
                    )));
                }
                Ok(Self::First {
                    total_len,
                    payload: &data[2..],
                })
            }
            PciType::Consecutive => Ok(Self::Consecutive {
                sequence: byte0 & 0x0F,
                payload: &data[1..],
            }),
            PciType::FlowControl => Ok(Self::FlowControl(FlowControl::parse(data)?)),
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Frames needed to transmit one payload
#[derive(Debug, Clone)]
pub enum Segments<'a> {
    Single(Vec<u8>),
    Multi {
        first: Vec<u8>,
        rest: ConsecutiveFrames<'a>,
    },
}

/// Split `payload` into a Single Frame or a First Frame plus Consecutive Frames
pub fn segment(payload: &[u8]) -> DiagnosticResult<Segments<'_>> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(DiagnosticError::malformed(format!(
            "payload of {} bytes exceeds {}",
            payload.len(),
            MAX_MESSAGE_LEN
        )));
    }

    if payload.len() <= SF_MAX_PAYLOAD {
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push((PCI_SINGLE << 4) | payload.len() as u8);
        frame.extend_from_slice(payload);
        return Ok(Segments::Single(frame));
    }

    let total = payload.len();
    let mut first = Vec::with_capacity(8);
    first.push((PCI_FIRST << 4) | ((total >> 8) as u8 & 0x0F));
    first.push((total & 0xFF) as u8);
    first.extend_from_slice(&payload[..FF_PAYLOAD]);

    Ok(Segments::Multi {
        first,
        rest: ConsecutiveFrames::new(&payload[FF_PAYLOAD..]),
    })
}

/// Iterator over the Consecutive Frames of a segmented payload
#[derive(Debug, Clone)]
pub struct ConsecutiveFrames<'a> {
    remaining: &'a [u8],
    sequence: SequenceNumber,
}

impl<'a> ConsecutiveFrames<'a> {
    fn new(remaining: &'a [u8]) -> Self {
        Self {
            remaining,
            sequence: SequenceNumber::FIRST,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.remaining.is_empty()
    }
}

impl Iterator for ConsecutiveFrames<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let take = self.remaining.len().min(CF_PAYLOAD);
        let mut frame = Vec::with_capacity(1 + take);
        frame.push((PCI_CONSECUTIVE << 4) | self.sequence.value());
        frame.extend_from_slice(&self.remaining[..take]);

        self.remaining = &self.remaining[take..];
        self.sequence = self.sequence.next();
        Some(frame)
    }
}

// =============================================================================
// Reassembly
// =============================================================================

/// Message being assembled from a First Frame and its Consecutive Frames
#[derive(Debug, Clone)]
pub struct IsoTpMessage {
    expected_len: usize,
    data: Vec<u8>,
}

impl IsoTpMessage {
    fn new(expected_len: usize) -> Self {
        Self {
            expected_len,
            data: Vec::with_capacity(expected_len),
        }
    }

    /// Append bytes, discarding anything beyond the declared length
    fn append(&mut self, bytes: &[u8]) {
        let room = self.expected_len - self.data.len();
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.expected_len
    }
}

/// What the receiver has to do after feeding a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// A complete payload was assembled
    Complete(Vec<u8>),
    /// A First Frame started a message; a Flow Control must be sent
    FlowControlRequired,
    /// Consecutive Frame accepted, more to come
    InProgress,
    /// Frame does not belong to a reception (stray CF, FC)
    Ignored,
}

/// Receive-side state machine
#[derive(Debug, Default)]
pub struct Reassembler {
    in_progress: Option<(IsoTpMessage, SequenceNumber)>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_receiving(&self) -> bool {
        self.in_progress.is_some()
    }

    pub fn reset(&mut self) {
        self.in_progress = None;
    }

    /// Feed the data bytes of one CAN frame
    ///
    /// Any violation discards the message in progress.
    pub fn on_frame(&mut self, data: &[u8]) -> DiagnosticResult<RxEvent> {
        let frame = match IsoTpFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        match frame {
            IsoTpFrame::Single { payload } => {
                if self.in_progress.take().is_some() {
                    tracing::warn!("Single frame interrupted a multi-frame reception");
                }
                Ok(RxEvent::Complete(payload.to_vec()))
            }
            IsoTpFrame::First { total_len, payload } => {
                if self.in_progress.is_some() {
                    tracing::warn!("First frame restarted a multi-frame reception");
                }
                let mut message = IsoTpMessage::new(total_len);
                message.append(payload);
                self.in_progress = Some((message, SequenceNumber::FIRST));
                Ok(RxEvent::FlowControlRequired)
            }
            IsoTpFrame::Consecutive { sequence, payload } => {
                let Some((mut message, expected)) = self.in_progress.take() else {
                    return Ok(RxEvent::Ignored);
                };
                if sequence != expected.value() {
                    return Err(DiagnosticError::malformed(format!(
                        "consecutive frame sequence {} where {} was expected ({} of {} bytes received)",
                        sequence,
                        expected,
                        message.len(),
                        message.expected_len()
                    )));
                }
                message.append(payload);
                if message.is_complete() {
                    Ok(RxEvent::Complete(message.data))
                } else {
                    self.in_progress = Some((message, expected.next()));
                    Ok(RxEvent::InProgress)
                }
            }
            IsoTpFrame::FlowControl(_) => Ok(RxEvent::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn reassemble(frames: &[Vec<u8>]) -> DiagnosticResult<Vec<u8>> {
        let mut rx = Reassembler::new();
        for frame in frames {
            if let RxEvent::Complete(payload) = rx.on_frame(frame)? {
                return Ok(payload);
            }
        }
        Err(DiagnosticError::Timeout)
    }

    fn all_frames(payload: &[u8]) -> Vec<Vec<u8>> {
        match segment(payload).unwrap() {
            Segments::Single(frame) => vec![frame],
            Segments::Multi { first, rest } => std::iter::once(first).chain(rest).collect(),
        }
    }

    #[test]
    fn test_single_frame_round_trip() {
        for len in 0..=SF_MAX_PAYLOAD {
            let payload = pattern(len);
            let frames = all_frames(&payload);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0][0], len as u8);
            assert_eq!(reassemble(&frames).unwrap(), payload);
        }
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        assert!(segment(&pattern(MAX_MESSAGE_LEN + 1)).is_err());
    }

    #[test]
    fn test_multi_frame_round_trip() {
        for len in [8, 13, 14, 20, 111, 112, 500, MAX_MESSAGE_LEN] {
            let payload = pattern(len);
            let frames = all_frames(&payload);
            assert_eq!(frames[0][0] >> 4, PCI_FIRST);
            assert_eq!(frames.len(), 1 + (len - FF_PAYLOAD).div_ceil(CF_PAYLOAD));
            assert_eq!(reassemble(&frames).unwrap(), payload, "length {}", len);
        }
    }

    #[test]
    fn test_first_frame_declares_twelve_bit_length() {
        let frames = all_frames(&pattern(0x123));
        assert_eq!(&frames[0][..2], &[0x11, 0x23]);
        let frames = all_frames(&pattern(MAX_MESSAGE_LEN));
        assert_eq!(&frames[0][..2], &[0x1F, 0xFF]);
    }

    #[test]
    fn test_sequence_numbers_cycle_one_to_fifteen() {
        let frames = all_frames(&pattern(FF_PAYLOAD + 20 * CF_PAYLOAD));
        let sequence: Vec<u8> = frames[1..].iter().map(|f| f[0] & 0x0F).collect();
        let expected: Vec<u8> = (1..=15).chain(1..=5).collect();
        assert_eq!(sequence, expected);
        assert!(frames[1..].iter().all(|f| f[0] >> 4 == PCI_CONSECUTIVE));
    }

    #[test]
    fn test_skipped_sequence_number_is_rejected() {
        let mut frames = all_frames(&pattern(30));
        frames.remove(2);
        let err = reassemble(&frames).unwrap_err();
        assert!(matches!(err, DiagnosticError::MalformedFrame(_)));
    }

    #[test]
    fn test_repeated_sequence_number_discards_message() {
        let frames = all_frames(&pattern(30));
        let mut rx = Reassembler::new();
        assert_eq!(rx.on_frame(&frames[0]).unwrap(), RxEvent::FlowControlRequired);
        assert_eq!(rx.on_frame(&frames[1]).unwrap(), RxEvent::InProgress);
        assert!(rx.on_frame(&frames[1]).is_err());
        assert!(!rx.is_receiving());
        // The rest of the old message is now stray
        assert_eq!(rx.on_frame(&frames[2]).unwrap(), RxEvent::Ignored);
    }

    #[test]
    fn test_bytes_beyond_declared_length_are_discarded() {
        // FF declares 9 bytes; the CF is padded to 8 bytes on the wire
        let mut rx = Reassembler::new();
        rx.on_frame(&[0x10, 0x09, 1, 2, 3, 4, 5, 6]).unwrap();
        let event = rx.on_frame(&[0x21, 7, 8, 9, 0xAA, 0xAA, 0xAA, 0xAA]).unwrap();
        assert_eq!(event, RxEvent::Complete(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]));
    }

    #[test]
    fn test_single_frame_ignores_padding() {
        let mut rx = Reassembler::new();
        let event = rx.on_frame(&[0x03, 0x7F, 0x22, 0x31, 0, 0, 0, 0]).unwrap();
        assert_eq!(event, RxEvent::Complete(vec![0x7F, 0x22, 0x31]));
    }

    #[test]
    fn test_invalid_single_frame_lengths() {
        assert!(IsoTpFrame::parse(&[0x08, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(IsoTpFrame::parse(&[0x05, 1, 2]).is_err());
        assert!(IsoTpFrame::parse(&[0x10, 0x05, 1, 2, 3, 4, 5, 6]).is_err());
        assert!(IsoTpFrame::parse(&[0x40, 0, 0]).is_err());
    }

    #[test]
    fn test_stray_consecutive_frame_is_ignored() {
        let mut rx = Reassembler::new();
        assert_eq!(rx.on_frame(&[0x21, 1, 2, 3]).unwrap(), RxEvent::Ignored);
    }

    #[test]
    fn test_flow_control_encode_and_parse() {
        let fc = FlowControl::continue_to_send(0, 10);
        assert_eq!(fc.encode(), vec![0x30, 0x00, 0x0A, 0, 0, 0, 0, 0]);
        assert_eq!(FlowControl::parse(&fc.encode()).unwrap(), fc);

        let wait = FlowControl::parse(&[0x31, 0x00, 0x00]).unwrap();
        assert_eq!(wait.status, FlowStatus::Wait);
        let overflow = FlowControl::parse(&[0x32, 0x00, 0x00]).unwrap();
        assert_eq!(overflow.status, FlowStatus::Overflow);
        assert!(FlowControl::parse(&[0x35, 0x00, 0x00]).is_err());
    }

    #[test]
    fn test_st_min_microsecond_range() {
        let fc = FlowControl::parse(&[0x30, 0x00, 0xF5]).unwrap();
        assert_eq!(fc.separation_time, Duration::from_micros(500));
        let fc = FlowControl::parse(&[0x30, 0x00, 0x90]).unwrap();
        assert_eq!(fc.separation_time, Duration::from_millis(127));
    }
}

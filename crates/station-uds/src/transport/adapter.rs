//! Transport trait and CAN frame type

use std::fmt;

use async_trait::async_trait;
use tokio::time::Instant;

use super::TransportError;

/// Largest payload of a classic CAN frame
pub const MAX_FRAME_LEN: usize = 8;

/// Highest 11-bit (standard) arbitration id
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// A classic CAN frame on an 11-bit arbitration id
///
/// Frames are immutable once built; received frames carry the instant the
/// transport handed them over.
#[derive(Debug, Clone)]
pub struct Frame {
    id: u16,
    data: [u8; MAX_FRAME_LEN],
    len: u8,
    timestamp: Instant,
}

impl Frame {
    /// Build a frame from up to 8 data bytes
    ///
    /// Returns `None` if the id is not an 11-bit id or the payload is too long.
    pub fn new(id: u16, data: &[u8]) -> Option<Self> {
        Self::received(id, data, Instant::now())
    }

    /// Build a frame with a known receive timestamp
    pub fn received(id: u16, data: &[u8], timestamp: Instant) -> Option<Self> {
        if id > MAX_STANDARD_ID || data.len() > MAX_FRAME_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            data: buf,
            len: data.len() as u8,
            timestamp,
        })
    }

    /// Build a full 8-byte frame, padding unused bytes with 0x00
    pub fn padded(id: u16, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_FRAME_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        buf[..data.len()].copy_from_slice(data);
        Self::new(id, &buf)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn dlc(&self) -> usize {
        self.len as usize
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// Renders `7F0 8 02 10 03 00 00 00 00 00`
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X} {}", self.id, self.len)?;
        for byte in self.data() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Raw CAN frame transport
///
/// A transport moves single frames on and off the bus and knows nothing about
/// ISO-TP or UDS. It never retries; every failure is returned to the caller.
#[async_trait]
pub trait Transport: Send {
    /// Put one frame on the bus
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Wait for the next frame until `deadline`
    ///
    /// Returns `Ok(None)` when nothing arrived in time, which is distinct from
    /// an adapter error.
    async fn receive(&mut self, deadline: Instant) -> Result<Option<Frame>, TransportError>;

    /// Release the adapter
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Short backend label for logs (e.g. `socketcan:can0`)
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_extended_id_and_long_payload() {
        assert!(Frame::new(0x800, &[0x01]).is_none());
        assert!(Frame::new(0x7F0, &[0u8; 9]).is_none());
        assert!(Frame::new(0x7FF, &[0u8; 8]).is_some());
    }

    #[test]
    fn test_padded_frame_is_eight_bytes() {
        let frame = Frame::padded(0x7F0, &[0x02, 0x10, 0x03]).unwrap();
        assert_eq!(frame.dlc(), 8);
        assert_eq!(frame.data(), &[0x02, 0x10, 0x03, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_frame_display_trace_line() {
        let frame = Frame::padded(0x7F0, &[0x02, 0x10, 0x03]).unwrap();
        assert_eq!(frame.to_string(), "7F0 8 02 10 03 00 00 00 00 00");
    }
}

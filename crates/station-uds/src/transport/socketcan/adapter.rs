//! Raw SocketCAN frame transport

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame as _, Socket, StandardId};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::transport::{Frame, Transport, TransportError};

/// Pause between reads of an empty non-blocking socket
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Classic CAN transport on a raw SocketCAN socket
///
/// Only 11-bit data frames are delivered; extended, remote and error frames
/// on the bus are skipped. The interface bitrate is a property of the network
/// link (`ip link set can0 type can bitrate 500000`) and is not changed here.
pub struct SocketCanTransport {
    socket: Option<CanSocket>,
    channel: String,
}

impl SocketCanTransport {
    pub fn open(channel: &str, bitrate: u32) -> Result<Self, TransportError> {
        let socket = CanSocket::open(channel).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open raw CAN socket on {}: {}",
                channel, e
            ))
        })?;

        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        Self::drain(&socket);
        info!(channel, bitrate, "SocketCAN transport opened");

        Ok(Self {
            socket: Some(socket),
            channel: channel.to_string(),
        })
    }

    /// Discard frames queued before this transport was opened
    fn drain(socket: &CanSocket) {
        let mut drained = 0usize;
        while socket.read_frame().is_ok() {
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "Drained stale frames from socket");
        }
    }

    fn socket(&self) -> Result<&CanSocket, TransportError> {
        self.socket.as_ref().ok_or(TransportError::ConnectionClosed)
    }
}

/// Convert a received frame, skipping anything that is not an 11-bit data frame
fn to_frame(frame: &CanFrame) -> Option<Frame> {
    match frame {
        CanFrame::Data(data) if !data.is_extended() => {
            Frame::received(data.raw_id() as u16, data.data(), Instant::now())
        }
        _ => None,
    }
}

#[async_trait]
impl Transport for SocketCanTransport {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let socket = self.socket()?;
        let id = StandardId::new(frame.id())
            .ok_or_else(|| TransportError::SendFailed(format!("Invalid CAN ID 0x{:X}", frame.id())))?;
        let can_frame = CanFrame::new(id, frame.data())
            .ok_or_else(|| TransportError::SendFailed("Invalid CAN frame".to_string()))?;

        socket
            .write_frame(&can_frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Option<Frame>, TransportError> {
        loop {
            let result = self.socket()?.read_frame();
            match result {
                Ok(can_frame) => match to_frame(&can_frame) {
                    Some(frame) => return Ok(Some(frame)),
                    None => trace!("Skipping non-standard CAN frame"),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(IDLE_POLL.min(deadline - now)).await;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.socket.take().is_some() {
            info!(channel = %self.channel, "SocketCAN transport closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("socketcan:{}", self.channel)
    }
}

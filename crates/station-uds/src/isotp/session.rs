//! ISO-TP exchange over a frame transport

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{segment, FlowControl, FlowStatus, IsoTpFrame, Reassembler, RxEvent, Segments};
use crate::config::TimingConfig;
use crate::context::{DiagContext, Level};
use crate::error::{DiagnosticError, DiagnosticResult};
use crate::transport::{AddressInfo, Frame, Transport};

/// Flow Control `Wait` frames tolerated before giving up on a send
const MAX_FLOW_CONTROL_WAITS: u32 = 10;

/// One ISO-TP endpoint on a request/response ID pair
///
/// The session borrows the transport mutably, so at most one session can be
/// active on a transport at a time. Segmentation state lives only for the
/// duration of a single [`send`](Self::send) or [`receive`](Self::receive).
pub struct IsoTpSession<'a> {
    transport: &'a mut dyn Transport,
    address: AddressInfo,
    timing: &'a TimingConfig,
    ctx: &'a DiagContext,
}

/// Sender-side state for one multi-frame send
#[derive(Debug)]
struct SegmentationState {
    block_size: u8,
    separation_time: Duration,
    sent_in_block: u8,
}

impl SegmentationState {
    fn from_flow_control(fc: &FlowControl, minimum_gap: Duration) -> Self {
        Self {
            block_size: fc.block_size,
            separation_time: fc.separation_time.max(minimum_gap),
            sent_in_block: 0,
        }
    }

    fn block_exhausted(&self) -> bool {
        self.block_size != 0 && self.sent_in_block >= self.block_size
    }
}

impl<'a> IsoTpSession<'a> {
    pub fn new(
        transport: &'a mut dyn Transport,
        address: AddressInfo,
        timing: &'a TimingConfig,
        ctx: &'a DiagContext,
    ) -> Self {
        Self {
            transport,
            address,
            timing,
            ctx,
        }
    }

    /// Send `payload` and wait for the complete response payload
    pub async fn request(&mut self, payload: &[u8]) -> DiagnosticResult<Vec<u8>> {
        self.send(payload).await?;
        self.receive().await
    }

    /// Transmit one payload as a Single Frame or as First + Consecutive Frames
    pub async fn send(&mut self, payload: &[u8]) -> DiagnosticResult<()> {
        match segment(payload)? {
            Segments::Single(frame) => self.transmit(&frame).await,
            Segments::Multi { first, mut rest } => {
                self.transmit(&first).await?;

                let fc = self.wait_for_flow_control().await?;
                let mut state = SegmentationState::from_flow_control(&fc, self.timing.separation_time());
                debug!(
                    total = payload.len(),
                    block_size = state.block_size,
                    separation_ms = state.separation_time.as_millis() as u64,
                    "Sending consecutive frames"
                );

                while let Some(frame) = rest.next() {
                    self.transmit(&frame).await?;
                    state.sent_in_block += 1;

                    if rest.is_finished() {
                        break;
                    }
                    if state.block_exhausted() {
                        let fc = self.wait_for_flow_control().await?;
                        state = SegmentationState::from_flow_control(&fc, self.timing.separation_time());
                    } else {
                        self.ctx.sleep(state.separation_time).await?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Receive one complete payload within the configured response timeout
    pub async fn receive(&mut self) -> DiagnosticResult<Vec<u8>> {
        let deadline = Instant::now() + self.timing.response_timeout();
        self.receive_until(deadline).await
    }

    /// Receive one complete payload before `deadline`
    pub async fn receive_until(&mut self, deadline: Instant) -> DiagnosticResult<Vec<u8>> {
        let mut reassembler = Reassembler::new();
        // Consecutive frames since our last Flow Control
        let mut received_in_block = 0u8;

        loop {
            let Some(frame) = self.next_frame(deadline).await? else {
                if reassembler.is_receiving() {
                    debug!("Deadline passed in the middle of a multi-frame response");
                }
                return Err(DiagnosticError::Timeout);
            };

            match reassembler.on_frame(frame.data()) {
                Ok(RxEvent::Complete(payload)) => return Ok(payload),
                Ok(RxEvent::FlowControlRequired) => {
                    received_in_block = 0;
                    self.send_flow_control().await?;
                }
                Ok(RxEvent::InProgress) => {
                    received_in_block = received_in_block.saturating_add(1);
                    let block_size = self.timing.fc_block_size;
                    if block_size != 0 && received_in_block >= block_size {
                        received_in_block = 0;
                        self.send_flow_control().await?;
                    }
                }
                Ok(RxEvent::Ignored) => trace!(frame = %frame, "Ignoring frame outside a reception"),
                Err(e) => {
                    warn!(frame = %frame, error = %e, "Discarding response");
                    self.ctx.warn(&format!("Malformed response frame {}: {}", frame, e));
                    return Err(e);
                }
            }
        }
    }

    /// Let the ECU send the next block of consecutive frames
    async fn send_flow_control(&mut self) -> DiagnosticResult<()> {
        let fc = FlowControl::continue_to_send(
            self.timing.fc_block_size,
            self.timing.fc_separation_time_ms,
        );
        self.transmit(&fc.encode()).await
    }

    /// Wait for a Flow Control that allows sending, honouring `Wait`
    async fn wait_for_flow_control(&mut self) -> DiagnosticResult<FlowControl> {
        let mut deadline = Instant::now() + self.timing.flow_control_timeout();
        let mut waits = 0;

        loop {
            let Some(frame) = self.next_frame(deadline).await? else {
                debug!("No flow control from ECU");
                return Err(DiagnosticError::Timeout);
            };

            match IsoTpFrame::parse(frame.data()) {
                Ok(IsoTpFrame::FlowControl(fc)) => match fc.status {
                    FlowStatus::ContinueToSend => return Ok(fc),
                    FlowStatus::Wait => {
                        waits += 1;
                        if waits > MAX_FLOW_CONTROL_WAITS {
                            return Err(DiagnosticError::malformed(format!(
                                "more than {} flow control wait frames",
                                MAX_FLOW_CONTROL_WAITS
                            )));
                        }
                        deadline = Instant::now() + self.timing.flow_control_timeout();
                    }
                    FlowStatus::Overflow => {
                        return Err(DiagnosticError::malformed(
                            "ECU reported buffer overflow for the request",
                        ))
                    }
                },
                Ok(_) => debug!(frame = %frame, "Ignoring non flow control frame while sending"),
                Err(e) => return Err(e),
            }
        }
    }

    /// Next frame on the response ID, or `None` once `deadline` has passed
    ///
    /// Each transport wait is capped by the poll interval and never extends
    /// past `deadline`; cancellation is checked between waits.
    async fn next_frame(&mut self, deadline: Instant) -> DiagnosticResult<Option<Frame>> {
        loop {
            self.ctx.checkpoint()?;

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let poll_deadline = (now + self.timing.poll_interval()).min(deadline);

            match self.transport.receive(poll_deadline).await? {
                Some(frame) if frame.id() == self.address.rx_id => {
                    self.ctx.log(Level::DEBUG, &format!("Rx {}", frame));
                    return Ok(Some(frame));
                }
                Some(frame) => trace!(frame = %frame, "Ignoring frame on foreign ID"),
                None => {}
            }
        }
    }

    async fn transmit(&mut self, data: &[u8]) -> DiagnosticResult<()> {
        let frame = Frame::padded(self.address.tx_id, data).ok_or_else(|| {
            DiagnosticError::malformed(format!("frame data of {} bytes", data.len()))
        })?;
        self.ctx.log(Level::DEBUG, &format!("Tx {}", frame));
        self.transport.send(&frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::TransportError;

    const ADDRESS: AddressInfo = AddressInfo {
        tx_id: 0x7F0,
        rx_id: 0x7F1,
    };

    /// Transport replaying a fixed list of incoming frames
    #[derive(Default, Clone)]
    struct ScriptedTransport {
        incoming: Arc<Mutex<VecDeque<Frame>>>,
        sent: Arc<Mutex<Vec<Frame>>>,
        fail_send: bool,
    }

    impl ScriptedTransport {
        fn with_frames(frames: &[(u16, &[u8])]) -> Self {
            let transport = Self::default();
            for (id, data) in frames {
                transport
                    .incoming
                    .lock()
                    .push_back(Frame::padded(*id, data).unwrap());
            }
            transport
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().iter().map(|f| f.data().to_vec()).collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
            if self.fail_send {
                return Err(TransportError::SendFailed("adapter unplugged".to_string()));
            }
            self.sent.lock().push(frame.clone());
            Ok(())
        }

        async fn receive(&mut self, deadline: Instant) -> Result<Option<Frame>, TransportError> {
            let next = self.incoming.lock().pop_front();
            if next.is_none() {
                tokio::time::sleep_until(deadline).await;
            }
            Ok(next)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn timing() -> TimingConfig {
        TimingConfig {
            response_timeout_ms: 1000,
            poll_interval_ms: 100,
            flow_control_timeout_ms: 500,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_frame_request_and_response() {
        let mut transport = ScriptedTransport::with_frames(&[(0x7F1, &[0x02, 0x50, 0x03])]);
        let probe = transport.clone();
        let timing = timing();
        let ctx = DiagContext::detached();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let response = session.request(&[0x10, 0x03]).await.unwrap();

        assert_eq!(response, vec![0x50, 0x03]);
        assert_eq!(probe.sent(), vec![vec![0x02, 0x10, 0x03, 0, 0, 0, 0, 0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_frame_response_sends_flow_control() {
        let mut transport = ScriptedTransport::with_frames(&[
            (0x123, &[0x02, 0x11, 0x22]),
            (0x7F1, &[0x10, 0x14, 0x62, 0xF1, 0x90, b'W', b'V', b'W']),
            (0x7F1, &[0x21, b'Z', b'Z', b'Z', b'1', b'J', b'Z', b'X']),
            (0x7F1, &[0x22, b'W', b'0', b'0', b'0', b'0', b'0', b'1']),
        ]);
        let probe = transport.clone();
        let timing = timing();
        let ctx = DiagContext::detached();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let response = session.receive().await.unwrap();

        assert_eq!(response.len(), 0x14);
        assert_eq!(&response[3..], b"WVWZZZ1JZXW000001");
        assert_eq!(probe.sent(), vec![vec![0x30, 0x00, 0x0A, 0, 0, 0, 0, 0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_sends_flow_control_after_each_block() {
        // 40-byte payload: FF + 5 CFs
        let mut transport = ScriptedTransport::with_frames(&[
            (0x7F1, &[0x10, 40, 1, 2, 3, 4, 5, 6]),
            (0x7F1, &[0x21, 7, 8, 9, 10, 11, 12, 13]),
            (0x7F1, &[0x22, 14, 15, 16, 17, 18, 19, 20]),
            (0x7F1, &[0x23, 21, 22, 23, 24, 25, 26, 27]),
            (0x7F1, &[0x24, 28, 29, 30, 31, 32, 33, 34]),
            (0x7F1, &[0x25, 35, 36, 37, 38, 39, 40]),
        ]);
        let probe = transport.clone();
        let timing = TimingConfig {
            fc_block_size: 2,
            ..timing()
        };
        let ctx = DiagContext::detached();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let response = session.receive().await.unwrap();

        assert_eq!(response, (1..=40).collect::<Vec<u8>>());
        // After the First Frame, after CF2 and after CF4; none after the last CF
        let fc = vec![0x30, 0x02, 0x0A, 0, 0, 0, 0, 0];
        assert_eq!(probe.sent(), vec![fc.clone(), fc.clone(), fc]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_gap_is_malformed() {
        let mut transport = ScriptedTransport::with_frames(&[
            (0x7F1, &[0x10, 0x14, 1, 2, 3, 4, 5, 6]),
            (0x7F1, &[0x21, 1, 2, 3, 4, 5, 6, 7]),
            (0x7F1, &[0x23, 1, 2, 3, 4, 5, 6, 7]),
        ]);
        let timing = timing();
        let ctx = DiagContext::detached();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let err = session.receive().await.unwrap_err();
        assert!(matches!(err, DiagnosticError::MalformedFrame(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_is_timeout_at_deadline() {
        let mut transport = ScriptedTransport::default();
        let timing = timing();
        let ctx = DiagContext::detached();
        let started = Instant::now();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let err = session.receive().await.unwrap_err();

        assert_eq!(err, DiagnosticError::Timeout);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_frame_send_waits_for_flow_control() {
        let mut transport = ScriptedTransport::with_frames(&[(0x7F1, &[0x30, 0x00, 0x00])]);
        let probe = transport.clone();
        let timing = timing();
        let ctx = DiagContext::detached();
        let payload: Vec<u8> = (1..=20).collect();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        session.send(&payload).await.unwrap();

        let sent = probe.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0][..], &[0x10, 20, 1, 2, 3, 4, 5, 6]);
        assert_eq!(&sent[1][..], &[0x21, 7, 8, 9, 10, 11, 12, 13]);
        assert_eq!(&sent[2][..], &[0x22, 14, 15, 16, 17, 18, 19, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_frame_send_without_flow_control_stops_after_first_frame() {
        let mut transport = ScriptedTransport::default();
        let probe = transport.clone();
        let timing = timing();
        let ctx = DiagContext::detached();
        let payload: Vec<u8> = (1..=20).collect();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let err = session.send(&payload).await.unwrap_err();

        assert_eq!(err, DiagnosticError::Timeout);
        assert_eq!(probe.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_size_requires_new_flow_control() {
        let mut transport = ScriptedTransport::with_frames(&[
            (0x7F1, &[0x30, 0x01, 0x00]),
            (0x7F1, &[0x30, 0x00, 0x00]),
        ]);
        let probe = transport.clone();
        let timing = timing();
        let ctx = DiagContext::detached();
        let payload: Vec<u8> = (1..=20).collect();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        session.send(&payload).await.unwrap();

        assert_eq!(probe.sent().len(), 3);
        assert!(probe.incoming.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_flow_control_aborts_send() {
        let mut transport = ScriptedTransport::with_frames(&[(0x7F1, &[0x32, 0x00, 0x00])]);
        let timing = timing();
        let ctx = DiagContext::detached();
        let payload: Vec<u8> = (1..=20).collect();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let err = session.send(&payload).await.unwrap_err();
        assert!(matches!(err, DiagnosticError::MalformedFrame(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_surfaces_as_transport_failure() {
        let mut transport = ScriptedTransport {
            fail_send: true,
            ..Default::default()
        };
        let timing = timing();
        let ctx = DiagContext::detached();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let err = session.request(&[0x3E, 0x00]).await.unwrap_err();
        assert!(matches!(err, DiagnosticError::TransportFailure(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_between_polls() {
        let mut transport = ScriptedTransport::default();
        let timing = timing();
        let ctx = DiagContext::detached();
        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            token.cancel();
        });
        let started = Instant::now();

        let mut session = IsoTpSession::new(&mut transport, ADDRESS, &timing, &ctx);
        let err = session.receive().await.unwrap_err();

        assert_eq!(err, DiagnosticError::Cancelled);
        assert!(started.elapsed() <= Duration::from_millis(300));
    }
}

//! Virtual ECU transport for tests and bench runs without hardware

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{AddressInfo, Frame, Transport, TransportError};
use crate::isotp::{segment, FlowControl, FlowStatus, IsoTpFrame, Reassembler, RxEvent, Segments};
use crate::uds::{service_id, standard_did};

/// VIN the virtual ECU reports unless overridden
pub const DEFAULT_VIN: &str = "WVWZZZ1JZXW000001";

/// Raw battery voltage byte the virtual ECU reports (0x96 = 15.0 V)
pub const DEFAULT_BATTERY_RAW: u8 = 0x96;

// NRCs the simulated ECU produces on its own
const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;
const NRC_SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
const NRC_INCORRECT_LENGTH: u8 = 0x13;
const NRC_REQUEST_OUT_OF_RANGE: u8 = 0x31;

#[derive(Debug, Clone, Copy)]
struct ForcedNrc {
    nrc: u8,
    /// `None` means every request
    remaining: Option<u32>,
}

#[derive(Debug)]
struct EcuState {
    address: AddressInfo,
    connected: bool,
    latency: Duration,
    dids: BTreeMap<u16, Vec<u8>>,
    session: u8,

    silent: bool,
    drop_responses: u32,
    forced_nrc: HashMap<u8, ForcedNrc>,
    corrupt_next_sequence: bool,

    request_counts: HashMap<u8, u32>,
    received: Vec<Frame>,

    /// Frames ready for the tester, with the instant they become visible
    outbox: VecDeque<(Instant, Frame)>,
    /// Consecutive Frames of a response waiting for the tester's Flow Control
    pending_cf: VecDeque<Vec<u8>>,
    reassembler: Reassembler,
}

impl EcuState {
    fn new(address: AddressInfo) -> Self {
        let mut dids = BTreeMap::new();
        dids.insert(standard_did::VIN, DEFAULT_VIN.as_bytes().to_vec());
        dids.insert(standard_did::BATTERY_VOLTAGE, vec![DEFAULT_BATTERY_RAW]);

        Self {
            address,
            connected: true,
            latency: Duration::ZERO,
            dids,
            session: 0x01,
            silent: false,
            drop_responses: 0,
            forced_nrc: HashMap::new(),
            corrupt_next_sequence: false,
            request_counts: HashMap::new(),
            received: Vec::new(),
            outbox: VecDeque::new(),
            pending_cf: VecDeque::new(),
            reassembler: Reassembler::new(),
        }
    }

    fn queue(&mut self, data: &[u8]) {
        if let Some(frame) = Frame::padded(self.address.rx_id, data) {
            let ready_at = Instant::now() + self.latency;
            self.outbox.push_back((ready_at, frame));
        }
    }

    fn on_tester_frame(&mut self, frame: &Frame) {
        self.received.push(frame.clone());
        if frame.id() != self.address.tx_id {
            return;
        }

        if let Ok(IsoTpFrame::FlowControl(fc)) = IsoTpFrame::parse(frame.data()) {
            self.on_flow_control(&fc);
            return;
        }

        match self.reassembler.on_frame(frame.data()) {
            Ok(RxEvent::Complete(request)) => self.on_request(&request),
            Ok(RxEvent::FlowControlRequired) => {
                self.queue(&FlowControl::continue_to_send(0, 0).encode());
            }
            Ok(RxEvent::InProgress) | Ok(RxEvent::Ignored) => {}
            Err(e) => tracing::debug!(error = %e, "Virtual ECU dropped malformed request"),
        }
    }

    fn on_flow_control(&mut self, fc: &FlowControl) {
        if fc.status != FlowStatus::ContinueToSend {
            return;
        }
        let burst = match fc.block_size {
            0 => self.pending_cf.len(),
            n => usize::from(n).min(self.pending_cf.len()),
        };
        for _ in 0..burst {
            if let Some(cf) = self.pending_cf.pop_front() {
                self.queue(&cf);
            }
        }
    }

    fn on_request(&mut self, request: &[u8]) {
        let Some(&sid) = request.first() else {
            return;
        };
        *self.request_counts.entry(sid).or_insert(0) += 1;

        if self.silent {
            return;
        }
        if self.drop_responses > 0 {
            self.drop_responses -= 1;
            return;
        }

        let forced = match self.forced_nrc.get_mut(&sid) {
            Some(ForcedNrc {
                nrc,
                remaining: None,
            }) => Some(*nrc),
            Some(ForcedNrc {
                nrc,
                remaining: Some(n),
            }) if *n > 0 => {
                *n -= 1;
                Some(*nrc)
            }
            _ => None,
        };
        if let Some(nrc) = forced {
            self.respond(&[service_id::NEGATIVE_RESPONSE, sid, nrc]);
            return;
        }

        if let Some(response) = self.service(sid, &request[1..]) {
            self.respond(&response);
        }
    }

    /// Positive or negative response to one request, `None` when suppressed
    fn service(&mut self, sid: u8, params: &[u8]) -> Option<Vec<u8>> {
        let negative = |nrc: u8| Some(vec![service_id::NEGATIVE_RESPONSE, sid, nrc]);

        match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => match params {
                [sub @ 0x01..=0x03] => {
                    self.session = *sub;
                    // P2 = 50 ms, P2* = 5000 ms
                    Some(vec![service_id::positive(sid), *sub, 0x00, 0x32, 0x01, 0xF4])
                }
                [_] => negative(NRC_SUB_FUNCTION_NOT_SUPPORTED),
                _ => negative(NRC_INCORRECT_LENGTH),
            },
            service_id::TESTER_PRESENT => match params {
                [0x80] => None,
                [0x00] => Some(vec![service_id::positive(sid), 0x00]),
                [_] => negative(NRC_SUB_FUNCTION_NOT_SUPPORTED),
                _ => negative(NRC_INCORRECT_LENGTH),
            },
            service_id::READ_DATA_BY_ID => match params {
                [hi, lo] => {
                    let did = u16::from_be_bytes([*hi, *lo]);
                    match self.dids.get(&did) {
                        Some(value) => {
                            let mut response = vec![service_id::positive(sid), *hi, *lo];
                            response.extend_from_slice(value);
                            Some(response)
                        }
                        None => negative(NRC_REQUEST_OUT_OF_RANGE),
                    }
                }
                _ => negative(NRC_INCORRECT_LENGTH),
            },
            _ => negative(NRC_SERVICE_NOT_SUPPORTED),
        }
    }

    fn respond(&mut self, payload: &[u8]) {
        match segment(payload) {
            Ok(Segments::Single(frame)) => self.queue(&frame),
            Ok(Segments::Multi { first, rest }) => {
                self.queue(&first);
                self.pending_cf = rest.collect();
                if std::mem::take(&mut self.corrupt_next_sequence) {
                    // Skip one sequence number on the second Consecutive Frame
                    let target = self.pending_cf.len().min(2).saturating_sub(1);
                    if let Some(cf) = self.pending_cf.get_mut(target) {
                        let skipped = match cf[0] & 0x0F {
                            15 => 2,
                            14 => 1,
                            n => n + 2,
                        };
                        cf[0] = (cf[0] & 0xF0) | skipped;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Virtual ECU cannot send response"),
        }
    }
}

/// In-process simulated ECU speaking ISO-TP on one id pair
///
/// Implements [`Transport`], so the whole engine can run against it. Use
/// [`VirtualEcu::handle`] before boxing the transport to inspect requests
/// and inject faults.
pub struct VirtualEcu {
    state: Arc<Mutex<EcuState>>,
}

impl VirtualEcu {
    pub fn new(address: AddressInfo) -> Self {
        Self {
            state: Arc::new(Mutex::new(EcuState::new(address))),
        }
    }

    pub fn handle(&self) -> VirtualEcuHandle {
        VirtualEcuHandle {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl Transport for VirtualEcu {
    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::ConnectionClosed);
        }
        state.on_tester_frame(frame);
        Ok(())
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Option<Frame>, TransportError> {
        loop {
            let wake_at = {
                let mut state = self.state.lock();
                if !state.connected {
                    return Err(TransportError::ConnectionClosed);
                }
                match state.outbox.front() {
                    Some((ready_at, _)) if *ready_at <= Instant::now() => {
                        let frame = state.outbox.pop_front().map(|(_, frame)| frame);
                        return Ok(frame);
                    }
                    Some((ready_at, _)) => (*ready_at).min(deadline),
                    None => deadline,
                }
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until(wake_at).await;
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connected = false;
        state.outbox.clear();
        state.pending_cf.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        let state = self.state.lock();
        format!(
            "virtual:{:03X}/{:03X}",
            state.address.tx_id, state.address.rx_id
        )
    }
}

/// Control and inspection handle for a [`VirtualEcu`]
#[derive(Clone)]
pub struct VirtualEcuHandle {
    state: Arc<Mutex<EcuState>>,
}

impl VirtualEcuHandle {
    pub fn set_did(&self, did: u16, value: &[u8]) {
        self.state.lock().dids.insert(did, value.to_vec());
    }

    pub fn remove_did(&self, did: u16) {
        self.state.lock().dids.remove(&did);
    }

    /// Stop answering requests (they are still counted)
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Swallow the next `count` requests without answering
    pub fn drop_responses(&self, count: u32) {
        self.state.lock().drop_responses = count;
    }

    /// Answer every request for `sid` with `nrc`
    pub fn force_nrc(&self, sid: u8, nrc: u8) {
        self.state.lock().forced_nrc.insert(
            sid,
            ForcedNrc {
                nrc,
                remaining: None,
            },
        );
    }

    /// Answer the next `times` requests for `sid` with `nrc`
    pub fn force_nrc_times(&self, sid: u8, nrc: u8, times: u32) {
        self.state.lock().forced_nrc.insert(
            sid,
            ForcedNrc {
                nrc,
                remaining: Some(times),
            },
        );
    }

    /// Break the sequence numbering of the next multi-frame response
    pub fn corrupt_next_sequence(&self) {
        self.state.lock().corrupt_next_sequence = true;
    }

    /// Delay every frame the ECU sends
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Simulate an unplugged adapter
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.silent = false;
        state.drop_responses = 0;
        state.forced_nrc.clear();
        state.corrupt_next_sequence = false;
        state.latency = Duration::ZERO;
    }

    /// Put an arbitrary frame on the bus towards the tester
    pub fn inject(&self, frame: Frame) {
        self.state.lock().outbox.push_back((Instant::now(), frame));
    }

    /// Complete requests seen for one service
    pub fn request_count(&self, sid: u8) -> u32 {
        self.state
            .lock()
            .request_counts
            .get(&sid)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_requests(&self) -> u32 {
        self.state.lock().request_counts.values().sum()
    }

    /// Frames the tester sent, in order
    pub fn received_frames(&self) -> Vec<Frame> {
        self.state.lock().received.clone()
    }

    /// Active diagnostic session sub-function
    pub fn session(&self) -> u8 {
        self.state.lock().session
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const ADDRESS: AddressInfo = AddressInfo {
        tx_id: 0x7F0,
        rx_id: 0x7F1,
    };

    async fn exchange(ecu: &mut VirtualEcu, data: &[u8]) -> Vec<Vec<u8>> {
        ecu.send(&Frame::padded(ADDRESS.tx_id, data).unwrap())
            .await
            .unwrap();
        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(10);
        while let Some(frame) = ecu.receive(deadline).await.unwrap() {
            frames.push(frame.data().to_vec());
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_frame_answers() {
        let mut ecu = VirtualEcu::new(ADDRESS);
        let handle = ecu.handle();

        let frames = exchange(&mut ecu, &[0x02, 0x3E, 0x00]).await;
        assert_eq!(frames, vec![vec![0x02, 0x7E, 0x00, 0, 0, 0, 0, 0]]);

        let frames = exchange(&mut ecu, &[0x03, 0x22, 0xE1, 0x42]).await;
        assert_eq!(frames, vec![vec![0x04, 0x62, 0xE1, 0x42, 0x96, 0, 0, 0]]);

        let frames = exchange(&mut ecu, &[0x02, 0x10, 0x03]).await;
        assert_eq!(&frames[0][..3], &[0x06, 0x50, 0x03]);
        assert_eq!(handle.session(), 0x03);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_frame_response_waits_for_flow_control() {
        let mut ecu = VirtualEcu::new(ADDRESS);

        let frames = exchange(&mut ecu, &[0x03, 0x22, 0xF1, 0x90]).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..2], &[0x10, 0x14]);

        let frames = exchange(&mut ecu, &[0x30, 0x00, 0x0A]).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], 0x21);
        assert_eq!(frames[1][0], 0x22);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_did_and_service() {
        let mut ecu = VirtualEcu::new(ADDRESS);
        let frames = exchange(&mut ecu, &[0x03, 0x22, 0x12, 0x34]).await;
        assert_eq!(&frames[0][..4], &[0x03, 0x7F, 0x22, 0x31]);
        let frames = exchange(&mut ecu, &[0x02, 0x11, 0x01]).await;
        assert_eq!(&frames[0][..4], &[0x03, 0x7F, 0x11, 0x11]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_nrc_times_then_recovers() {
        let mut ecu = VirtualEcu::new(ADDRESS);
        let handle = ecu.handle();
        handle.force_nrc_times(0x3E, 0x21, 1);

        let frames = exchange(&mut ecu, &[0x02, 0x3E, 0x00]).await;
        assert_eq!(&frames[0][..4], &[0x03, 0x7F, 0x3E, 0x21]);
        let frames = exchange(&mut ecu, &[0x02, 0x3E, 0x00]).await;
        assert_eq!(&frames[0][..3], &[0x02, 0x7E, 0x00]);
        assert_eq!(handle.request_count(0x3E), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_sequence() {
        let mut ecu = VirtualEcu::new(ADDRESS);
        ecu.handle().corrupt_next_sequence();

        exchange(&mut ecu, &[0x03, 0x22, 0xF1, 0x90]).await;
        let frames = exchange(&mut ecu, &[0x30, 0x00, 0x00]).await;
        assert_eq!(frames[0][0], 0x21);
        assert_eq!(frames[1][0], 0x24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_and_disconnect() {
        let mut ecu = VirtualEcu::new(ADDRESS);
        let handle = ecu.handle();
        handle.set_latency(Duration::from_millis(50));

        assert!(exchange(&mut ecu, &[0x02, 0x3E, 0x00]).await.is_empty());
        let frame = ecu
            .receive(Instant::now() + Duration::from_millis(100))
            .await
            .unwrap();
        assert!(frame.is_some());

        handle.set_connected(false);
        let err = ecu.send(&Frame::padded(0x7F0, &[0x02, 0x3E, 0x00]).unwrap()).await;
        assert_eq!(err, Err(TransportError::ConnectionClosed));
    }
}

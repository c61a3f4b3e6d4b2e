//! Mock hardware transport for testing
//!
//! Records every driver call, lets tests inject inbound frames, and blocks
//! receives on a condition variable until a frame is available or the
//! socket is closed, mirroring how a real driver unblocks on teardown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vbs_core::{BusKind, FlowControlRecord, Frame, HardwareFilter, LinkMode};

use super::{BusSocket, HardwareTransport, SocketId, TransportError};
use crate::config::MockConfig;

/// A recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCall {
    LinkUp,
    LinkDown,
    SetBitrate(u32),
    SetMode(LinkMode),
    ApplyFilters(Vec<HardwareFilter>),
    ApplyFlowControls(Vec<FlowControlRecord>),
    Open(SocketId),
    Bind(SocketId),
    Close(SocketId),
}

/// Driver operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwOp {
    LinkUp,
    LinkDown,
    SetBitrate,
    SetMode,
    ApplyFilters,
    ApplyFlowControls,
    Open,
    Bind,
    Close,
    Send,
    Receive,
}

#[derive(Debug, Default)]
struct MockState {
    link_up: bool,
    bitrate: u32,
    mode: Option<LinkMode>,
    filters: Vec<HardwareFilter>,
    flow_controls: Vec<FlowControlRecord>,
    vehicle_bitrate: Option<u32>,
    next_socket: SocketId,
    open_sockets: HashSet<SocketId>,
    calls: Vec<HwCall>,
    sent: Vec<(BusKind, Frame)>,
    inbound: HashMap<BusKind, VecDeque<Frame>>,
    failing: HashSet<HwOp>,
}

/// Mock transport for testing
pub struct MockTransport {
    config: MockConfig,
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockTransport {
    pub fn new(config: &MockConfig) -> Self {
        let state = MockState {
            vehicle_bitrate: config.vehicle_bitrate,
            next_socket: 3,
            ..Default::default()
        };
        Self {
            config: config.clone(),
            state: Mutex::new(state),
            changed: Condvar::new(),
        }
    }

    /// Queue a frame as if it arrived on the wire
    pub fn inject(&self, bus: BusKind, frame: Frame) {
        self.state
            .lock()
            .inbound
            .entry(bus)
            .or_default()
            .push_back(frame);
        self.changed.notify_all();
    }

    /// Bitrate the simulated vehicle bus runs at; frames are only decoded
    /// while the link is configured for it. `None` decodes at any bitrate.
    pub fn set_vehicle_bitrate(&self, bitrate: Option<u32>) {
        self.state.lock().vehicle_bitrate = bitrate;
        self.changed.notify_all();
    }

    /// Make every subsequent call of `op` fail
    pub fn fail_on(&self, op: HwOp) {
        self.state.lock().failing.insert(op);
        self.changed.notify_all();
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.state.lock().calls.clone()
    }

    /// Every bitrate programmed into the link, in order
    pub fn bitrate_history(&self) -> Vec<u32> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                HwCall::SetBitrate(bitrate) => Some(*bitrate),
                _ => None,
            })
            .collect()
    }

    pub fn sent_frames(&self) -> Vec<(BusKind, Frame)> {
        self.state.lock().sent.clone()
    }

    pub fn is_link_up(&self) -> bool {
        self.state.lock().link_up
    }

    pub fn current_mode(&self) -> Option<LinkMode> {
        self.state.lock().mode
    }

    pub fn open_socket_count(&self) -> usize {
        self.state.lock().open_sockets.len()
    }

    /// Block until at least `count` frames were sent
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.sent.len() < count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.sent.len() >= count;
            }
        }
        true
    }

    /// Poll `pred` until it holds or `timeout` elapses
    pub fn wait_for(&self, timeout: Duration, mut pred: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn check(state: &MockState, op: HwOp) -> Result<(), TransportError> {
        if !state.failing.contains(&op) {
            return Ok(());
        }
        let msg = format!("injected {:?} failure", op);
        Err(match op {
            HwOp::Send => TransportError::SendFailed(msg),
            HwOp::Receive => TransportError::ReceiveFailed(msg),
            HwOp::Open | HwOp::Bind => TransportError::ConnectionFailed(msg),
            _ => TransportError::LinkControl(msg),
        })
    }

    fn record(&self, op: HwOp, call: HwCall) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state, op)?;
        state.calls.push(call);
        Ok(())
    }
}

impl HardwareTransport for MockTransport {
    fn interface(&self) -> &str {
        "mock0"
    }

    fn supports(&self, bus: BusKind) -> bool {
        match bus {
            BusKind::Can => true,
            BusKind::J1708 => self.config.j1708,
        }
    }

    fn link_up(&self) -> Result<(), TransportError> {
        self.record(HwOp::LinkUp, HwCall::LinkUp)?;
        self.state.lock().link_up = true;
        self.changed.notify_all();
        Ok(())
    }

    fn link_down(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state, HwOp::LinkDown)?;
        state.calls.push(HwCall::LinkDown);
        state.link_up = false;
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn set_bitrate(&self, bitrate: u32) -> Result<(), TransportError> {
        self.record(HwOp::SetBitrate, HwCall::SetBitrate(bitrate))?;
        self.state.lock().bitrate = bitrate;
        Ok(())
    }

    fn set_mode(&self, mode: LinkMode) -> Result<(), TransportError> {
        self.record(HwOp::SetMode, HwCall::SetMode(mode))?;
        self.state.lock().mode = Some(mode);
        Ok(())
    }

    fn apply_filters(&self, filters: &[HardwareFilter]) -> Result<(), TransportError> {
        self.record(HwOp::ApplyFilters, HwCall::ApplyFilters(filters.to_vec()))?;
        self.state.lock().filters = filters.to_vec();
        Ok(())
    }

    fn apply_flow_controls(&self, records: &[FlowControlRecord]) -> Result<(), TransportError> {
        self.record(
            HwOp::ApplyFlowControls,
            HwCall::ApplyFlowControls(records.to_vec()),
        )?;
        self.state.lock().flow_controls = records.to_vec();
        Ok(())
    }

    fn open(&self) -> Result<SocketId, TransportError> {
        let mut state = self.state.lock();
        Self::check(&state, HwOp::Open)?;
        if !state.link_up {
            return Err(TransportError::ConnectionFailed("link is down".to_string()));
        }
        let socket = state.next_socket;
        state.next_socket += 1;
        state.open_sockets.insert(socket);
        state.calls.push(HwCall::Open(socket));
        Ok(socket)
    }

    fn bind(&self, socket: SocketId) -> Result<u32, TransportError> {
        self.record(HwOp::Bind, HwCall::Bind(socket))?;
        Ok(0)
    }

    fn close(&self, socket: SocketId) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check(&state, HwOp::Close)?;
        state.calls.push(HwCall::Close(socket));
        state.open_sockets.remove(&socket);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn send(&self, socket: &BusSocket, bus: BusKind, frame: &Frame) -> Result<(), TransportError> {
        if self.config.latency_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.latency_ms));
        }

        let mut state = self.state.lock();
        Self::check(&state, HwOp::Send)?;
        if !state.link_up || !state.open_sockets.contains(&socket.socket) {
            return Err(TransportError::ConnectionClosed);
        }
        if bus == BusKind::Can && state.mode == Some(LinkMode::ListenOnly) {
            return Err(TransportError::SendFailed(
                "link is in listen-only mode".to_string(),
            ));
        }
        tracing::debug!(%bus, %frame, "Mock transport: sent frame");
        state.sent.push((bus, frame.clone()));
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn receive(&self, socket: &BusSocket, bus: BusKind) -> Result<Frame, TransportError> {
        let mut state = self.state.lock();
        loop {
            Self::check(&state, HwOp::Receive)?;
            if !state.link_up || !state.open_sockets.contains(&socket.socket) {
                return Err(TransportError::ConnectionClosed);
            }

            // Bitrate only gates CAN; J1708 has a fixed line speed
            let audible = bus != BusKind::Can
                || state
                    .vehicle_bitrate
                    .map_or(true, |bitrate| bitrate == state.bitrate);
            let next = if audible {
                state.inbound.get_mut(&bus).and_then(VecDeque::pop_front)
            } else {
                None
            };

            if let Some(frame) = next {
                if bus == BusKind::Can
                    && !state.filters.is_empty()
                    && !state.filters.iter().any(|f| f.matches(&frame))
                {
                    continue;
                }

                // Flow-control records are answered below the application
                if bus == BusKind::Can && socket.can_transmit() {
                    let responses: Vec<Frame> = state
                        .flow_controls
                        .iter()
                        .filter(|record| record.triggers_on(&frame))
                        .filter_map(|record| record.response().ok())
                        .collect();
                    if !responses.is_empty() {
                        state
                            .sent
                            .extend(responses.into_iter().map(|r| (BusKind::Can, r)));
                        self.changed.notify_all();
                    }
                }

                return Ok(frame);
            }

            self.changed.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use vbs_core::FrameType;

    fn open_link(transport: &MockTransport, mode: LinkMode) -> BusSocket {
        transport.set_bitrate(250_000).unwrap();
        transport.set_mode(mode).unwrap();
        transport.link_up().unwrap();
        let socket = transport.open().unwrap();
        let channel = transport.bind(socket).unwrap();
        BusSocket {
            socket,
            channel,
            bitrate: 250_000,
            mode,
        }
    }

    #[test]
    fn test_receive_unblocks_on_close() {
        let transport = Arc::new(MockTransport::new(&MockConfig::default()));
        let socket = open_link(&transport, LinkMode::ListenOnly);

        let reader = {
            let transport = transport.clone();
            let socket = socket.clone();
            std::thread::spawn(move || transport.receive(&socket, BusKind::Can))
        };

        std::thread::sleep(Duration::from_millis(20));
        transport.close(socket.socket).unwrap();

        let result = reader.join().unwrap();
        assert_eq!(result, Err(TransportError::ConnectionClosed));
    }

    #[test]
    fn test_filters_drop_non_matching_frames() {
        let transport = MockTransport::new(&MockConfig::default());
        transport
            .apply_filters(&[HardwareFilter::extended(0x18FE_E000, 0x1FFF_FFFF)])
            .unwrap();
        let socket = open_link(&transport, LinkMode::ListenOnly);

        transport.inject(BusKind::Can, Frame::extended(0x0CF0_0400, vec![1]).unwrap());
        transport.inject(BusKind::Can, Frame::extended(0x18FE_E000, vec![2]).unwrap());

        let frame = transport.receive(&socket, BusKind::Can).unwrap();
        assert_eq!(frame.id(), 0x18FE_E000);
    }

    #[test]
    fn test_send_rejected_in_listen_only() {
        let transport = MockTransport::new(&MockConfig::default());
        let socket = open_link(&transport, LinkMode::ListenOnly);
        let frame = Frame::extended(0x100, vec![1]).unwrap();
        assert!(transport.send(&socket, BusKind::Can, &frame).is_err());
    }

    #[test]
    fn test_flow_control_answered_by_driver() {
        let transport = MockTransport::new(&MockConfig::default());
        let record =
            FlowControlRecord::new(0x18FE_E000, 0x18FE_E018, vec![0x10, 0x34], FrameType::Extended)
                .unwrap();
        transport.apply_flow_controls(&[record]).unwrap();
        let socket = open_link(&transport, LinkMode::Normal);

        transport.inject(BusKind::Can, Frame::extended(0x18FE_E000, vec![]).unwrap());
        transport.receive(&socket, BusKind::Can).unwrap();

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.id(), 0x18FE_E018);
    }

    #[test]
    fn test_injected_failure() {
        let transport = MockTransport::new(&MockConfig::default());
        transport.fail_on(HwOp::SetBitrate);
        assert!(matches!(
            transport.set_bitrate(500_000),
            Err(TransportError::LinkControl(_))
        ));
        assert!(transport.bitrate_history().is_empty());
    }
}

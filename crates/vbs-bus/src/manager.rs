//! Shared hardware link arbitration
//!
//! One physical transceiver, many named consumers. The manager owns the only
//! socket handle, reference-counts consumers by name, and rebuilds the link
//! whenever the consumer set changes. Every successful setup re-fires the
//! ready callback of every active consumer because the socket is replaced.
//!
//! ```text
//!   start("CAN") ─┐                         ┌─► ready("CAN")
//!   start("J1708")┼─► teardown ─► setup ─────┼─► ready("J1708")
//!   stop(..)     ─┘      │                   │
//!                        └─► terminated(..)  └─ (dispatcher thread)
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vbs_core::{BusCharacteristics, BusKind, FlowControlRecord, HardwareFilter};

use crate::dispatcher::Dispatcher;
use crate::transport::{BusSocket, HardwareTransport, TransportError};

/// Notification delivered on the dispatcher thread
pub type BusCallback = Arc<dyn Fn() + Send + Sync>;

/// Consumer whose presence decides the staged link characteristics
pub const CHARACTERISTICS_OWNER: &str = "CAN";

struct ConsumerRegistration {
    name: String,
    ready: Option<BusCallback>,
    terminated: Option<BusCallback>,
}

struct ManagerState {
    consumers: Vec<ConsumerRegistration>,
    staged: BusCharacteristics,
    link: Option<BusSocket>,
}

impl ManagerState {
    fn is_active(&self, name: &str) -> bool {
        self.consumers.iter().any(|c| c.name == name)
    }
}

/// Owner of the single hardware socket
///
/// All state lives behind one mutex that is held for the whole of a
/// start/stop/restart, so teardown always completes before the next setup
/// begins and concurrent callers are serialized.
pub struct BusResourceManager {
    transport: Arc<dyn HardwareTransport>,
    dispatcher: Arc<Dispatcher>,
    settle_delay: Duration,
    state: Mutex<ManagerState>,
}

impl BusResourceManager {
    pub fn new(
        transport: Arc<dyn HardwareTransport>,
        dispatcher: Arc<Dispatcher>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            settle_delay,
            state: Mutex::new(ManagerState {
                consumers: Vec::new(),
                staged: BusCharacteristics::blocking_default(),
                link: None,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn HardwareTransport> {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register `name` and rebuild the link
    ///
    /// Returns false without side effects if `name` is already active, and
    /// false if the hardware rejected the setup (the registration is kept so
    /// a later restart can recover).
    pub fn start(
        &self,
        name: &str,
        ready: Option<BusCallback>,
        terminated: Option<BusCallback>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.is_active(name) {
            debug!(bus = %name, "Bus already active");
            return false;
        }

        info!(bus = %name, "Starting bus");
        // A configured link cannot be reprogrammed while attached. Only the
        // consumers that held it are told it went away.
        if state.link.is_some() {
            self.teardown(&mut state);
        }
        state.consumers.push(ConsumerRegistration {
            name: name.to_string(),
            ready,
            terminated,
        });

        if !state.is_active(CHARACTERISTICS_OWNER) {
            state.staged = BusCharacteristics::blocking_default();
        }
        self.setup(&mut state)
    }

    /// Unregister `name`; the link is always torn down and rebuilt for the
    /// remaining consumers, if any
    pub fn stop(&self, name: &str) {
        let mut state = self.state.lock();
        let Some(index) = state.consumers.iter().position(|c| c.name == name) else {
            debug!(bus = %name, "Bus not active, nothing to stop");
            return;
        };

        info!(bus = %name, "Stopping bus");
        state.consumers.remove(index);
        self.teardown(&mut state);

        if state.consumers.is_empty() {
            return;
        }
        if !state.is_active(CHARACTERISTICS_OWNER) {
            state.staged = BusCharacteristics::blocking_default();
        }
        self.setup(&mut state);
    }

    /// Unregister every consumer and tear the link down once
    pub fn stop_all(&self) {
        let mut state = self.state.lock();
        info!(consumers = state.consumers.len(), "Stopping all buses");
        state.consumers.clear();
        self.teardown(&mut state);
    }

    /// Tear down, wait the settle delay, and set up again with the staged
    /// characteristics
    ///
    /// When `name` is given, its registration gets whichever of the new
    /// callbacks are provided. The settle delay sleeps on the calling thread.
    pub fn restart(
        &self,
        name: Option<&str>,
        ready: Option<BusCallback>,
        terminated: Option<BusCallback>,
    ) -> bool {
        let mut state = self.state.lock();

        if let Some(name) = name {
            if let Some(consumer) = state.consumers.iter_mut().find(|c| c.name == name) {
                if ready.is_some() {
                    consumer.ready = ready;
                }
                if terminated.is_some() {
                    consumer.terminated = terminated;
                }
            }
        }

        info!(bitrate = state.staged.bitrate, mode = state.staged.mode().as_str(), "Restarting link");
        self.teardown(&mut state);

        if state.consumers.is_empty() {
            debug!("No active consumers, link stays down");
            return false;
        }

        if !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }
        self.setup(&mut state)
    }

    /// Stage characteristics for the next setup; an open link is unaffected
    pub fn set_characteristics(
        &self,
        listen_only: bool,
        bitrate: u32,
        filters: Vec<HardwareFilter>,
        flow_controls: Vec<FlowControlRecord>,
    ) {
        self.state.lock().staged =
            BusCharacteristics::new(listen_only, bitrate, filters, flow_controls);
    }

    /// Stage a new bitrate, keeping the other characteristics
    pub fn set_bitrate(&self, bitrate: u32) {
        self.state.lock().staged.bitrate = bitrate;
    }

    /// Stage normal (read/write) mode for the next setup
    pub fn set_normal_mode(&self) {
        self.state.lock().staged.listen_only = false;
    }

    pub fn characteristics(&self) -> BusCharacteristics {
        self.state.lock().staged.clone()
    }

    /// Current link handle, `None` when no link is set up
    pub fn socket(&self) -> Option<BusSocket> {
        self.state.lock().link.clone()
    }

    /// Bitrate of the current link, 0 when no link is set up
    pub fn bitrate(&self) -> u32 {
        self.state.lock().link.as_ref().map_or(0, |link| link.bitrate)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.state.lock().is_active(name)
    }

    pub fn active_names(&self) -> Vec<String> {
        self.state
            .lock()
            .consumers
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn supports(&self, bus: BusKind) -> bool {
        self.transport.supports(bus)
    }

    fn setup(&self, state: &mut ManagerState) -> bool {
        match self.configure(&state.staged) {
            Ok(link) => {
                info!(
                    interface = self.transport.interface(),
                    socket = link.socket,
                    channel = link.channel,
                    bitrate = link.bitrate,
                    mode = link.mode.as_str(),
                    "Link set up"
                );
                state.link = Some(link);
                for consumer in &state.consumers {
                    if let Some(ready) = &consumer.ready {
                        let ready = ready.clone();
                        self.dispatcher
                            .post_coalesced(format!("ready:{}", consumer.name), move || ready());
                    }
                }
                true
            }
            Err(e) => {
                error!(
                    interface = self.transport.interface(),
                    bitrate = state.staged.bitrate,
                    error = %e,
                    "Link setup failed"
                );
                state.link = None;
                if let Err(e) = self.transport.link_down() {
                    debug!(error = %e, "Link down after failed setup");
                }
                false
            }
        }
    }

    fn configure(&self, staged: &BusCharacteristics) -> Result<BusSocket, TransportError> {
        let transport = &self.transport;
        let mode = staged.mode();

        transport.link_down()?;
        transport.set_bitrate(staged.bitrate)?;
        transport.set_mode(mode)?;
        transport.apply_filters(&staged.filters)?;
        transport.apply_flow_controls(&staged.flow_controls)?;
        transport.link_up()?;

        let socket = transport.open()?;
        let channel = match transport.bind(socket) {
            Ok(channel) => channel,
            Err(e) => {
                let _ = transport.close(socket);
                return Err(e);
            }
        };

        Ok(BusSocket {
            socket,
            channel,
            bitrate: staged.bitrate,
            mode,
        })
    }

    fn teardown(&self, state: &mut ManagerState) {
        let Some(link) = state.link.take() else {
            return;
        };

        if let Err(e) = self.transport.close(link.socket) {
            warn!(socket = link.socket, error = %e, "Socket close failed");
        }
        if let Err(e) = self.transport.link_down() {
            warn!(error = %e, "Link down failed");
        }
        debug!(socket = link.socket, "Link torn down");

        for consumer in &state.consumers {
            if let Some(terminated) = &consumer.terminated {
                let terminated = terminated.clone();
                self.dispatcher.post_coalesced(
                    format!("terminated:{}", consumer.name),
                    move || terminated(),
                );
            }
        }
    }
}

impl Drop for BusResourceManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(link) = state.link.take() {
            let _ = self.transport.close(link.socket);
            let _ = self.transport.link_down();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use vbs_core::{FrameType, LinkMode};

    use crate::config::MockConfig;
    use crate::transport::mock::{HwCall, HwOp, MockTransport};

    fn fixture() -> (Arc<MockTransport>, BusResourceManager) {
        let transport = Arc::new(MockTransport::new(&MockConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new().unwrap());
        let manager = BusResourceManager::new(transport.clone(), dispatcher, Duration::ZERO);
        (transport, manager)
    }

    fn counter() -> (Arc<AtomicUsize>, BusCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_active_names_follow_start_stop() {
        let (_transport, manager) = fixture();

        assert!(manager.start("CAN", None, None));
        assert!(!manager.start("CAN", None, None));
        assert!(manager.start("J1708", None, None));
        manager.stop("NOPE");
        assert_eq!(manager.active_names(), vec!["CAN", "J1708"]);

        manager.stop("CAN");
        assert_eq!(manager.active_names(), vec!["J1708"]);
        assert!(manager.socket().is_some());

        manager.stop("J1708");
        assert!(manager.active_names().is_empty());
        assert!(manager.socket().is_none());
        assert_eq!(manager.bitrate(), 0);
    }

    #[test]
    fn test_setup_sequence() {
        let (transport, manager) = fixture();
        let filters = vec![HardwareFilter::extended(0x18FE_E000, 0x00FF_FF00)];
        manager.set_characteristics(false, 500_000, filters.clone(), Vec::new());

        assert!(manager.start("CAN", None, None));

        let socket = manager.socket().unwrap();
        assert_eq!(
            transport.calls(),
            vec![
                HwCall::LinkDown,
                HwCall::SetBitrate(500_000),
                HwCall::SetMode(LinkMode::Normal),
                HwCall::ApplyFilters(filters),
                HwCall::ApplyFlowControls(Vec::new()),
                HwCall::LinkUp,
                HwCall::Open(socket.socket),
                HwCall::Bind(socket.socket),
            ]
        );
        assert_eq!(manager.bitrate(), 500_000);
    }

    #[test]
    fn test_blocking_default_without_owner() {
        let (transport, manager) = fixture();
        manager.set_characteristics(false, 500_000, Vec::new(), Vec::new());

        assert!(manager.start("J1708", None, None));

        let staged = manager.characteristics();
        assert_eq!(staged, BusCharacteristics::blocking_default());
        assert_eq!(transport.current_mode(), Some(LinkMode::ListenOnly));
        assert!(staged
            .filters
            .iter()
            .any(|f| f.frame_type == FrameType::Standard && f.mask == 0x7FF));
    }

    #[test]
    fn test_ready_fires_for_every_consumer_on_setup() {
        let (_transport, manager) = fixture();
        let (can_ready, can_cb) = counter();
        let (j_ready, j_cb) = counter();

        manager.start("CAN", Some(can_cb), None);
        manager.dispatcher().flush();
        manager.start("J1708", Some(j_cb), None);
        manager.dispatcher().flush();

        assert_eq!(can_ready.load(Ordering::SeqCst), 2);
        assert_eq!(j_ready.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_fires_terminated_for_remaining_only() {
        let (_transport, manager) = fixture();
        let (can_term, can_cb) = counter();
        let (j_term, j_cb) = counter();

        manager.start("CAN", None, Some(can_cb));
        manager.start("J1708", None, Some(j_cb));
        manager.dispatcher().flush();
        let before = can_term.load(Ordering::SeqCst);

        manager.stop("J1708");
        manager.dispatcher().flush();

        assert_eq!(can_term.load(Ordering::SeqCst), before + 1);
        assert_eq!(j_term.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_joining_consumer_not_told_of_previous_link() {
        let (transport, manager) = fixture();
        let (can_term, can_cb) = counter();
        let (j_term, j_cb) = counter();

        manager.start("CAN", None, Some(can_cb));
        manager.dispatcher().flush();
        manager.start("J1708", None, Some(j_cb));
        manager.dispatcher().flush();

        assert_eq!(can_term.load(Ordering::SeqCst), 1);
        assert_eq!(j_term.load(Ordering::SeqCst), 0);
        assert!(transport.is_link_up());
    }

    #[test]
    fn test_stop_refires_ready_for_remaining() {
        let (transport, manager) = fixture();
        let (can_ready, can_cb) = counter();
        let (j_ready, j_cb) = counter();

        manager.start("CAN", Some(can_cb), None);
        manager.start("J1708", Some(j_cb), None);
        manager.dispatcher().flush();
        let can_before = can_ready.load(Ordering::SeqCst);
        let j_before = j_ready.load(Ordering::SeqCst);

        manager.stop("CAN");
        manager.dispatcher().flush();

        assert_eq!(j_ready.load(Ordering::SeqCst), j_before + 1);
        assert_eq!(can_ready.load(Ordering::SeqCst), can_before);
        assert_eq!(manager.active_names(), vec!["J1708".to_string()]);
        assert!(transport.is_link_up());
    }

    #[test]
    fn test_stop_all_tears_down_once() {
        let (transport, manager) = fixture();
        manager.start("CAN", None, None);
        manager.start("J1708", None, None);
        let closes_before = transport
            .calls()
            .iter()
            .filter(|c| matches!(c, HwCall::Close(_)))
            .count();

        manager.stop_all();

        let closes_after = transport
            .calls()
            .iter()
            .filter(|c| matches!(c, HwCall::Close(_)))
            .count();
        assert_eq!(closes_after, closes_before + 1);
        assert!(!transport.is_link_up());
        assert!(manager.active_names().is_empty());
    }

    #[test]
    fn test_setup_failure_leaves_no_link() {
        let (transport, manager) = fixture();
        transport.fail_on(HwOp::SetBitrate);

        assert!(!manager.start("CAN", None, None));
        assert!(manager.socket().is_none());
        assert!(!transport.is_link_up());
        assert_eq!(manager.active_names(), vec!["CAN"]);

        transport.clear_failures();
        assert!(manager.restart(None, None, None));
        assert!(manager.socket().is_some());
    }

    #[test]
    fn test_restart_swaps_callbacks_and_rebuilds() {
        let (transport, manager) = fixture();
        let (old_ready, old_cb) = counter();
        let (new_ready, new_cb) = counter();

        manager.start("CAN", Some(old_cb), None);
        manager.dispatcher().flush();
        let first = manager.socket().unwrap();

        manager.set_bitrate(500_000);
        assert!(manager.restart(Some("CAN"), Some(new_cb), None));
        manager.dispatcher().flush();

        let second = manager.socket().unwrap();
        assert_ne!(first.socket, second.socket);
        assert_eq!(second.bitrate, 500_000);
        assert_eq!(old_ready.load(Ordering::SeqCst), 1);
        assert_eq!(new_ready.load(Ordering::SeqCst), 1);
        assert_eq!(transport.bitrate_history(), vec![250_000, 500_000]);
    }

    #[test]
    fn test_restart_without_consumers_stays_down() {
        let (transport, manager) = fixture();
        assert!(!manager.restart(None, None, None));
        assert!(!transport.is_link_up());
    }
}

//! Vehicle bus service
//!
//! Composes the resource manager, the CAN and J1708 controllers, persistence
//! and the broadcast sink. Every start and stop is mirrored to persistence so
//! [`VehicleBusService::start_from_state`] can bring the buses back after a
//! crash or reboot.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use vbs_core::{
    parse_can_id, BusEvent, BusStatus, Frame, FrameType, HardwareFilter, VbsError, VbsResult,
    DEFAULT_BITRATE,
};

use crate::can::{CanBus, CanStartRequest};
use crate::config::{PortConfig, VbsConfig};
use crate::discovery::DiscoveryController;
use crate::dispatcher::{Dispatcher, TimerHandle};
use crate::j1708::J1708Bus;
use crate::manager::BusResourceManager;
use crate::sink::BroadcastSink;
use crate::state::{FileStateStore, MemoryStateStore, PersistenceGateway, StateKey};
use crate::transport::{create_transport, HardwareTransport};

pub struct VehicleBusService {
    config: VbsConfig,
    dispatcher: Arc<Dispatcher>,
    manager: Arc<BusResourceManager>,
    persistence: Arc<dyn PersistenceGateway>,
    sink: BroadcastSink,
    can: Arc<CanBus>,
    j1708: Arc<J1708Bus>,
    status_timer: Mutex<Option<TimerHandle>>,
    this: Weak<VehicleBusService>,
}

impl VehicleBusService {
    /// Build the service from configuration, creating the configured
    /// transport and state store
    pub fn new(config: VbsConfig) -> VbsResult<Arc<Self>> {
        config.validate()?;
        let transport = create_transport(&config.transport)?;
        let persistence: Arc<dyn PersistenceGateway> = match &config.state_path {
            Some(path) => Arc::new(FileStateStore::open(path)),
            None => Arc::new(MemoryStateStore::new()),
        };
        Self::with_parts(config, transport, persistence)
    }

    /// Build the service around an existing transport and state store
    pub fn with_parts(
        config: VbsConfig,
        transport: Arc<dyn HardwareTransport>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> VbsResult<Arc<Self>> {
        let dispatcher = Arc::new(Dispatcher::new()?);
        let manager = Arc::new(BusResourceManager::new(
            transport,
            dispatcher.clone(),
            config.settle_delay(),
        ));
        let sink = BroadcastSink::default();
        let discovery =
            DiscoveryController::new(manager.clone(), persistence.clone(), config.discovery.clone());
        let can = CanBus::new(
            manager.clone(),
            discovery,
            persistence.clone(),
            sink.clone(),
            config.queue_capacity,
            config.write_idle(),
        );
        let j1708 = J1708Bus::new(
            manager.clone(),
            sink.clone(),
            config.queue_capacity,
            config.write_idle(),
        );

        info!(
            interface = manager.transport().interface(),
            j1708 = j1708.is_supported(),
            "Vehicle bus service created"
        );

        Ok(Arc::new_cyclic(|this| Self {
            config,
            dispatcher,
            manager,
            persistence,
            sink,
            can,
            j1708,
            status_timer: Mutex::new(None),
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &VbsConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<BusResourceManager> {
        &self.manager
    }

    pub fn can(&self) -> &Arc<CanBus> {
        &self.can
    }

    pub fn j1708(&self) -> &Arc<J1708Bus> {
        &self.j1708
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceGateway> {
        &self.persistence
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BusEvent> {
        self.sink.subscribe()
    }

    /// Remember the CAN settings, then (re)start CAN
    pub fn start_can(&self, request: CanStartRequest) -> VbsResult<()> {
        self.save_can(&request);
        let result = self.can.start(request);
        self.ensure_status_timer();
        result
    }

    pub fn stop_can(&self) {
        self.persistence.put_int(StateKey::CanEnabled, 0);
        self.can.stop();
    }

    pub fn start_j1708(&self) -> VbsResult<()> {
        self.persistence.put_int(StateKey::J1708Enabled, 1);
        let result = self.j1708.start();
        self.ensure_status_timer();
        result
    }

    pub fn stop_j1708(&self) {
        self.persistence.put_int(StateKey::J1708Enabled, 0);
        self.j1708.stop();
    }

    /// Stop every bus with a single link teardown
    ///
    /// Enabled flags are left alone so a later resume brings the same buses
    /// back.
    pub fn stop_all(&self) {
        self.can.stop_all();
        self.j1708.stop_all();
        if let Some(timer) = self.status_timer.lock().take() {
            timer.cancel();
        }
    }

    /// Resume whatever buses were enabled when the state was last written
    ///
    /// CAN comes up before J1708 so J1708 joins the CAN link instead of
    /// forcing a second rebuild. A bus that cannot start is logged and
    /// skipped; the first such error is returned after both were tried.
    pub fn start_from_state(&self) -> VbsResult<()> {
        let can_enabled = self.persistence.get_int(StateKey::CanEnabled) != 0;
        let j1708_enabled = self.persistence.get_int(StateKey::J1708Enabled) != 0;
        info!(can = can_enabled, j1708 = j1708_enabled, "Resuming buses from saved state");

        self.stop_all();
        let mut first_error = None;

        if can_enabled {
            let result = self.saved_can_request().and_then(|request| {
                self.can.load_confirmed_bitrate();
                self.can.start(request)
            });
            if let Err(e) = result {
                error!(error = %e, "Not resuming CAN");
                first_error.get_or_insert(e);
            }
        }

        if j1708_enabled {
            if let Err(e) = self.j1708.start() {
                error!(error = %e, "Not resuming J1708");
                first_error.get_or_insert(e);
            }
        }

        self.ensure_status_timer();
        first_error.map_or(Ok(()), Err)
    }

    /// Snapshot of worker readiness
    pub fn status(&self) -> BusStatus {
        BusStatus {
            can_rx_ready: self.can.is_read_ready(),
            can_tx_ready: self.can.is_write_ready(),
            can_bitrate: if self.can.is_started() { self.can.bitrate() } else { 0 },
            j1708_rx_ready: self.j1708.is_read_ready(),
            j1708_tx_ready: self.j1708.is_write_ready(),
        }
    }

    /// Queue an extended CAN frame; empty payloads are ignored
    ///
    /// Returns whether the frame was queued.
    pub fn transmit_can(&self, id: u32, data: Vec<u8>) -> VbsResult<bool> {
        if data.is_empty() {
            debug!(id = format!("0x{:08X}", id), "Ignoring CAN transmit without data");
            return Ok(false);
        }
        debug!(id = format!("0x{:08X}", id), data = %hex::encode(&data), "CAN transmit");
        let frame = Frame::extended(id, data)?;
        let queued = self.can.send_frame(frame);
        if !queued {
            warn!(id = format!("0x{:08X}", id), "CAN transmit queue full, frame dropped");
        }
        Ok(queued)
    }

    /// Queue a J1708 message; empty payloads are ignored
    pub fn transmit_j1708(&self, priority: u8, id: u32, data: Vec<u8>) -> VbsResult<bool> {
        if data.is_empty() {
            debug!(mid = id, "Ignoring J1708 transmit without data");
            return Ok(false);
        }
        let frame = Frame::j1708(priority, id, data)?;
        let queued = self.j1708.send_frame(frame);
        if !queued {
            warn!(mid = id, "J1708 transmit queue full, message dropped");
        }
        Ok(queued)
    }

    fn save_can(&self, request: &CanStartRequest) {
        let ids: Vec<String> = request.filters.iter().map(|f| format!("0x{:X}", f.id)).collect();
        let masks: Vec<String> = request.filters.iter().map(|f| format!("0x{:X}", f.mask)).collect();
        let types: Vec<String> = request
            .filters
            .iter()
            .map(|f| f.frame_type.code().to_string())
            .collect();

        let p = &self.persistence;
        p.put_int(StateKey::CanEnabled, 1);
        p.put_int(StateKey::CanBitrate, i64::from(request.bitrate));
        p.put_int(StateKey::CanAutoDetect, i64::from(request.auto_detect));
        p.put_string(StateKey::CanFilterIds, &ids.join(","));
        p.put_string(StateKey::CanFilterMasks, &masks.join(","));
        p.put_string(StateKey::CanFilterTypes, &types.join(","));
        p.put_flow_controls(&request.flow_controls);
    }

    fn saved_can_request(&self) -> VbsResult<CanStartRequest> {
        let p = &self.persistence;
        let ids = parse_id_list(&p.get_string(StateKey::CanFilterIds))?;
        let masks = parse_id_list(&p.get_string(StateKey::CanFilterMasks))?;
        let mut filters = HardwareFilter::combine(&ids, &masks)?;

        // State written before types were recorded holds extended filters only
        let types = parse_type_list(&p.get_string(StateKey::CanFilterTypes))?;
        if !types.is_empty() {
            if types.len() != filters.len() {
                return Err(VbsError::InvalidFilter(format!(
                    "{} saved filter types for {} filters",
                    types.len(),
                    filters.len()
                )));
            }
            for (filter, frame_type) in filters.iter_mut().zip(types) {
                filter.frame_type = frame_type;
            }
        }

        let bitrate = match u32::try_from(p.get_int(StateKey::CanBitrate)) {
            Ok(0) | Err(_) => DEFAULT_BITRATE,
            Ok(bitrate) => bitrate,
        };

        Ok(CanStartRequest {
            bitrate,
            auto_detect: p.get_int(StateKey::CanAutoDetect) != 0,
            skip_verify: false,
            filters,
            flow_controls: p.get_flow_controls(),
        })
    }

    /// Arm the status broadcast unless it is already running
    fn ensure_status_timer(&self) {
        if !self.any_started() {
            return;
        }
        let mut timer = self.status_timer.lock();
        if timer.is_none() {
            debug!(interval_ms = self.config.status_interval_ms, "Starting status broadcasts");
            *timer = Some(self.arm_status());
        }
    }

    fn arm_status(&self) -> TimerHandle {
        let this = self.this.clone();
        self.dispatcher
            .post_delayed(self.config.status_interval(), move || {
                if let Some(service) = this.upgrade() {
                    service.on_status_tick();
                }
            })
    }

    fn on_status_tick(&self) {
        let mut timer = self.status_timer.lock();
        if !self.any_started() {
            debug!("No bus started, stopping status broadcasts");
            *timer = None;
            return;
        }
        self.sink.status(self.status());
        *timer = Some(self.arm_status());
    }

    fn any_started(&self) -> bool {
        self.can.is_started() || self.j1708.is_started()
    }
}

impl Drop for VehicleBusService {
    fn drop(&mut self) {
        if let Some(timer) = self.status_timer.get_mut().take() {
            timer.cancel();
        }
        self.dispatcher.shutdown();
    }
}

/// Build a CAN start request from a port definition
pub fn can_request_from_port(port: &PortConfig, with_flow_controls: bool) -> VbsResult<CanStartRequest> {
    let filters = port.hardware_filters();
    if filters.is_empty() {
        return Err(VbsError::InvalidFilter(format!("port '{}' has no filters", port.name)));
    }
    let flow_controls = if with_flow_controls {
        port.flow_control_records()?
    } else {
        Vec::new()
    };
    Ok(CanStartRequest {
        bitrate: port.baudrate,
        auto_detect: port.autobaud,
        skip_verify: port.skip_verify,
        filters,
        flow_controls,
    })
}

/// Parse a persisted comma list such as `"0x18FEE000,0x7E0"`
fn parse_id_list(s: &str) -> VbsResult<Vec<u32>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            parse_can_id(part)
                .map_err(|e| VbsError::InvalidFilter(format!("malformed saved filter: {}", e)))
        })
        .collect()
}

fn parse_type_list(s: &str) -> VbsResult<Vec<FrameType>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .ok()
                .and_then(FrameType::from_code)
                .ok_or_else(|| {
                    VbsError::InvalidFilter(format!("malformed saved filter type: '{}'", part))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;
    use vbs_core::FlowControlRecord;

    use crate::config::{MockConfig, TransportConfig};
    use crate::transport::mock::MockTransport;

    fn config() -> VbsConfig {
        VbsConfig {
            settle_delay_ms: 0,
            status_interval_ms: 20,
            write_idle_ms: 1,
            ..Default::default()
        }
    }

    fn fixture(store: Arc<MemoryStateStore>) -> (Arc<MockTransport>, Arc<VehicleBusService>) {
        let transport = Arc::new(MockTransport::new(&MockConfig {
            j1708: true,
            ..Default::default()
        }));
        let service = VehicleBusService::with_parts(config(), transport.clone(), store).unwrap();
        (transport, service)
    }

    fn request() -> CanStartRequest {
        CanStartRequest {
            bitrate: 500_000,
            filters: vec![
                HardwareFilter::extended(0x18FE_E000, 0x1FFF_FF00),
                HardwareFilter::extended(0x7E0, 0x7FF),
            ],
            flow_controls: vec![FlowControlRecord::new(
                0x18DA_00F1,
                0x18DA_F100,
                vec![0x30, 0, 0],
                FrameType::Extended,
            )
            .unwrap()],
            ..Default::default()
        }
    }

    fn wait(pred: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !pred() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    #[test]
    fn test_start_can_persists_settings() {
        let store = Arc::new(MemoryStateStore::new());
        let (_transport, service) = fixture(store.clone());
        service.start_can(request()).unwrap();

        assert_eq!(store.get_int(StateKey::CanEnabled), 1);
        assert_eq!(store.get_int(StateKey::CanBitrate), 500_000);
        assert_eq!(store.get_int(StateKey::CanAutoDetect), 0);
        assert_eq!(store.get_string(StateKey::CanFilterIds), "0x18FEE000,0x7E0");
        assert_eq!(store.get_string(StateKey::CanFilterMasks), "0x1FFFFF00,0x7FF");
        assert_eq!(store.get_flow_controls(), request().flow_controls);

        service.stop_can();
        assert_eq!(store.get_int(StateKey::CanEnabled), 0);
    }

    #[test]
    fn test_resume_from_state() {
        let store = Arc::new(MemoryStateStore::new());
        {
            let (_transport, service) = fixture(store.clone());
            service
                .start_can(CanStartRequest {
                    skip_verify: true,
                    ..request()
                })
                .unwrap();
            service.start_j1708().unwrap();
            service.stop_all();
        }

        let (transport, service) = fixture(store.clone());
        service.start_from_state().unwrap();

        // Confirmed bitrate was reloaded, so CAN comes back read/write
        assert!(wait(|| service.status().can_tx_ready && service.status().j1708_rx_ready));
        assert_eq!(service.can().confirmed_bitrate(), 500_000);
        assert_eq!(transport.current_mode(), Some(vbs_core::LinkMode::Normal));
        assert_eq!(
            service.manager().active_names(),
            vec!["CAN".to_string(), "J1708".to_string()]
        );
    }

    #[test]
    fn test_resume_keeps_standard_filters() {
        let store = Arc::new(MemoryStateStore::new());
        let filters = vec![
            HardwareFilter::new(0x7E8, 0x7FF, FrameType::Standard),
            HardwareFilter::extended(0x18FE_E000, 0x1FFF_FF00),
        ];
        {
            let (_transport, service) = fixture(store.clone());
            service
                .start_can(CanStartRequest {
                    skip_verify: true,
                    filters: filters.clone(),
                    ..request()
                })
                .unwrap();
            service.stop_all();
        }
        assert_eq!(store.get_string(StateKey::CanFilterTypes), "0,1");

        let (_transport, service) = fixture(store);
        service.start_from_state().unwrap();

        assert!(wait(|| service.status().can_tx_ready));
        assert_eq!(service.manager().characteristics().filters, filters);
    }

    #[test]
    fn test_resume_without_types_uses_extended() {
        let store = Arc::new(MemoryStateStore::new());
        store.put_int(StateKey::CanEnabled, 1);
        store.put_int(StateKey::CanBitrate, 250_000);
        store.put_string(StateKey::CanFilterIds, "0x7E8");
        store.put_string(StateKey::CanFilterMasks, "0x7FF");

        let (_transport, service) = fixture(store);
        service.start_from_state().unwrap();

        assert!(wait(|| service.can().is_read_ready()));
        assert_eq!(
            service.manager().characteristics().filters,
            vec![HardwareFilter::extended(0x7E8, 0x7FF)]
        );
    }

    #[test]
    fn test_resume_refuses_mismatched_types() {
        let store = Arc::new(MemoryStateStore::new());
        store.put_int(StateKey::CanEnabled, 1);
        store.put_string(StateKey::CanFilterIds, "0x100,0x200");
        store.put_string(StateKey::CanFilterMasks, "0x7FF,0x7FF");
        store.put_string(StateKey::CanFilterTypes, "0");

        let (transport, service) = fixture(store.clone());
        assert!(matches!(service.start_from_state(), Err(VbsError::InvalidFilter(_))));

        store.put_string(StateKey::CanFilterTypes, "0,7");
        assert!(matches!(service.start_from_state(), Err(VbsError::InvalidFilter(_))));
        assert!(!service.can().is_started());
        assert!(!transport.is_link_up());
    }

    #[test]
    fn test_resume_refuses_malformed_filters() {
        let store = Arc::new(MemoryStateStore::new());
        store.put_int(StateKey::CanEnabled, 1);
        store.put_string(StateKey::CanFilterIds, "0x100,zz");
        store.put_string(StateKey::CanFilterMasks, "0x7FF,0x7FF");

        let (transport, service) = fixture(store);
        assert!(matches!(service.start_from_state(), Err(VbsError::InvalidFilter(_))));
        assert!(!service.can().is_started());
        assert!(!transport.is_link_up());
    }

    #[test]
    fn test_transmit_ignores_empty_payload() {
        let (_transport, service) = fixture(Arc::new(MemoryStateStore::new()));
        assert!(!service.transmit_can(0x18FE_E000, Vec::new()).unwrap());
        assert!(service.can().queue().is_empty());
        assert!(service.transmit_can(0x18FE_E000, vec![1]).unwrap());
        assert_eq!(service.can().queue().len(), 1);
        assert!(service.transmit_j1708(8, 0x300, vec![1]).is_err());
    }

    #[test]
    fn test_status_broadcast_while_started() {
        let (_transport, service) = fixture(Arc::new(MemoryStateStore::new()));
        let mut events = service.subscribe();
        service.start_j1708().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        let status = loop {
            match events.try_recv() {
                Ok(BusEvent::Status { status, .. }) if status.j1708_rx_ready => break status,
                Ok(_) => {}
                Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("no status event: {:?}", e),
            }
        };
        assert!(!status.can_rx_ready);
        assert_eq!(status.can_bitrate, 0);

        service.stop_j1708();
        assert!(wait(|| service.status_timer.lock().is_none()));
    }

    #[test]
    fn test_new_with_mock_transport() {
        let service = VehicleBusService::new(VbsConfig {
            transport: TransportConfig::Mock(MockConfig::default()),
            ..config()
        })
        .unwrap();
        assert!(!service.j1708().is_supported());
        assert_eq!(service.status(), BusStatus::default());
    }

    #[test]
    fn test_request_from_port() {
        let port: PortConfig = toml::from_str(
            r#"
name = "CAN"
baudrate = 500000
autobaud = true

[[filters]]
id = "0x18FEE000"
mask = "0x1FFFFF00"
"#,
        )
        .unwrap();
        let request = can_request_from_port(&port, true).unwrap();
        assert_eq!(request.bitrate, 500_000);
        assert!(request.auto_detect);
        assert_eq!(request.filters, vec![HardwareFilter::extended(0x18FE_E000, 0x1FFF_FF00)]);

        let empty = PortConfig { filters: Vec::new(), ..port };
        assert!(can_request_from_port(&empty, false).is_err());
    }
}

//! Vehicle bus service configuration
//!
//! Loaded from TOML or YAML (chosen by file extension). Every field has a
//! serde default so an empty file yields a runnable mock configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vbs_core::{
    parse_payload, FlowControlRecord, FrameType, HardwareFilter, VbsError, VbsResult,
    DEFAULT_BITRATE,
};

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VbsConfig {
    /// Hardware transport
    #[serde(default)]
    pub transport: TransportConfig,
    /// Pause between teardown and setup on restart (milliseconds)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Interval of the periodic status broadcast (milliseconds)
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Capacity of each outgoing frame queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Write worker sleep when its queue is empty (milliseconds)
    #[serde(default = "default_write_idle_ms")]
    pub write_idle_ms: u64,
    /// Bitrate discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// JSON file holding persisted bus state; in-memory when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
    /// Named port definitions (filters and flow controls)
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_status_interval_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    10
}

fn default_write_idle_ms() -> u64 {
    5
}

impl Default for VbsConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            settle_delay_ms: default_settle_delay_ms(),
            status_interval_ms: default_status_interval_ms(),
            queue_capacity: default_queue_capacity(),
            write_idle_ms: default_write_idle_ms(),
            discovery: DiscoveryConfig::default(),
            state_path: None,
            ports: Vec::new(),
        }
    }
}

impl VbsConfig {
    /// Load configuration from a TOML or YAML file
    pub fn load(path: &Path) -> VbsResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VbsError::Config(format!("{}: {}", path.display(), e)))?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .map_err(|e| VbsError::Config(format!("{}: {}", path.display(), e)))?,
            _ => toml::from_str(&content)
                .map_err(|e| VbsError::Config(format!("{}: {}", path.display(), e)))?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VbsResult<()> {
        if self.queue_capacity == 0 {
            return Err(VbsError::Config("queue_capacity must be at least 1".into()));
        }
        self.discovery.validate()?;
        for port in &self.ports {
            port.flow_control_records()?;
        }
        Ok(())
    }

    /// Look up a port definition by name (case-insensitive)
    pub fn port(&self, name: &str) -> Option<&PortConfig> {
        self.ports.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn write_idle(&self) -> Duration {
        Duration::from_millis(self.write_idle_ms)
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw SocketCAN (Linux only)
    SocketCan(SocketCanConfig),
    /// Mock transport for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Sleep between nonblocking reads while no frame is pending; bounds how
    /// long a closed socket keeps a reader blocked
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_interface() -> String {
    "can0".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1
}

impl Default for SocketCanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated send latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// Whether the simulated hardware carries a J1708 channel
    #[serde(default)]
    pub j1708: bool,
    /// Bitrate of the simulated vehicle bus; frames are only decoded while
    /// the link matches it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_bitrate: Option<u32>,
}

// =============================================================================
// Discovery Configuration
// =============================================================================

/// Bitrate discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Time spent listening on each candidate (milliseconds)
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Number of windows before parking on the current candidate
    #[serde(default = "default_max_windows")]
    pub max_windows: u32,
    /// Candidate bitrates, tried in order and cycled
    #[serde(default = "default_candidates")]
    pub candidates: Vec<u32>,
}

fn default_window_ms() -> u64 {
    5000
}

fn default_max_windows() -> u32 {
    3
}

fn default_candidates() -> Vec<u32> {
    vec![250_000, 500_000]
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_windows: default_max_windows(),
            candidates: default_candidates(),
        }
    }
}

impl DiscoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn validate(&self) -> VbsResult<()> {
        if self.candidates.is_empty() {
            return Err(VbsError::Config(
                "discovery needs at least one candidate bitrate".into(),
            ));
        }
        if self.candidates.contains(&0) {
            return Err(VbsError::Config("discovery candidate bitrate of 0".into()));
        }
        if self.max_windows == 0 {
            return Err(VbsError::Config("discovery max_windows must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Port Configuration
// =============================================================================

/// A named port definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port name (e.g., "CAN", "J1708")
    pub name: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Cycle the discovery candidates instead of verifying `baudrate`
    #[serde(default)]
    pub autobaud: bool,
    /// Trust `baudrate` and start in normal mode right away
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(default)]
    pub flow_controls: Vec<FlowControlConfig>,
}

fn default_baudrate() -> u32 {
    DEFAULT_BITRATE
}

impl PortConfig {
    pub fn hardware_filters(&self) -> Vec<HardwareFilter> {
        self.filters
            .iter()
            .map(|f| HardwareFilter::new(f.id, f.mask, f.frame_type))
            .collect()
    }

    /// Flow-control records in declaration order
    pub fn flow_control_records(&self) -> VbsResult<Vec<FlowControlRecord>> {
        self.flow_controls
            .iter()
            .map(|fc| FlowControlRecord::new(fc.search_id, fc.response_id, fc.data.clone(), fc.frame_type))
            .collect()
    }
}

/// Receive filter entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub id: u32,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub mask: u32,
    #[serde(rename = "type", default, deserialize_with = "deserialize_frame_type")]
    pub frame_type: FrameType,
}

/// Flow-control entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowControlConfig {
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub search_id: u32,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    pub response_id: u32,
    /// Response payload (supports "0x10, 0x34" or [16, 52])
    #[serde(default, deserialize_with = "deserialize_payload")]
    pub data: Vec<u8>,
    #[serde(rename = "type", default, deserialize_with = "deserialize_frame_type")]
    pub frame_type: FrameType,
}

/// Deserialize a u32 id (supports "0x18FEE000", "1234" or 1234)
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Hex(String),
        Int(u32),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Hex(s) => vbs_core::parse_can_id(&s).map_err(|e| D::Error::custom(e.to_string())),
    }
}

/// Deserialize a payload (supports "0x10, 0x34" or [16, 52])
fn deserialize_payload<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Text(String),
        Array(Vec<u8>),
    }

    match Payload::deserialize(deserializer)? {
        Payload::Array(bytes) => Ok(bytes),
        Payload::Text(s) => parse_payload(&s).map_err(|e| D::Error::custom(e.to_string())),
    }
}

/// Deserialize a frame type (supports "extended", "standard", 0 or 1)
fn deserialize_frame_type<'de, D>(deserializer: D) -> Result<FrameType, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TypeOrCode {
        Code(i64),
        Name(FrameType),
    }

    match TypeOrCode::deserialize(deserializer)? {
        TypeOrCode::Name(t) => Ok(t),
        TypeOrCode::Code(code) => FrameType::from_code(code)
            .ok_or_else(|| D::Error::custom(format!("invalid frame type code {}", code))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: VbsConfig = toml::from_str("").unwrap();
        assert_eq!(config.settle_delay_ms, 500);
        assert_eq!(config.status_interval_ms, 1000);
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.write_idle_ms, 5);
        assert_eq!(config.discovery.window_ms, 5000);
        assert_eq!(config.discovery.max_windows, 3);
        assert_eq!(config.discovery.candidates, vec![250_000, 500_000]);
        assert!(matches!(config.transport, TransportConfig::Mock(_)));
    }

    #[test]
    fn test_parse_toml_ports() {
        let toml = r#"
settle_delay_ms = 250

[transport]
type = "socketcan"
interface = "can1"

[[ports]]
name = "CAN"
baudrate = 500000
autobaud = true

[[ports.filters]]
id = "0x18FEE000"
mask = "0x00FFFF00"
type = 1

[[ports.flow_controls]]
search_id = "0x18DA00F1"
response_id = "0x18DAF100"
data = "0x30, 0x00, 0x00"
type = "extended"
"#;
        let config: VbsConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        match &config.transport {
            TransportConfig::SocketCan(cfg) => {
                assert_eq!(cfg.interface, "can1");
                assert_eq!(cfg.poll_interval_ms, 1);
            }
            other => panic!("unexpected transport {:?}", other),
        }

        let port = config.port("can").unwrap();
        assert_eq!(port.baudrate, 500_000);
        assert!(port.autobaud);
        assert_eq!(
            port.hardware_filters(),
            vec![HardwareFilter::extended(0x18FE_E000, 0x00FF_FF00)]
        );

        let records = port.flow_control_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].search_id, 0x18DA_00F1);
        assert_eq!(records[0].data, vec![0x30, 0x00, 0x00]);
    }

    #[test]
    fn test_parse_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
transport:
  type: mock
  j1708: true
discovery:
  window_ms: 1000
ports:
  - name: CAN
    filters:
      - id: 0
        mask: 0
        type: standard
    flow_controls:
      - search_id: "0x7E0"
        response_id: "0x7E8"
        data: [48, 0, 0]
        type: 0
"#
        )
        .unwrap();

        let config = VbsConfig::load(file.path()).unwrap();
        assert_eq!(config.discovery.window_ms, 1000);
        assert_eq!(config.discovery.max_windows, 3);
        match &config.transport {
            TransportConfig::Mock(cfg) => assert!(cfg.j1708),
            other => panic!("unexpected transport {:?}", other),
        }

        let port = config.port("CAN").unwrap();
        assert_eq!(port.filters[0].frame_type, FrameType::Standard);
        let records = port.flow_control_records().unwrap();
        assert_eq!(records[0].search_id, 0x7E0);
        assert_eq!(records[0].message_type, FrameType::Standard);
    }

    #[test]
    fn test_validate_rejects_bad_discovery() {
        let mut config = VbsConfig::default();
        config.discovery.candidates.clear();
        assert!(config.validate().is_err());

        let mut config = VbsConfig::default();
        config.discovery.max_windows = 0;
        assert!(config.validate().is_err());

        let mut config = VbsConfig::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_long_flow_control() {
        let toml = r#"
[[ports]]
name = "CAN"

[[ports.flow_controls]]
search_id = 1
response_id = 2
data = [1, 2, 3, 4, 5, 6, 7, 8, 9]
"#;
        let config: VbsConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_frame_type_code() {
        let toml = r#"
[[ports]]
name = "CAN"

[[ports.filters]]
id = 1
mask = 2
type = 7
"#;
        assert!(toml::from_str::<VbsConfig>(toml).is_err());
    }
}

//! Persisted bus state
//!
//! A small key/value store that survives process restarts: enabled flags,
//! requested and confirmed bitrates, filter lists and flow-control records.
//! Reads never fail; missing or malformed values come back as 0 or "".

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use vbs_core::FlowControlRecord;

/// Persistence errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keys of the persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKey {
    CanEnabled,
    CanBitrate,
    CanFilterIds,
    CanFilterMasks,
    CanFilterTypes,
    CanAutoDetect,
    CanConfirmedBitrate,
    CanFlowControls,
    J1708Enabled,
}

impl StateKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CanEnabled => "can_enabled",
            Self::CanBitrate => "can_bitrate",
            Self::CanFilterIds => "can_filter_ids",
            Self::CanFilterMasks => "can_filter_masks",
            Self::CanFilterTypes => "can_filter_types",
            Self::CanAutoDetect => "can_auto_detect",
            Self::CanConfirmedBitrate => "can_confirmed_bitrate",
            Self::CanFlowControls => "can_flow_controls",
            Self::J1708Enabled => "j1708_enabled",
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable key/value store consumed by the bus controllers
///
/// Implementors provide raw `load`/`store`; the typed accessors are derived.
/// Last write wins; no transactions.
pub trait PersistenceGateway: Send + Sync {
    fn load(&self, key: StateKey) -> Option<Value>;

    fn store(&self, key: StateKey, value: Value);

    fn clear_all(&self);

    fn get_int(&self, key: StateKey) -> i64 {
        match self.load(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            Some(Value::Bool(b)) => i64::from(b),
            _ => 0,
        }
    }

    fn put_int(&self, key: StateKey, value: i64) {
        self.store(key, Value::from(value));
    }

    fn get_string(&self, key: StateKey) -> String {
        match self.load(key) {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        }
    }

    fn put_string(&self, key: StateKey, value: &str) {
        self.store(key, Value::from(value));
    }

    fn get_flow_controls(&self) -> Vec<FlowControlRecord> {
        let Some(value) = self.load(StateKey::CanFlowControls) else {
            return Vec::new();
        };
        serde_json::from_value(value).unwrap_or_else(|e| {
            warn!(error = %e, "Discarding malformed persisted flow controls");
            Vec::new()
        })
    }

    fn put_flow_controls(&self, records: &[FlowControlRecord]) {
        match serde_json::to_value(records) {
            Ok(value) => self.store(StateKey::CanFlowControls, value),
            Err(e) => warn!(error = %e, "Failed to serialize flow controls"),
        }
    }
}

/// In-memory state, lost on exit
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceGateway for MemoryStateStore {
    fn load(&self, key: StateKey) -> Option<Value> {
        self.values.lock().get(key.as_str()).cloned()
    }

    fn store(&self, key: StateKey, value: Value) {
        self.values.lock().insert(key.as_str().to_string(), value);
    }

    fn clear_all(&self) {
        self.values.lock().clear();
    }
}

/// State kept as a JSON object on disk, rewritten on every put
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl FileStateStore {
    /// Open the store; an unreadable or malformed file starts empty
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match Self::read(&path) {
            Ok(values) => values,
            Err(StateError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable state file");
                BTreeMap::new()
            }
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<BTreeMap<String, Value>, StateError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, values: &BTreeMap<String, Value>) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn persist(&self, values: &BTreeMap<String, Value>) {
        if let Err(e) = self.write(values) {
            warn!(path = %self.path.display(), error = %e, "Failed to write state file");
        }
    }
}

impl PersistenceGateway for FileStateStore {
    fn load(&self, key: StateKey) -> Option<Value> {
        self.values.lock().get(key.as_str()).cloned()
    }

    fn store(&self, key: StateKey, value: Value) {
        let mut values = self.values.lock();
        values.insert(key.as_str().to_string(), value);
        self.persist(&values);
    }

    fn clear_all(&self) {
        let mut values = self.values.lock();
        values.clear();
        self.persist(&values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vbs_core::FrameType;

    #[test]
    fn test_missing_values_are_neutral() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get_int(StateKey::CanConfirmedBitrate), 0);
        assert_eq!(store.get_string(StateKey::CanFilterIds), "");
        assert!(store.get_flow_controls().is_empty());
    }

    #[test]
    fn test_memory_round_trip_and_clear() {
        let store = MemoryStateStore::new();
        store.put_int(StateKey::CanBitrate, 500_000);
        store.put_string(StateKey::CanFilterIds, "0x18FEE000,0x0CF00400");
        assert_eq!(store.get_int(StateKey::CanBitrate), 500_000);
        assert_eq!(store.get_string(StateKey::CanFilterIds), "0x18FEE000,0x0CF00400");

        store.clear_all();
        assert_eq!(store.get_int(StateKey::CanBitrate), 0);
    }

    #[test]
    fn test_string_int_coercion() {
        let store = MemoryStateStore::new();
        store.put_string(StateKey::CanBitrate, "250000");
        assert_eq!(store.get_int(StateKey::CanBitrate), 250_000);
        store.put_string(StateKey::CanBitrate, "fast");
        assert_eq!(store.get_int(StateKey::CanBitrate), 0);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let records = vec![FlowControlRecord::new(
            0x18DA_00F1,
            0x18DA_F100,
            vec![0x30, 0x00, 0x00],
            FrameType::Extended,
        )
        .unwrap()];

        {
            let store = FileStateStore::open(&path);
            store.put_int(StateKey::CanConfirmedBitrate, 500_000);
            store.put_int(StateKey::CanEnabled, 1);
            store.put_flow_controls(&records);
        }

        let store = FileStateStore::open(&path);
        assert_eq!(store.get_int(StateKey::CanConfirmedBitrate), 500_000);
        assert_eq!(store.get_int(StateKey::CanEnabled), 1);
        assert_eq!(store.get_flow_controls(), records);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileStateStore::open(&path);
        assert_eq!(store.get_int(StateKey::CanBitrate), 0);

        store.put_int(StateKey::CanBitrate, 250_000);
        let reopened = FileStateStore::open(&path);
        assert_eq!(reopened.get_int(StateKey::CanBitrate), 250_000);
    }

    #[test]
    fn test_malformed_flow_controls_are_dropped() {
        let store = MemoryStateStore::new();
        store.store(StateKey::CanFlowControls, Value::from("garbage"));
        assert!(store.get_flow_controls().is_empty());
    }
}

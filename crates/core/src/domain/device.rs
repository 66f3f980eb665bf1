// Device Identity & Configuration

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Identifying attributes of one physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub device_type: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Extra persistent identifiers (model, firmware type, ...)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_type: device_type.into(),
            serial_number: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Attributes reported with every readiness failure
    pub fn persistent_identifiers(&self) -> BTreeMap<String, String> {
        let mut ids = self.properties.clone();
        ids.insert("name".to_string(), self.name.clone());
        ids.insert("device_type".to_string(), self.device_type.clone());
        if let Some(serial) = &self.serial_number {
            ids.insert("serial_number".to_string(), serial.clone());
        }
        ids
    }
}

/// Free-form per-device settings (JSON object)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfig(Map<String, Value>);

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

/// Arguments for the device's communication transport (address, baudrate, ...)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunicationArgs(Map<String, Value>);

impl CommunicationArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn address(&self) -> Option<&str> {
        self.0.get("address").and_then(Value::as_str)
    }
}

/// Everything needed to build a device handle, in serializable form.
///
/// Device-level fleet functions receive one of these as their first argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub identity: DeviceIdentity,
    #[serde(default)]
    pub config: DeviceConfig,
    #[serde(default)]
    pub comm_args: CommunicationArgs,
}

impl DeviceRequest {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            config: DeviceConfig::new(),
            comm_args: CommunicationArgs::new(),
        }
    }

    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_comm_args(mut self, comm_args: CommunicationArgs) -> Self {
        self.comm_args = comm_args;
        self
    }
}

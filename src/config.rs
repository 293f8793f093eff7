//! Endpoint configuration
//!
//! One [`EndpointConfig`] describes a polled or written block on one device.
//! It loads from JSON with camelCase keys; every key is optional:
//!
//! ```json
//! {
//!   "protocol": "tcp",
//!   "host": "192.168.1.20",
//!   "port": 502,
//!   "dataType": "discreteInputs",
//!   "referenceAddress": 2,
//!   "count": 8,
//!   "unitId": 1,
//!   "pollDelayMs": 500,
//!   "initialDelayMs": 500,
//!   "changesOnly": true
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::codec::DataType;
use crate::connection::{ConnectionDescriptor, Protocol};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusAddress, ReferenceWindow, UnitId};

/// Configuration of one device endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointConfig {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub data_type: DataType,
    pub reference_address: ModbusAddress,
    pub count: u16,
    pub unit_id: UnitId,
    pub poll_delay_ms: u64,
    pub initial_delay_ms: u64,
    pub changes_only: bool,
    /// Per-transaction receive timeout
    pub timeout_ms: u64,
    /// Timeout while establishing a TCP connection
    pub connect_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Tcp,
            host: "localhost".to_string(),
            port: crate::DEFAULT_PORT,
            data_type: DataType::HoldingRegisters,
            reference_address: 0,
            count: 1,
            unit_id: 0,
            poll_delay_ms: 500,
            initial_delay_ms: 500,
            changes_only: false,
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: crate::DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl EndpointConfig {
    /// Default configuration for `data_type` on `host`
    pub fn new<H: Into<String>>(protocol: Protocol, host: H, data_type: DataType) -> Self {
        Self {
            protocol,
            host: host.into(),
            data_type,
            ..Self::default()
        }
    }

    /// Parse a JSON document
    pub fn from_json(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON document from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Check the configured reference window
    pub fn validate(&self) -> ModbusResult<()> {
        if self.host.trim().is_empty() {
            return Err(ModbusError::configuration("Host must not be empty"));
        }
        self.window().validate()
    }

    /// Reference window covered by this endpoint
    pub fn window(&self) -> ReferenceWindow {
        ReferenceWindow {
            start: self.reference_address,
            count: self.count,
        }
    }

    /// Connection descriptor for this endpoint
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::new(self.protocol, self.host.clone(), self.port)
            .with_unit_id(self.unit_id)
            .with_timeout_ms(self.timeout_ms)
            .with_connect_timeout_ms(self.connect_timeout_ms)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

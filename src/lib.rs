//! # Modbus Poll - Async Modbus TCP/UDP Master
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! An async Modbus master for TCP and UDP devices built on Tokio. It polls a
//! block of coils, discrete inputs or registers on a fixed schedule, forwards
//! values downstream only when they change (or on every tick), and dispatches
//! one-shot writes of coils and holding registers.
//!
//! ## Features
//!
//! - **Change Detection**: per data type change rules, the first poll always forwards
//! - **TCP and UDP**: standard MBAP framing over both transports
//! - **Connect-Once Handles**: lazy connection, serialized transactions, cancellable close
//! - **Late Reply Handling**: replies to timed-out requests are recognised and dropped
//! - **Typed Values**: bit vectors and register sequences with bit-exact byte conversion
//! - **Built-in Monitoring**: per-transport statistics and per-poller metrics
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Data Type | Poll | Write |
//! |------|----------|-----------|------|-------|
//! | 0x01 | Read Coils | coils | ✅ | |
//! | 0x02 | Read Discrete Inputs | discreteInputs | ✅ | |
//! | 0x03 | Read Holding Registers | registers | ✅ | |
//! | 0x04 | Read Input Registers | inputRegisters | ✅ | |
//! | 0x0F | Write Multiple Coils | coils | | ✅ |
//! | 0x10 | Write Multiple Registers | registers | | ✅ |
//!
//! ## Quick Start
//!
//! ### Polling Example
//!
//! ```rust,no_run
//! use modbus_poll::{EndpointConfig, FnSink, ModbusPoller, ModbusResult, ModbusValue};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = EndpointConfig::from_json(
//!         r#"{"host": "127.0.0.1", "dataType": "discreteInputs",
//!             "referenceAddress": 2, "count": 8, "changesOnly": true}"#,
//!     )?;
//!
//!     let mut poller = ModbusPoller::new(config)?;
//!     let mut sink = FnSink(|value: &ModbusValue| {
//!         println!("inputs: {}", value);
//!         Ok(())
//!     });
//!
//!     // forwards: nothing was polled before
//!     poller.poll(&mut sink).await?;
//!     // forwards only if the inputs changed
//!     poller.poll(&mut sink).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Write Example
//!
//! ```rust,no_run
//! use modbus_poll::{DataType, EndpointConfig, ModbusValue, ModbusWriter, Protocol};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config =
//!         EndpointConfig::new(Protocol::Tcp, "127.0.0.1", DataType::HoldingRegisters);
//!     config.reference_address = 100;
//!
//!     let writer = ModbusWriter::new(&config)?;
//!     let ack = writer.write(&ModbusValue::Registers(vec![0x1234, 0x5678])).await?;
//!     println!("wrote {} registers at {}", ack.count, ack.reference);
//!
//!     writer.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │  ModbusPoller   │    │  ModbusWriter   │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────────────────────────────┐
//! │     DataType codec (lookup table)       │
//! └─────────────────────────────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ ModbusConnection│    │ ModbusConnection│
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │  TcpTransport   │    │  UdpTransport   │
//! └─────────────────┘    └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Bit vectors, registers and change rules
pub mod value;

/// Modbus protocol definitions and PDU encoding
pub mod protocol;

/// Data type lookup table
pub mod codec;

/// Network transport layer for TCP and UDP communication
pub mod transport;

/// Connect-once connection handles
pub mod connection;

/// Endpoint configuration
pub mod config;

/// Change-detecting polling engine
pub mod poller;

/// One-shot write dispatcher
pub mod writer;

/// Utility functions and poll metrics
pub mod utils;

/// Callback transaction logging
pub mod logging;

// Re-export main types for convenience
pub use codec::DataType;
pub use config::EndpointConfig;
pub use connection::{ConnectionDescriptor, ModbusConnection, Protocol};
pub use error::{ModbusError, ModbusResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use poller::{FnSink, ModbusPoller, PollSink, PollerHandle, PollerState};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, ReferenceWindow, WriteAck};
pub use transport::{ModbusTransport, TcpTransport, TransportStats, UdpTransport};
pub use utils::{OperationTimer, PerformanceMetrics};
pub use value::{BitVector, ModbusValue, Register};
pub use writer::ModbusWriter;

/// Default per-transaction timeout (1 second)
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default timeout while establishing a TCP connection (3 seconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Maximum number of coils a device accepts in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers a device accepts in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Modbus well-known port, for both TCP and UDP
pub const DEFAULT_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Poll v{} - async Modbus TCP/UDP master", VERSION)
}

//! # Modbus Poll Error Handling
//!
//! Every failure in the master engine surfaces as a [`ModbusError`]. Nothing is
//! swallowed inside the core: the transport, the connection handle, the poller and
//! the write dispatcher all propagate errors to their caller, which owns the
//! retry/backoff policy.
//!
//! ## Error Categories
//!
//! ### Endpoint Errors (fatal until reconfigured)
//! - **Resolution**: the device host name could not be resolved
//! - **Configuration**: unsupported data type or protocol, invalid reference window
//! - **Type**: a write payload does not match the writer's data type
//!
//! ### Transport Errors (recoverable)
//! - **Connection**: socket establishment or I/O failure, recoverable by reconnect
//! - **Timeout**: no response within the window, the connection stays open
//!
//! ### Protocol Errors (surfaced as-is)
//! - **Protocol**: mismatched transaction id, unexpected function code, bad echo
//! - **Frame**: malformed MBAP frame or PDU
//! - **Exception**: exception response reported by the device
//! - **Decode**: malformed byte lengths, e.g. odd-length register data
//!
//! ### Downstream Errors
//! - **Sink**: the downstream consumer rejected a polled value
//!
//! ## Retry Logic
//!
//! ```rust
//! use modbus_poll::{ModbusError, ModbusResult};
//! use tokio::time::{sleep, Duration};
//!
//! async fn with_retry<F, Fut>(operation: F, max_retries: usize) -> ModbusResult<Vec<u16>>
//! where
//!     F: Fn() -> Fut,
//!     Fut: std::future::Future<Output = ModbusResult<Vec<u16>>>,
//! {
//!     let mut attempt = 0;
//!     loop {
//!         match operation().await {
//!             Err(error) if error.is_recoverable() && attempt < max_retries => {
//!                 attempt += 1;
//!                 sleep(Duration::from_millis(100 * attempt as u64)).await;
//!             }
//!             other => return other,
//!         }
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus master error types
///
/// Each variant carries enough context to diagnose the failure and to decide
/// whether the failed operation is worth retrying.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// Host name resolution failed
    ///
    /// Fatal for the endpoint until it is reconfigured; the connection handle
    /// caches this error and returns it on every later attempt.
    #[error("Resolution error: cannot resolve {host}: {message}")]
    Resolution { host: String, message: String },

    /// Connection errors
    ///
    /// Socket establishment or socket I/O failures.
    ///
    /// # Examples
    /// - Connection refused by remote host
    /// - Connection reset during a transaction
    /// - Connection closed while a transaction was in flight
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// No (matching) response arrived within the configured window. The
    /// connection is left open so the caller may retry on it.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Protocol-level errors
    ///
    /// # Examples
    /// - Response transaction id does not match the request
    /// - Response function code does not match the request
    /// - Write acknowledgment does not echo the written window
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Modbus exception response
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors
    ///
    /// # Examples
    /// - Non-zero MBAP protocol identifier
    /// - MBAP length outside the legal range
    /// - PDU shorter than its byte count claims
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Malformed byte lengths while converting raw bytes to domain values
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Write payload shape does not match the configured data type
    #[error("Type error: expected {expected}, got {actual}")]
    Type { expected: String, actual: String },

    /// Endpoint configuration errors
    ///
    /// # Examples
    /// - Unsupported data type string
    /// - Unsupported protocol scheme
    /// - Reference window overflowing the 16-bit address space
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Downstream sink rejected a polled value
    #[error("Sink error: {message}")]
    Sink { message: String },
}

impl ModbusError {
    /// Create a new resolution error
    pub fn resolution<H: Into<String>, S: Into<String>>(host: H, message: S) -> Self {
        Self::Resolution {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages.
    ///
    /// # Arguments
    ///
    /// * `function` - Original function code that caused the exception
    /// * `code` - Modbus exception code
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode { message: message.into() }
    }

    /// Create a type error
    ///
    /// # Arguments
    ///
    /// * `expected` - Shape the writer accepts
    /// * `actual` - Shape that was supplied
    pub fn type_mismatch<E: Into<String>, A: Into<String>>(expected: E, actual: A) -> Self {
        Self::Type {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a sink error
    pub fn sink<S: Into<String>>(message: S) -> Self {
        Self::Sink { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_poll::ModbusError;
    ///
    /// let timeout_error = ModbusError::timeout("read response", 1000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let config_error = ModbusError::configuration("Unsupported data type: holding");
    /// assert!(!config_error.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Sink { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is fatal for the endpoint
    ///
    /// Fatal errors will repeat on every attempt until the endpoint is
    /// reconfigured, so schedulers stop polling when they see one.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Resolution { .. } | Self::Configuration { .. } | Self::Type { .. }
        )
    }

    /// Check if the error is a network/transport issue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_poll::ModbusError;
    ///
    /// let connection_error = ModbusError::connection("Connection refused");
    /// assert!(connection_error.is_transport_error());
    ///
    /// let exception_error = ModbusError::exception(0x03, 0x02);
    /// assert!(!exception_error.is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the error is a protocol issue
    ///
    /// Device exceptions and malformed frames are both protocol errors.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::Exception { .. } | Self::Frame { .. }
        )
    }
}

/// Socket-level I/O failures are connection errors
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::connection(err.to_string())
    }
}

/// Converts Tokio's timeout errors to `ModbusError::Timeout`
///
/// The elapsed error carries no duration, so callers that know the window
/// should build the timeout error themselves.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Endpoint configuration documents that fail to parse
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

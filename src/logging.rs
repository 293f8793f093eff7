//! Callback transaction logging
//!
//! A [`CallbackLogger`] can be attached to a
//! [`ModbusConnection`](crate::connection::ModbusConnection) to observe every
//! transaction it executes, independent of the `log` facade used by the rest of
//! the crate.

use std::sync::Arc;

use crate::error::ModbusError;
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse};
use crate::value::{format_register, registers_from_bytes, BitVector};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for transaction display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show raw PDU bytes only
    Raw,
    /// Show interpreted fields
    Interpreted,
    /// Show both interpreted fields and raw bytes
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self::with_mode(callback, min_level, LoggingMode::Interpreted)
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(
        callback: Option<LogCallback>,
        min_level: LogLevel,
        mode: LoggingMode,
    ) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with timestamped console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log an outgoing request
    pub fn log_request(&self, request: &ModbusRequest) {
        let interpreted = || {
            let mut message = format!(
                "Modbus Request -> Unit: {}, Function: {}, Address: {}, Quantity: {}",
                request.unit_id, request.function, request.address, request.quantity
            );
            if !request.data.is_empty() {
                message.push_str(&format!(", Payload: {}", hex::encode_upper(&request.data)));
            }
            message
        };
        let raw = || format!("Modbus Request -> Raw: {}", hex::encode_upper(request.encode_pdu()));
        self.emit(interpreted, raw);
    }

    /// Log a decoded response
    pub fn log_response(&self, response: &ModbusResponse) {
        let interpreted = || {
            format!(
                "Modbus Response <- Unit: {}, Function: {}, {}",
                response.unit_id,
                response.function,
                interpret_response_data(response.function, &response.data)
            )
        };
        let raw = || {
            format!(
                "Modbus Response <- Raw: {}",
                hex::encode_upper(response.encode_pdu())
            )
        };
        self.emit(interpreted, raw);
    }

    /// Log a failed transaction
    pub fn log_failure(&self, request: &ModbusRequest, error: &ModbusError) {
        let level = if error.is_transport_error() {
            LogLevel::Warn
        } else {
            LogLevel::Error
        };
        self.log(
            level,
            &format!(
                "Modbus Request failed <- Unit: {}, Function: {}: {}",
                request.unit_id, request.function, error
            ),
        );
    }

    fn emit<I, R>(&self, interpreted: I, raw: R)
    where
        I: FnOnce() -> String,
        R: FnOnce() -> String,
    {
        match self.mode {
            LoggingMode::Raw => {
                if self.should_log(LogLevel::Info) {
                    self.info(&raw());
                }
            }
            LoggingMode::Interpreted => {
                if self.should_log(LogLevel::Info) {
                    self.info(&interpreted());
                }
            }
            LoggingMode::Both => {
                if self.should_log(LogLevel::Info) {
                    self.info(&interpreted());
                }
                if self.should_log(LogLevel::Debug) {
                    self.debug(&raw());
                }
            }
        }
    }
}

/// Interpret response payload based on function
fn interpret_response_data(function: ModbusFunction, data: &[u8]) -> String {
    if data.is_empty() {
        return "No data".to_string();
    }

    match function {
        ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
            let bits = BitVector::from_bytes(&data[1..]);
            format!("Byte count: {}, Bits: {}", data[0], bits)
        }
        ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
            match registers_from_bytes(&data[1..]) {
                Ok(registers) => format!(
                    "Byte count: {}, Registers: [{}]",
                    data[0],
                    registers
                        .iter()
                        .take(8)
                        .map(|&r| format_register(r))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                Err(_) => format!("Data: {}", hex::encode(data)),
            }
        }
        ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
            if data.len() >= 4 {
                let address = u16::from_be_bytes([data[0], data[1]]);
                let quantity = u16::from_be_bytes([data[2], data[3]]);
                format!("Address: {}, Quantity: {}", address, quantity)
            } else {
                format!("Data: {}", hex::encode(data))
            }
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}

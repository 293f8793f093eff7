//! # Connection Handle
//!
//! A [`ModbusConnection`] is the "connect-once" resource owned by one poller or
//! writer. It is built from a [`ConnectionDescriptor`] without touching the
//! network; the first transaction resolves the host, creates the transport and
//! connects it. Later transactions reuse the same socket, and a transport that
//! dropped its socket after a connection error is reconnected on next use.
//!
//! Transactions are serialized by an async mutex, so at most one request is in
//! flight per connection. [`ModbusConnection::close`] may be called while a
//! transaction is pending: the pending `execute` returns a connection error
//! immediately instead of waiting for its timeout.

use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusRequest, ModbusResponse, UnitId};
use crate::transport::{ModbusTransport, TcpTransport, TransportStats, UdpTransport};

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(ModbusError::configuration(format!(
                "Unsupported protocol: {}",
                s
            ))),
        }
    }
}

impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Protocol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Everything needed to reach one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Per-transaction receive timeout
    pub timeout_ms: u64,
    /// Timeout while establishing a TCP connection
    pub connect_timeout_ms: u64,
    pub unit_id: UnitId,
}

impl ConnectionDescriptor {
    /// Create a descriptor with default timeouts and unit id 0
    pub fn new<H: Into<String>>(protocol: Protocol, host: H, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: crate::DEFAULT_CONNECT_TIMEOUT_MS,
            unit_id: 0,
        }
    }

    pub fn with_unit_id(mut self, unit_id: UnitId) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_connect_timeout_ms(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{} unit {}",
            self.protocol, self.host, self.port, self.unit_id
        )
    }
}

#[derive(Default)]
struct ConnectionState {
    /// Resolution outcome, computed once
    address: Option<ModbusResult<SocketAddr>>,
    transport: Option<Box<dyn ModbusTransport>>,
}

/// Lazily connected, serialized handle to one device
pub struct ModbusConnection {
    descriptor: ConnectionDescriptor,
    state: Mutex<ConnectionState>,
    timeout_ms: AtomicU64,
    connected: AtomicBool,
    closing: Notify,
    logger: Option<CallbackLogger>,
    packet_logging: bool,
}

impl ModbusConnection {
    /// Create an unconnected handle; no I/O happens here
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        let timeout_ms = descriptor.timeout_ms;
        Self {
            descriptor,
            state: Mutex::new(ConnectionState::default()),
            timeout_ms: AtomicU64::new(timeout_ms),
            connected: AtomicBool::new(false),
            closing: Notify::new(),
            logger: None,
            packet_logging: false,
        }
    }

    /// Attach a callback logger that sees every transaction
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Enable hex dumps of every frame on the transport
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn host(&self) -> &str {
        &self.descriptor.host
    }

    pub fn port(&self) -> u16 {
        self.descriptor.port
    }

    pub fn unit_id(&self) -> UnitId {
        self.descriptor.unit_id
    }

    /// Timeout applied to the next transaction
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the timeout applied to subsequent transactions
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Whether the last operation left an open socket
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Resolved device address, once the host has been resolved
    pub async fn address(&self) -> Option<SocketAddr> {
        let state = self.state.lock().await;
        match state.address {
            Some(Ok(address)) => Some(address),
            _ => None,
        }
    }

    /// Statistics of the current transport
    pub async fn stats(&self) -> Option<TransportStats> {
        let state = self.state.lock().await;
        state.transport.as_ref().map(|t| t.get_stats())
    }

    /// Establish the connection if it is not already open
    pub async fn connect(&self) -> ModbusResult<()> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();

        tokio::select! {
            _ = &mut closing => Err(ModbusError::connection("Connection closed")),
            result = async {
                let mut state = self.state.lock().await;
                self.ensure_connected(&mut state).await.map(|_| ())
            } => result,
        }
    }

    /// Execute one transaction
    ///
    /// Connects first if needed. Errors are returned as-is; no retry happens
    /// here.
    pub async fn execute(&self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();

        tokio::select! {
            _ = &mut closing => {
                let error = ModbusError::connection("Connection closed during transaction");
                if let Some(logger) = &self.logger {
                    logger.log_failure(request, &error);
                }
                Err(error)
            }
            result = self.execute_serialized(request) => result,
        }
    }

    async fn execute_serialized(&self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let mut state = self.state.lock().await;
        let timeout = self.timeout();
        let transport = self.ensure_connected(&mut state).await?;

        if let Some(logger) = &self.logger {
            logger.log_request(request);
        }

        transport.set_timeout(timeout);
        let result = transport.request(request).await;
        self.connected
            .store(transport.is_connected(), Ordering::Release);

        if let Some(logger) = &self.logger {
            match &result {
                Ok(response) => logger.log_response(response),
                Err(e) => logger.log_failure(request, e),
            }
        }
        result
    }

    async fn ensure_connected<'a>(
        &self,
        state: &'a mut ConnectionState,
    ) -> ModbusResult<&'a mut Box<dyn ModbusTransport>> {
        let address = match &state.address {
            Some(resolved) => resolved.clone()?,
            None => {
                let resolved = self.resolve().await;
                state.address = Some(resolved.clone());
                resolved?
            }
        };

        let transport = state.transport.get_or_insert_with(|| {
            let timeout = Duration::from_millis(self.descriptor.connect_timeout_ms);
            match self.descriptor.protocol {
                Protocol::Tcp => Box::new(TcpTransport::with_packet_logging(
                    address,
                    timeout,
                    self.packet_logging,
                )) as Box<dyn ModbusTransport>,
                Protocol::Udp => Box::new(UdpTransport::with_packet_logging(
                    address,
                    timeout,
                    self.packet_logging,
                )) as Box<dyn ModbusTransport>,
            }
        });

        if !transport.is_connected() {
            transport.set_timeout(Duration::from_millis(self.descriptor.connect_timeout_ms));
            let result = transport.connect().await;
            self.connected
                .store(transport.is_connected(), Ordering::Release);
            result?;
            info!("Connected to {} ({})", self.descriptor, address);
        }

        Ok(transport)
    }

    async fn resolve(&self) -> ModbusResult<SocketAddr> {
        let host = self.descriptor.host.as_str();
        let mut addresses = tokio::net::lookup_host((host, self.descriptor.port))
            .await
            .map_err(|e| ModbusError::resolution(host, e.to_string()))?;
        let address = addresses
            .next()
            .ok_or_else(|| ModbusError::resolution(host, "no addresses found"))?;
        debug!("Resolved {} to {}", host, address);
        Ok(address)
    }

    /// Close the connection
    ///
    /// Safe to call repeatedly and concurrently with `execute`; a pending
    /// transaction fails with a connection error. A later `execute` reconnects.
    pub async fn close(&self) -> ModbusResult<()> {
        self.closing.notify_waiters();

        let mut state = self.state.lock().await;
        if let Some(transport) = state.transport.as_mut() {
            transport.close().await?;
            info!("Closed connection to {}", self.descriptor);
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

impl fmt::Debug for ModbusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusConnection")
            .field("descriptor", &self.descriptor)
            .field("connected", &self.is_connected())
            .finish()
    }
}

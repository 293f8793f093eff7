//! # Modbus Transport Layer
//!
//! This module provides the TCP and UDP transports used by the master, both
//! carrying the standard MBAP-framed Modbus PDU behind one async interface.
//!
//! ## Supported Transports
//!
//! ### Modbus TCP (`TcpTransport`)
//! - Lazy connection on first request, explicit `connect()` with a bounded wait
//! - Stream reassembly of MBAP frames across partial reads
//! - Responses matched to requests by transaction identifier
//!
//! ### Modbus UDP (`UdpTransport`)
//! - One MBAP frame per datagram
//! - Socket bound locally and connected to the device, so datagrams from any
//!   other peer are dropped by the kernel
//! - One outstanding transaction at a time, matched by transaction identifier
//!
//! ## Timeouts and late replies
//!
//! A request that times out leaves the socket open. Its transaction id is
//! remembered, and if the device answers it later the reply is discarded while
//! waiting for the next response. Any other unexpected transaction id is a
//! protocol error.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use modbus_poll::transport::{TcpTransport, ModbusTransport};
//! use modbus_poll::protocol::{ModbusRequest, ModbusFunction, ReferenceWindow};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = TcpTransport::new("127.0.0.1:502".parse()?, Duration::from_secs(1));
//!     transport.connect().await?;
//!
//!     let request = ModbusRequest::new_read(
//!         1,                                    // unit id
//!         ModbusFunction::ReadHoldingRegisters, // function
//!         ReferenceWindow::new(0, 10)?,         // registers 0..10
//!     );
//!
//!     let response = transport.request(&request).await?;
//!     println!("Registers: {:?}", response.parse_registers(10)?);
//!
//!     let stats = transport.get_stats();
//!     println!("Requests sent: {}", stats.requests_sent);
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusRequest, ModbusResponse, UnitId};

/// Maximum frame size for Modbus TCP/UDP (MBAP header + PDU)
pub const MAX_FRAME_SIZE: usize = 260;

/// MBAP header size including the unit identifier
pub const MBAP_HEADER_SIZE: usize = 7;

/// Smallest legal MBAP length field: unit id + function code
const MIN_MBAP_LENGTH: u16 = 2;

/// Largest legal MBAP length field: unit id + 253 byte PDU
const MAX_MBAP_LENGTH: u16 = 254;

/// Number of timed-out transaction ids remembered for late-reply detection
const ABANDONED_CAPACITY: usize = 16;

/// Format raw bytes as hex string for packet logging
fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and format
fn log_packet(direction: &str, data: &[u8], protocol: &str, unit_id: UnitId) {
    tracing::debug!(
        "[MODBUS-{}] {} unit:{} {}",
        protocol,
        direction,
        unit_id,
        format_hex_packet(data)
    );
}

/// Transport layer abstraction for Modbus communication
///
/// A transport owns at most one socket. It is created unconnected; `connect()`
/// establishes the socket and is idempotent, and `request()` connects lazily
/// when no socket is open.
///
/// ## Error Handling
///
/// - `ModbusError::Connection` - socket could not be established or failed
///   mid-transaction; the socket is dropped so the next request reconnects
/// - `ModbusError::Timeout` - no matching response within the timeout; the
///   socket stays open
/// - `ModbusError::Protocol` / `Frame` / `Exception` - bad or mismatched
///   response, or an exception reported by the device
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Establish the underlying socket if it is not already open
    async fn connect(&mut self) -> ModbusResult<()>;

    /// Send a Modbus request and wait for its response
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse>;

    /// Check if the transport holds an open socket
    ///
    /// This is a local check and does not verify that the device is responsive.
    fn is_connected(&self) -> bool;

    /// Release the socket; a no-op when already closed
    async fn close(&mut self) -> ModbusResult<()>;

    /// Bound the next connect or receive
    fn set_timeout(&mut self, timeout: Duration);

    /// Current timeout
    fn timeout(&self) -> Duration;

    /// Resolved device address
    fn address(&self) -> SocketAddr;

    /// Device port
    fn port(&self) -> u16 {
        self.address().port()
    }

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: UnitId,
}

impl MbapHeader {
    /// Parse and validate the 7 header bytes
    pub fn parse(bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() < MBAP_HEADER_SIZE {
            return Err(ModbusError::frame("Frame too short"));
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };

        if header.protocol_id != 0 {
            return Err(ModbusError::frame(format!(
                "Unexpected protocol id {}",
                header.protocol_id
            )));
        }
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&header.length) {
            return Err(ModbusError::frame(format!(
                "MBAP length {} out of range",
                header.length
            )));
        }
        Ok(header)
    }

    /// Total frame size announced by this header
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_SIZE - 1 + self.length as usize
    }
}

/// Encode a request into an MBAP frame
pub fn encode_frame(transaction_id: u16, request: &ModbusRequest) -> Vec<u8> {
    let pdu = request.encode_pdu();
    let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());

    // MBAP Header: Transaction ID (2) + Protocol ID (2) + Length (2) + Unit ID (1)
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(request.unit_id);
    frame.extend_from_slice(&pdu);

    frame
}

/// Outcome of matching a response header against the pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Answers the pending request
    Matched,
    /// Late reply to a request that already timed out
    Stale,
}

/// Transaction id allocation and response matching
#[derive(Debug)]
pub struct Correlator {
    next_id: u16,
    /// Id sent but neither answered nor abandoned yet
    in_flight: Option<u16>,
    abandoned: VecDeque<u16>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_flight: None,
            abandoned: VecDeque::with_capacity(ABANDONED_CAPACITY),
        }
    }

    /// Allocate the next transaction id; 0 is never used
    ///
    /// A previous id still in flight belongs to a request that was dropped before
    /// its reply arrived, so it is abandoned.
    pub fn next_transaction_id(&mut self) -> u16 {
        if let Some(previous) = self.in_flight.take() {
            self.abandon(previous);
        }
        let id = self.next_id;
        self.in_flight = Some(id);
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }

    /// Remember a transaction whose reply may still arrive
    pub fn abandon(&mut self, transaction_id: u16) {
        if self.in_flight == Some(transaction_id) {
            self.in_flight = None;
        }
        if self.abandoned.len() == ABANDONED_CAPACITY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(transaction_id);
    }

    /// Match a received transaction id against the pending one
    pub fn correlate(&mut self, expected: u16, received: u16) -> ModbusResult<Correlation> {
        if received == expected {
            if self.in_flight == Some(expected) {
                self.in_flight = None;
            }
            return Ok(Correlation::Matched);
        }
        if let Some(position) = self.abandoned.iter().position(|&id| id == received) {
            self.abandoned.remove(position);
            return Ok(Correlation::Stale);
        }
        Err(ModbusError::protocol(format!(
            "Transaction id mismatch: expected {}, got {}",
            expected, received
        )))
    }

    /// Forget all pending late replies, e.g. after reconnecting
    pub fn reset(&mut self) {
        self.in_flight = None;
        self.abandoned.clear();
    }
}

/// Modbus TCP transport implementation
pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: SocketAddr,
    timeout: Duration,
    correlator: Correlator,
    /// Bytes received but not yet consumed as a frame
    buffer: Vec<u8>,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl TcpTransport {
    /// Create a new, unconnected TCP transport
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            stream: None,
            address,
            timeout,
            correlator: Correlator::new(),
            buffer: Vec::with_capacity(MAX_FRAME_SIZE),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Create a new TCP transport with packet logging enabled
    pub fn with_packet_logging(
        address: SocketAddr,
        timeout: Duration,
        enable_logging: bool,
    ) -> Self {
        let mut transport = Self::new(address, timeout);
        transport.packet_logging = enable_logging;
        transport
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.buffer.clear();
        self.correlator.reset();
    }

    fn fail_connection(&mut self, message: String) -> ModbusError {
        self.stats.errors += 1;
        self.disconnect();
        ModbusError::connection(message)
    }

    /// Take one complete frame off the receive buffer
    fn take_frame(&mut self) -> ModbusResult<Option<(MbapHeader, Vec<u8>)>> {
        if self.buffer.len() < MBAP_HEADER_SIZE {
            return Ok(None);
        }
        let header = match MbapHeader::parse(&self.buffer) {
            Ok(header) => header,
            Err(e) => {
                // the stream can no longer be re-synchronized
                self.stats.errors += 1;
                self.disconnect();
                return Err(e);
            }
        };
        if self.buffer.len() < header.frame_len() {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buffer.drain(..header.frame_len()).collect();
        Ok(Some((header, frame)))
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = match timeout(self.timeout, TcpStream::connect(self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(ModbusError::connection(format!(
                    "Failed to connect to {}: {}",
                    self.address, e
                )));
            }
            Err(_) => {
                self.stats.errors += 1;
                return Err(ModbusError::connection(format!(
                    "Timed out connecting to {} after {}ms",
                    self.address,
                    self.timeout.as_millis()
                )));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", self.address, e);
        }

        debug!("Connected to Modbus TCP device {}", self.address);
        self.buffer.clear();
        self.correlator.reset();
        self.stream = Some(stream);
        Ok(())
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        if self.stream.is_none() {
            self.connect().await?;
        }

        let transaction_id = self.correlator.next_transaction_id();
        let frame = encode_frame(transaction_id, request);
        let timeout_ms = self.timeout.as_millis() as u64;
        let deadline = Instant::now() + self.timeout;

        if self.packet_logging {
            log_packet("send", &frame, "TCP", request.unit_id);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Not connected"))?;
        match timeout_at(deadline, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail_connection(format!("Send failed: {}", e))),
            Err(_) => {
                // a partially written frame leaves the stream unusable
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                self.disconnect();
                return Err(ModbusError::timeout("send request", timeout_ms));
            }
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let mut chunk = [0u8; MAX_FRAME_SIZE];
        loop {
            while let Some((header, frame)) = self.take_frame()? {
                match self.correlator.correlate(transaction_id, header.transaction_id) {
                    Ok(Correlation::Matched) => {
                        self.stats.responses_received += 1;
                        if self.packet_logging {
                            log_packet("receive", &frame, "TCP", header.unit_id);
                        }
                        return ModbusResponse::decode_pdu(
                            header.unit_id,
                            &frame[MBAP_HEADER_SIZE..],
                            request,
                        )
                        .map_err(|e| {
                            self.stats.errors += 1;
                            e
                        });
                    }
                    Ok(Correlation::Stale) => {
                        debug!(
                            "Discarding late reply for transaction {} from {}",
                            header.transaction_id, self.address
                        );
                    }
                    Err(e) => {
                        self.stats.errors += 1;
                        self.correlator.abandon(transaction_id);
                        return Err(e);
                    }
                }
            }

            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| ModbusError::connection("Not connected"))?;
            match timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(self.fail_connection(format!(
                        "Connection closed by {}",
                        self.address
                    )))
                }
                Ok(Ok(n)) => {
                    self.stats.bytes_received += n as u64;
                    self.buffer.extend_from_slice(&chunk[..n]);
                }
                Ok(Err(e)) => return Err(self.fail_connection(format!("Receive failed: {}", e))),
                Err(_) => {
                    self.stats.timeouts += 1;
                    self.stats.errors += 1;
                    self.correlator.abandon(transaction_id);
                    return Err(ModbusError::timeout("read response", timeout_ms));
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed Modbus TCP connection to {}", self.address);
        }
        self.buffer.clear();
        self.correlator.reset();
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Modbus UDP transport implementation
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    address: SocketAddr,
    timeout: Duration,
    correlator: Correlator,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl UdpTransport {
    /// Create a new, unbound UDP transport
    pub fn new(address: SocketAddr, timeout: Duration) -> Self {
        Self {
            socket: None,
            address,
            timeout,
            correlator: Correlator::new(),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Create a new UDP transport with packet logging enabled
    pub fn with_packet_logging(
        address: SocketAddr,
        timeout: Duration,
        enable_logging: bool,
    ) -> Self {
        let mut transport = Self::new(address, timeout);
        transport.packet_logging = enable_logging;
        transport
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn fail_connection(&mut self, message: String) -> ModbusError {
        self.stats.errors += 1;
        self.socket = None;
        self.correlator.reset();
        ModbusError::connection(message)
    }
}

#[async_trait]
impl ModbusTransport for UdpTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let local: SocketAddr = if self.address.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await.map_err(|e| {
            self.stats.errors += 1;
            ModbusError::connection(format!("Failed to bind UDP socket: {}", e))
        })?;
        socket.connect(self.address).await.map_err(|e| {
            self.stats.errors += 1;
            ModbusError::connection(format!("Failed to connect to {}: {}", self.address, e))
        })?;

        debug!("Bound Modbus UDP socket for device {}", self.address);
        self.correlator.reset();
        self.socket = Some(socket);
        Ok(())
    }

    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        if self.socket.is_none() {
            self.connect().await?;
        }

        let transaction_id = self.correlator.next_transaction_id();
        let frame = encode_frame(transaction_id, request);
        let timeout_ms = self.timeout.as_millis() as u64;
        let deadline = Instant::now() + self.timeout;

        if self.packet_logging {
            log_packet("send", &frame, "UDP", request.unit_id);
        }

        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| ModbusError::connection("Not connected"))?;
        match timeout_at(deadline, socket.send(&frame)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(self.fail_connection(format!("Send failed: {}", e))),
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                return Err(ModbusError::timeout("send request", timeout_ms));
            }
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let mut datagram = [0u8; MAX_FRAME_SIZE];
        loop {
            let socket = self
                .socket
                .as_ref()
                .ok_or_else(|| ModbusError::connection("Not connected"))?;
            let n = match timeout_at(deadline, socket.recv(&mut datagram)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(self.fail_connection(format!("Receive failed: {}", e))),
                Err(_) => {
                    self.stats.timeouts += 1;
                    self.stats.errors += 1;
                    self.correlator.abandon(transaction_id);
                    return Err(ModbusError::timeout("read response", timeout_ms));
                }
            };
            self.stats.bytes_received += n as u64;
            let received = &datagram[..n];

            let header = MbapHeader::parse(received).map_err(|e| {
                self.stats.errors += 1;
                e
            })?;
            if header.frame_len() != n {
                self.stats.errors += 1;
                return Err(ModbusError::frame(format!(
                    "Datagram of {} bytes announces a {} byte frame",
                    n,
                    header.frame_len()
                )));
            }

            match self.correlator.correlate(transaction_id, header.transaction_id) {
                Ok(Correlation::Matched) => {
                    self.stats.responses_received += 1;
                    if self.packet_logging {
                        log_packet("receive", received, "UDP", header.unit_id);
                    }
                    return ModbusResponse::decode_pdu(
                        header.unit_id,
                        &received[MBAP_HEADER_SIZE..],
                        request,
                    )
                    .map_err(|e| {
                        self.stats.errors += 1;
                        e
                    });
                }
                Ok(Correlation::Stale) => {
                    debug!(
                        "Discarding late reply for transaction {} from {}",
                        header.transaction_id, self.address
                    );
                }
                Err(e) => {
                    self.stats.errors += 1;
                    self.correlator.abandon(transaction_id);
                    return Err(e);
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.socket.take().is_some() {
            debug!("Closed Modbus UDP socket for {}", self.address);
        }
        self.correlator.reset();
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

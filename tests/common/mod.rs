//! Scripted Modbus TCP/UDP device for integration tests
//!
//! Serves the six function codes the master uses from an in-memory image,
//! records every decoded request, and can be told to stay silent or to echo a
//! wrong write quantity.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use modbus_poll::protocol::{ModbusException, ModbusFunction, ModbusRequest};
use modbus_poll::transport::{MbapHeader, MAX_FRAME_SIZE, MBAP_HEADER_SIZE};
use modbus_poll::value::{registers_to_bytes, BitVector, Register};
use modbus_poll::{MAX_COILS_PER_REQUEST, MAX_REGISTERS_PER_REQUEST};

/// Number of addresses of each object type the device exposes
pub const IMAGE_SIZE: usize = 1024;

/// Device data, 0-based addressing
#[derive(Debug, Clone)]
pub struct DeviceImage {
    pub coils: Vec<bool>,
    pub discrete_inputs: Vec<bool>,
    pub holding_registers: Vec<Register>,
    pub input_registers: Vec<Register>,
}

impl Default for DeviceImage {
    fn default() -> Self {
        Self {
            coils: vec![false; IMAGE_SIZE],
            discrete_inputs: vec![false; IMAGE_SIZE],
            holding_registers: vec![0; IMAGE_SIZE],
            input_registers: vec![0; IMAGE_SIZE],
        }
    }
}

#[derive(Default)]
struct DeviceState {
    image: Mutex<DeviceImage>,
    requests: Mutex<Vec<ModbusRequest>>,
    silent: AtomicBool,
    wrong_echo: AtomicBool,
    connections: AtomicUsize,
}

/// Running mock device
pub struct MockDevice {
    state: Arc<DeviceState>,
    address: SocketAddr,
    task: JoinHandle<()>,
}

impl MockDevice {
    /// Serve Modbus TCP on an ephemeral localhost port
    pub async fn start_tcp() -> Self {
        Self::start_tcp_on(0).await
    }

    /// Serve Modbus TCP on a given localhost port
    pub async fn start_tcp_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let address = listener.local_addr().unwrap();
        let state = Arc::new(DeviceState::default());

        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_stream(stream, state.clone()));
                }
            })
        };

        Self { state, address, task }
    }

    /// Serve Modbus UDP on an ephemeral localhost port
    pub async fn start_udp() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        let state = Arc::new(DeviceState::default());

        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; MAX_FRAME_SIZE];
                while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                    if let Some(reply) = handle_frame(&buf[..n], &state) {
                        let _ = socket.send_to(&reply, peer).await;
                    }
                }
            })
        };

        Self { state, address, task }
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Stop answering requests (they are still recorded)
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Echo a write quantity one larger than requested
    pub fn set_wrong_echo(&self, wrong: bool) {
        self.state.wrong_echo.store(wrong, Ordering::SeqCst);
    }

    /// Modify the device image
    pub fn update<F: FnOnce(&mut DeviceImage)>(&self, f: F) {
        f(&mut self.state.image.lock().unwrap());
    }

    pub fn image(&self) -> DeviceImage {
        self.state.image.lock().unwrap().clone()
    }

    /// Requests received so far, in order
    pub fn requests(&self) -> Vec<ModbusRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_stream(mut stream: TcpStream, state: Arc<DeviceState>) {
    let mut header = [0u8; MBAP_HEADER_SIZE];
    loop {
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut frame = header.to_vec();
        frame.resize(MBAP_HEADER_SIZE - 1 + length.max(1), 0);
        if stream.read_exact(&mut frame[MBAP_HEADER_SIZE..]).await.is_err() {
            return;
        }

        if let Some(reply) = handle_frame(&frame, &state) {
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// Answer one MBAP frame; `None` when the device stays silent
fn handle_frame(frame: &[u8], state: &DeviceState) -> Option<Vec<u8>> {
    let header = MbapHeader::parse(frame).ok()?;
    let request = ModbusRequest::decode_pdu(header.unit_id, &frame[MBAP_HEADER_SIZE..]).ok()?;
    state.requests.lock().unwrap().push(request.clone());

    if state.silent.load(Ordering::SeqCst) {
        return None;
    }

    let pdu = match execute(&request, state) {
        Ok(pdu) => pdu,
        Err(exception) => vec![request.function.to_u8() | 0x80, exception.to_u8()],
    };

    let mut reply = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
    reply.extend_from_slice(&header.transaction_id.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    reply.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    reply.push(header.unit_id);
    reply.extend_from_slice(&pdu);
    Some(reply)
}

fn check_window(
    request: &ModbusRequest,
    limit: u16,
) -> Result<std::ops::Range<usize>, ModbusException> {
    if request.quantity == 0 || request.quantity > limit {
        return Err(ModbusException::IllegalDataValue);
    }
    let start = request.address as usize;
    let end = start + request.quantity as usize;
    if end > IMAGE_SIZE {
        return Err(ModbusException::IllegalDataAddress);
    }
    Ok(start..end)
}

fn execute(request: &ModbusRequest, state: &DeviceState) -> Result<Vec<u8>, ModbusException> {
    let mut image = state.image.lock().unwrap();
    let function = request.function.to_u8();

    let bits_reply = |bits: &[bool]| {
        let bytes = BitVector::from_bits(bits).to_bytes();
        let mut pdu = vec![function, bytes.len() as u8];
        pdu.extend_from_slice(&bytes);
        pdu
    };
    let registers_reply = |registers: &[Register]| {
        let bytes = registers_to_bytes(registers);
        let mut pdu = vec![function, bytes.len() as u8];
        pdu.extend_from_slice(&bytes);
        pdu
    };

    match request.function {
        ModbusFunction::ReadCoils => {
            let range = check_window(request, MAX_COILS_PER_REQUEST)?;
            Ok(bits_reply(&image.coils[range]))
        }
        ModbusFunction::ReadDiscreteInputs => {
            let range = check_window(request, MAX_COILS_PER_REQUEST)?;
            Ok(bits_reply(&image.discrete_inputs[range]))
        }
        ModbusFunction::ReadHoldingRegisters => {
            let range = check_window(request, MAX_REGISTERS_PER_REQUEST)?;
            Ok(registers_reply(&image.holding_registers[range]))
        }
        ModbusFunction::ReadInputRegisters => {
            let range = check_window(request, MAX_REGISTERS_PER_REQUEST)?;
            Ok(registers_reply(&image.input_registers[range]))
        }
        ModbusFunction::WriteMultipleCoils => {
            let range = check_window(request, 0x07B0)?;
            let coils = request
                .coils()
                .map_err(|_| ModbusException::IllegalDataValue)?;
            for (slot, bit) in image.coils[range].iter_mut().zip(coils.iter()) {
                *slot = bit;
            }
            Ok(write_echo(request, state))
        }
        ModbusFunction::WriteMultipleRegisters => {
            let range = check_window(request, 0x007B)?;
            let registers = request
                .registers()
                .map_err(|_| ModbusException::IllegalDataValue)?;
            if registers.len() != request.quantity as usize {
                return Err(ModbusException::IllegalDataValue);
            }
            image.holding_registers[range].copy_from_slice(&registers);
            Ok(write_echo(request, state))
        }
    }
}

fn write_echo(request: &ModbusRequest, state: &DeviceState) -> Vec<u8> {
    let quantity = if state.wrong_echo.load(Ordering::SeqCst) {
        request.quantity + 1
    } else {
        request.quantity
    };
    let mut pdu = vec![request.function.to_u8()];
    pdu.extend_from_slice(&request.address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// Count requests per function code
pub fn count_by_function(requests: &[ModbusRequest]) -> HashMap<ModbusFunction, usize> {
    let mut counts = HashMap::new();
    for request in requests {
        *counts.entry(request.function).or_insert(0) += 1;
    }
    counts
}

/// Modbus protocol definitions and PDU codec
///
/// This module contains the function codes supported by the master, the
/// reference window type, and the request/response structures together with
/// their PDU (function code + payload) encoding. Transport framing (MBAP header)
/// lives in [`crate::transport`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};
use crate::value::{registers_from_bytes, registers_to_bytes, BitVector, Register};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus unit identifier (sub-address behind a gateway)
pub type UnitId = u8;

/// Largest PDU a Modbus frame can carry (function code + 252 payload bytes)
pub const MAX_PDU_SIZE: usize = 253;

/// Modbus function codes used by the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::protocol(format!(
                "Unsupported function code: 0x{:02X}",
                value
            ))),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        !self.is_read_function()
    }

    /// Check if this function carries bit data
    pub fn is_bit_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::WriteMultipleCoils
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Contiguous block of bits or registers: `count` items from `start`
///
/// A valid window has `count > 0` and ends at or below address 65535. Device
/// limits (2000 bits, 125 registers) are not checked here: the device reports
/// oversized windows with an exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceWindow {
    pub start: ModbusAddress,
    pub count: u16,
}

impl ReferenceWindow {
    /// Create a validated window
    pub fn new(start: ModbusAddress, count: u16) -> ModbusResult<Self> {
        let window = Self { start, count };
        window.validate()?;
        Ok(window)
    }

    /// Check the window invariant
    pub fn validate(&self) -> ModbusResult<()> {
        if self.count == 0 {
            return Err(ModbusError::configuration(format!(
                "Reference window at {} has zero count",
                self.start
            )));
        }
        if self.start as u32 + self.count as u32 > 0x1_0000 {
            return Err(ModbusError::configuration(format!(
                "Reference window {}+{} overflows the 16-bit address space",
                self.start, self.count
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ReferenceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..+{}", self.start, self.count)
    }
}

/// Modbus request structure
///
/// `data` holds the write payload exactly as it goes on the wire (packed coil
/// bytes or big-endian registers) and is empty for reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a new read request over `window`
    pub fn new_read(unit_id: UnitId, function: ModbusFunction, window: ReferenceWindow) -> Self {
        Self {
            unit_id,
            function,
            address: window.start,
            quantity: window.count,
            data: Vec::new(),
        }
    }

    /// Create a write-multiple-coils request; quantity is the bit length
    pub fn write_coils(
        unit_id: UnitId,
        address: ModbusAddress,
        coils: &BitVector,
    ) -> ModbusResult<Self> {
        let quantity = u16::try_from(coils.len()).map_err(|_| {
            ModbusError::protocol(format!("{} coils exceed the quantity field", coils.len()))
        })?;
        let request = Self {
            unit_id,
            function: ModbusFunction::WriteMultipleCoils,
            address,
            quantity,
            data: coils.to_bytes(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Create a write-multiple-registers request
    pub fn write_registers(
        unit_id: UnitId,
        address: ModbusAddress,
        registers: &[Register],
    ) -> ModbusResult<Self> {
        let quantity = u16::try_from(registers.len()).map_err(|_| {
            ModbusError::protocol(format!(
                "{} registers exceed the quantity field",
                registers.len()
            ))
        })?;
        let request = Self {
            unit_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity,
            data: registers_to_bytes(registers),
        };
        request.validate()?;
        Ok(request)
    }

    /// Window addressed by this request
    pub fn window(&self) -> ReferenceWindow {
        ReferenceWindow {
            start: self.address,
            count: self.quantity,
        }
    }

    /// Validate that the request can be encoded without truncation
    ///
    /// For writes the window comes from the payload, so a window running past
    /// address 65535 is a protocol error like any other payload that cannot be
    /// encoded.
    pub fn validate(&self) -> ModbusResult<()> {
        if !self.function.is_write_function() {
            return self.window().validate();
        }

        if self.address as u32 + self.quantity as u32 > 0x1_0000 {
            return Err(ModbusError::protocol(format!(
                "{} items written at {} run past the 16-bit address space",
                self.quantity, self.address
            )));
        }
        if self.data.len() > u8::MAX as usize || 6 + self.data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::protocol(format!(
                "{} payload bytes do not fit a single {} request",
                self.data.len(),
                self.function
            )));
        }
        let expected = match self.function {
            ModbusFunction::WriteMultipleCoils => (self.quantity as usize + 7) / 8,
            _ => self.quantity as usize * 2,
        };
        if self.quantity == 0 || self.data.len() != expected {
            return Err(ModbusError::protocol(format!(
                "{} payload bytes do not match quantity {} of {}",
                self.data.len(),
                self.quantity,
                self.function
            )));
        }

        Ok(())
    }

    /// Encode the PDU: function code followed by its payload
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(6 + self.data.len());
        pdu.push(self.function.to_u8());
        pdu.extend_from_slice(&self.address.to_be_bytes());
        pdu.extend_from_slice(&self.quantity.to_be_bytes());

        if self.function.is_write_function() {
            pdu.push(self.data.len() as u8);
            pdu.extend_from_slice(&self.data);
        }

        pdu
    }

    /// Decode a request PDU, the inverse of [`ModbusRequest::encode_pdu`]
    pub fn decode_pdu(unit_id: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        if pdu.len() < 5 {
            return Err(ModbusError::frame("Request PDU too short"));
        }
        let function = ModbusFunction::from_u8(pdu[0])?;
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);

        let data = if function.is_write_function() {
            let byte_count = *pdu
                .get(5)
                .ok_or_else(|| ModbusError::frame("Write request without byte count"))?
                as usize;
            let payload = pdu
                .get(6..6 + byte_count)
                .ok_or_else(|| ModbusError::frame("Incomplete write payload"))?;
            payload.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            unit_id,
            function,
            address,
            quantity,
            data,
        })
    }

    /// Write payload as a bit vector of `quantity` bits (write-multiple-coils)
    pub fn coils(&self) -> ModbusResult<BitVector> {
        BitVector::from_packed(&self.data, self.quantity as usize)
    }

    /// Write payload as registers (write-multiple-registers)
    pub fn registers(&self) -> ModbusResult<Vec<Register>> {
        registers_from_bytes(&self.data)
    }
}

/// Modbus response structure
///
/// `data` is the PDU payload after the function code.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
}

/// Acknowledgment of a write-multiple request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub function: ModbusFunction,
    pub reference: ModbusAddress,
    pub count: u16,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new(unit_id: UnitId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            data,
        }
    }

    /// Decode a response PDU answering `request`
    ///
    /// Exception responses (function code with the high bit set) become
    /// [`ModbusError::Exception`]; a function code that does not answer the
    /// request is a protocol error.
    pub fn decode_pdu(unit_id: UnitId, pdu: &[u8], request: &ModbusRequest) -> ModbusResult<Self> {
        let (&function_code, payload) = pdu
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty response PDU"))?;
        let expected = request.function.to_u8();

        if function_code & 0x80 != 0 {
            if function_code & 0x7F != expected {
                return Err(ModbusError::protocol(format!(
                    "Exception for function 0x{:02X} answers request 0x{:02X}",
                    function_code & 0x7F,
                    expected
                )));
            }
            let code = *payload
                .first()
                .ok_or_else(|| ModbusError::frame("Exception response without code"))?;
            return Err(ModbusError::exception(expected, code));
        }

        if function_code != expected {
            return Err(ModbusError::protocol(format!(
                "Response function 0x{:02X} does not match request 0x{:02X}",
                function_code, expected
            )));
        }

        Ok(Self::new(unit_id, request.function, payload.to_vec()))
    }

    /// Encode the PDU of this response
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(1 + self.data.len());
        pdu.push(self.function.to_u8());
        pdu.extend_from_slice(&self.data);
        pdu
    }

    /// Byte-count prefixed payload of a read response
    fn read_payload(&self) -> ModbusResult<&[u8]> {
        let (&byte_count, rest) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::frame("Empty response data"))?;
        if rest.len() != byte_count as usize {
            return Err(ModbusError::frame(format!(
                "Byte count {} does not match {} payload bytes",
                byte_count,
                rest.len()
            )));
        }
        Ok(rest)
    }

    /// Parse response data as `count` bits (coils, discrete inputs)
    pub fn parse_bits(&self, count: u16) -> ModbusResult<BitVector> {
        if !self.function.is_bit_function() || self.function.is_write_function() {
            return Err(ModbusError::protocol(format!(
                "{} does not carry bit data",
                self.function
            )));
        }
        BitVector::from_packed(self.read_payload()?, count as usize)
    }

    /// Parse response data as `count` registers (holding, input registers)
    pub fn parse_registers(&self, count: u16) -> ModbusResult<Vec<Register>> {
        if self.function.is_bit_function() || self.function.is_write_function() {
            return Err(ModbusError::protocol(format!(
                "{} does not carry register data",
                self.function
            )));
        }
        let registers = registers_from_bytes(self.read_payload()?)?;
        if registers.len() != count as usize {
            return Err(ModbusError::decode(format!(
                "Expected {} registers, got {}",
                count,
                registers.len()
            )));
        }
        Ok(registers)
    }

    /// Parse the echoed address and quantity of a write response
    pub fn parse_write_ack(&self) -> ModbusResult<WriteAck> {
        if !self.function.is_write_function() {
            return Err(ModbusError::protocol(format!(
                "{} is not a write response",
                self.function
            )));
        }
        if self.data.len() != 4 {
            return Err(ModbusError::frame(format!(
                "Write response must carry 4 bytes, got {}",
                self.data.len()
            )));
        }
        Ok(WriteAck {
            function: self.function,
            reference: u16::from_be_bytes([self.data[0], self.data[1]]),
            count: u16::from_be_bytes([self.data[2], self.data[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: u16, count: u16) -> ReferenceWindow {
        ReferenceWindow::new(start, count).unwrap()
    }

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            ModbusFunction::from_u8(0x03).unwrap(),
            ModbusFunction::ReadHoldingRegisters
        );
        assert_eq!(ModbusFunction::WriteMultipleCoils.to_u8(), 0x0F);
        assert!(ModbusFunction::from_u8(0x05).is_err());
        assert!(ModbusFunction::WriteMultipleRegisters.is_write_function());
        assert!(ModbusFunction::ReadDiscreteInputs.is_bit_function());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(
            ModbusException::from_u8(0x02).unwrap(),
            ModbusException::IllegalDataAddress
        );
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert!(ModbusException::from_u8(0x07).is_none());
    }

    #[test]
    fn test_window_validation() {
        assert!(ReferenceWindow::new(0, 1).is_ok());
        assert!(ReferenceWindow::new(65535, 1).is_ok());
        assert!(ReferenceWindow::new(65530, 6).is_ok());
        assert!(ReferenceWindow::new(65530, 7).is_err());
        assert!(ReferenceWindow::new(10, 0).is_err());
        // device limits are left to the device
        assert!(ReferenceWindow::new(0, 2001).is_ok());
    }

    #[test]
    fn test_encode_read_request() {
        let request =
            ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, window(2, 1));
        assert_eq!(request.address, 2);
        assert_eq!(request.quantity, 1);
        assert_eq!(request.encode_pdu(), vec![0x03, 0x00, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_encode_write_requests() {
        let coils = BitVector::from_packed(&[0xCD, 0x01], 10).unwrap();
        let request = ModbusRequest::write_coils(1, 0x13, &coils).unwrap();
        assert_eq!(
            request.encode_pdu(),
            vec![0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );

        let request = ModbusRequest::write_registers(1, 1, &[0x000A, 0x0102]).unwrap();
        assert_eq!(
            request.encode_pdu(),
            vec![0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );

        let decoded = ModbusRequest::decode_pdu(1, &request.encode_pdu()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_oversized_write_is_rejected_not_truncated() {
        let registers = vec![0u16; 130];
        let err = ModbusRequest::write_registers(1, 0, &registers).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol { .. }));
    }

    #[test]
    fn test_write_past_address_space_is_protocol_error() {
        let err = ModbusRequest::write_registers(1, 0xFFFF, &[1, 2]).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol { .. }));
        assert!(!err.is_fatal());

        let bits = BitVector::new(2);
        let err = ModbusRequest::write_coils(1, 0xFFFF, &bits).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol { .. }));

        // the last address is still writable
        assert!(ModbusRequest::write_registers(1, 0xFFFF, &[1]).is_ok());
    }

    #[test]
    fn test_response_parsing() {
        let request =
            ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, window(0, 2));
        let response =
            ModbusResponse::decode_pdu(1, &[0x03, 0x04, 0x12, 0x34, 0x56, 0x78], &request).unwrap();
        assert_eq!(response.parse_registers(2).unwrap(), vec![0x1234, 0x5678]);
        assert!(matches!(
            response.parse_registers(3),
            Err(ModbusError::Decode { .. })
        ));

        let request = ModbusRequest::new_read(1, ModbusFunction::ReadCoils, window(0, 4));
        let response = ModbusResponse::decode_pdu(1, &[0x01, 0x01, 0b1010], &request).unwrap();
        let bits = response.parse_bits(4).unwrap();
        assert_eq!(bits.get(0), Some(false)); // LSB first
        assert_eq!(bits.get(1), Some(true));
        assert_eq!(bits.get(3), Some(true));
    }

    #[test]
    fn test_odd_register_payload_is_decode_error() {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, window(0, 1));
        let response =
            ModbusResponse::decode_pdu(1, &[0x04, 0x03, 0x00, 0x01, 0x02], &request).unwrap();
        assert!(matches!(
            response.parse_registers(1),
            Err(ModbusError::Decode { .. })
        ));
    }

    #[test]
    fn test_exception_response() {
        let request =
            ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, window(0, 200));
        let err = ModbusResponse::decode_pdu(1, &[0x83, 0x03], &request).unwrap_err();
        assert_eq!(err, ModbusError::exception(0x03, 0x03));
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_mismatched_function() {
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadCoils, window(0, 1));
        let err = ModbusResponse::decode_pdu(1, &[0x02, 0x01, 0x00], &request).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol { .. }));
    }

    #[test]
    fn test_write_ack() {
        let request = ModbusRequest::write_registers(1, 7, &[1, 2]).unwrap();
        let response =
            ModbusResponse::decode_pdu(1, &[0x10, 0x00, 0x07, 0x00, 0x02], &request).unwrap();
        let ack = response.parse_write_ack().unwrap();
        assert_eq!(ack.reference, 7);
        assert_eq!(ack.count, 2);
        assert_eq!(ack.function, ModbusFunction::WriteMultipleRegisters);
    }
}

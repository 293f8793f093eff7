/// Polled and written Modbus values
///
/// Bit data (coils, discrete inputs) travels as a [`BitVector`], register data
/// (holding and input registers) as a sequence of 16-bit [`Register`] values.
/// [`ModbusValue`] is the body handed to downstream sinks and accepted by the
/// write dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModbusError, ModbusResult};

/// A 16-bit register, transmitted high byte first
pub type Register = u16;

/// Ordered bit sequence backed by packed bytes
///
/// Bit 0 of byte 0 is the first logical bit, matching the Modbus coil and
/// discrete input packing. `len` is authoritative: bits of the last byte beyond
/// `len` are don't-care but are kept exactly as received so that converting a
/// response back to bytes reproduces the wire payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "PackedBits")]
pub struct BitVector {
    bytes: Vec<u8>,
    len: usize,
}

/// Serialized form of a [`BitVector`], checked before it becomes one
#[derive(Deserialize)]
struct PackedBits {
    bytes: Vec<u8>,
    len: usize,
}

impl TryFrom<PackedBits> for BitVector {
    type Error = ModbusError;

    fn try_from(packed: PackedBits) -> ModbusResult<Self> {
        Self::from_packed(&packed.bytes, packed.len)
    }
}

impl BitVector {
    /// Create an all-zero bit vector of `len` bits
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0u8; byte_count(len)],
            len,
        }
    }

    /// Create a bit vector covering every bit of `bytes` (length = 8 * bytes)
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            len: bytes.len() * 8,
        }
    }

    /// Create a bit vector of `len` bits from its packed representation
    ///
    /// Fails with a decode error unless `bytes` holds exactly `ceil(len / 8)` bytes.
    pub fn from_packed(bytes: &[u8], len: usize) -> ModbusResult<Self> {
        if bytes.len() != byte_count(len) {
            return Err(ModbusError::decode(format!(
                "{} bits need {} bytes, got {}",
                len,
                byte_count(len),
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
            len,
        })
    }

    /// Create a bit vector from individual bits
    pub fn from_bits(bits: &[bool]) -> Self {
        let mut vector = Self::new(bits.len());
        for (index, &bit) in bits.iter().enumerate() {
            if bit {
                vector.bytes[index / 8] |= 1 << (index % 8);
            }
        }
        vector
    }

    /// Number of logical bits
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of packed bytes backing the vector
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Get the bit at `index`, `None` past the end
    pub fn get(&self, index: usize) -> Option<bool> {
        if index >= self.len {
            return None;
        }
        Some(self.bytes[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Set the bit at `index`
    pub fn set(&mut self, index: usize, value: bool) -> ModbusResult<()> {
        if index >= self.len {
            return Err(ModbusError::decode(format!(
                "bit index {} out of range for {} bits",
                index, self.len
            )));
        }
        let mask = 1 << (index % 8);
        if value {
            self.bytes[index / 8] |= mask;
        } else {
            self.bytes[index / 8] &= !mask;
        }
        Ok(())
    }

    /// Iterate over the logical bits
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |index| self.bytes[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Packed bytes; always a fresh copy of the internal storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// Renders '0'/'1' per logical bit, a single space after every full group of 8
impl fmt::Display for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, bit) in self.iter().enumerate() {
            if index > 0 && index % 8 == 0 {
                f.write_str(" ")?;
            }
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Parses the display form; the bit length is the number of non-space characters
impl FromStr for BitVector {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spaces = s.chars().filter(|&c| c == ' ').count();
        let mut vector = BitVector::new(s.chars().count() - spaces);
        let mut index = 0;
        for c in s.chars() {
            match c {
                ' ' => continue,
                '0' => {}
                '1' => vector.set(index, true)?,
                other => {
                    return Err(ModbusError::decode(format!(
                        "invalid bit character {:?} in {:?}",
                        other, s
                    )))
                }
            }
            index += 1;
        }
        Ok(vector)
    }
}

fn byte_count(bits: usize) -> usize {
    (bits + 7) / 8
}

/// Register to its two raw bytes, high byte first
pub fn register_to_bytes(register: Register) -> [u8; 2] {
    register.to_be_bytes()
}

/// Register from its two raw bytes, high byte first
pub fn register_from_bytes(high: u8, low: u8) -> Register {
    Register::from_be_bytes([high, low])
}

/// Concatenate the raw bytes of every register, in order
pub fn registers_to_bytes(registers: &[Register]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(registers.len() * 2);
    for &register in registers {
        bytes.extend_from_slice(&register_to_bytes(register));
    }
    bytes
}

/// Split raw bytes into registers; odd-length input is a decode error
pub fn registers_from_bytes(bytes: &[u8]) -> ModbusResult<Vec<Register>> {
    if bytes.len() % 2 != 0 {
        return Err(ModbusError::decode(format!(
            "register data must have an even length, got {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| register_from_bytes(pair[0], pair[1]))
        .collect())
}

/// Format one register as `0xHHLL`
pub fn format_register(register: Register) -> String {
    let [high, low] = register_to_bytes(register);
    format!("0x{:02X}{:02X}", high, low)
}

/// Format a register sequence, registers separated by a single space
pub fn format_registers(registers: &[Register]) -> String {
    registers
        .iter()
        .map(|&register| format_register(register))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decoded body of a poll, or payload of a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ModbusValue {
    /// Coils or discrete inputs
    Bits(BitVector),
    /// Holding or input registers
    Registers(Vec<Register>),
}

impl ModbusValue {
    /// Human-readable shape name, used in type errors
    pub fn shape(&self) -> &'static str {
        match self {
            ModbusValue::Bits(_) => "bit vector",
            ModbusValue::Registers(_) => "register sequence",
        }
    }

    /// Number of bits or registers
    pub fn len(&self) -> usize {
        match self {
            ModbusValue::Bits(bits) => bits.len(),
            ModbusValue::Registers(registers) => registers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bits(&self) -> Option<&BitVector> {
        match self {
            ModbusValue::Bits(bits) => Some(bits),
            ModbusValue::Registers(_) => None,
        }
    }

    pub fn as_registers(&self) -> Option<&[Register]> {
        match self {
            ModbusValue::Registers(registers) => Some(registers),
            ModbusValue::Bits(_) => None,
        }
    }

    /// Raw payload bytes: packed bits, or registers high byte first
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ModbusValue::Bits(bits) => bits.to_bytes(),
            ModbusValue::Registers(registers) => registers_to_bytes(registers),
        }
    }
}

impl fmt::Display for ModbusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModbusValue::Bits(bits) => write!(f, "{}", bits),
            ModbusValue::Registers(registers) => f.write_str(&format_registers(registers)),
        }
    }
}

impl From<BitVector> for ModbusValue {
    fn from(bits: BitVector) -> Self {
        ModbusValue::Bits(bits)
    }
}

impl From<Vec<Register>> for ModbusValue {
    fn from(registers: Vec<Register>) -> Self {
        ModbusValue::Registers(registers)
    }
}

/// Change rule for bit data
///
/// Absent to present (or back) is a change; otherwise unequal bit lengths are a
/// change, and equal lengths compare the packed bytes.
pub fn bits_changed(old: Option<&BitVector>, new: Option<&BitVector>) -> bool {
    match (old, new) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(old), Some(new)) => old.len != new.len || old.bytes != new.bytes,
    }
}

/// Change rule for register data
///
/// Absent to present (or back) is a change; otherwise unequal lengths are a
/// change, and equal lengths compare register by register, stopping at the
/// first difference.
pub fn registers_changed(old: Option<&[Register]>, new: Option<&[Register]>) -> bool {
    match (old, new) {
        (None, None) => false,
        (Some(_), None) | (None, Some(_)) => true,
        (Some(old), Some(new)) => {
            if old.len() != new.len() {
                return true;
            }
            old.iter()
                .zip(new)
                .any(|(&a, &b)| register_to_bytes(a) != register_to_bytes(b))
        }
    }
}

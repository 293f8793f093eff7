//! # Data Type Codec
//!
//! A poller or writer is parameterized by a [`DataType`]. Each data type maps to
//! one row of a static lookup table ([`DataTypeCodec`]) holding its read function,
//! optional write function, body decoder, write encoder and change rule:
//!
//! | Data Type | Read | Write | Body |
//! |-----------|------|-------|------|
//! | DiscreteInputs | 0x02 | - | Bit vector |
//! | Coils | 0x01 | 0x0F | Bit vector |
//! | HoldingRegisters | 0x03 | 0x10 | Register sequence |
//! | InputRegisters | 0x04 | - | Register sequence |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    ModbusAddress, ModbusFunction, ModbusRequest, ModbusResponse, ReferenceWindow, UnitId,
};
use crate::value::{bits_changed, registers_changed, ModbusValue};

/// Modbus object type a poller reads or a writer writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    DiscreteInputs,
    Coils,
    HoldingRegisters,
    InputRegisters,
}

type DecodeFn = fn(&ModbusResponse, u16) -> ModbusResult<ModbusValue>;
type EncodeWriteFn = fn(UnitId, ModbusAddress, &ModbusValue) -> ModbusResult<ModbusRequest>;
type ChangedFn = fn(Option<&ModbusValue>, Option<&ModbusValue>) -> bool;

/// Per data type codec entry
pub struct DataTypeCodec {
    pub data_type: DataType,
    pub read_function: ModbusFunction,
    pub write_function: Option<ModbusFunction>,
    /// Shape of the body, as reported in type errors
    pub shape: &'static str,
    decode: DecodeFn,
    encode_write: Option<EncodeWriteFn>,
    changed: ChangedFn,
}

static CODECS: [DataTypeCodec; 4] = [
    DataTypeCodec {
        data_type: DataType::DiscreteInputs,
        read_function: ModbusFunction::ReadDiscreteInputs,
        write_function: None,
        shape: BITS,
        decode: decode_bits,
        encode_write: None,
        changed: value_bits_changed,
    },
    DataTypeCodec {
        data_type: DataType::Coils,
        read_function: ModbusFunction::ReadCoils,
        write_function: Some(ModbusFunction::WriteMultipleCoils),
        shape: BITS,
        decode: decode_bits,
        encode_write: Some(encode_write_coils),
        changed: value_bits_changed,
    },
    DataTypeCodec {
        data_type: DataType::HoldingRegisters,
        read_function: ModbusFunction::ReadHoldingRegisters,
        write_function: Some(ModbusFunction::WriteMultipleRegisters),
        shape: REGISTERS,
        decode: decode_registers,
        encode_write: Some(encode_write_registers),
        changed: value_registers_changed,
    },
    DataTypeCodec {
        data_type: DataType::InputRegisters,
        read_function: ModbusFunction::ReadInputRegisters,
        write_function: None,
        shape: REGISTERS,
        decode: decode_registers,
        encode_write: None,
        changed: value_registers_changed,
    },
];

const BITS: &str = "bit vector";
const REGISTERS: &str = "register sequence";

impl DataType {
    /// All supported data types
    pub const ALL: [DataType; 4] = [
        DataType::DiscreteInputs,
        DataType::Coils,
        DataType::HoldingRegisters,
        DataType::InputRegisters,
    ];

    /// Lookup table entry for this data type
    pub fn codec(self) -> &'static DataTypeCodec {
        let index = match self {
            DataType::DiscreteInputs => 0,
            DataType::Coils => 1,
            DataType::HoldingRegisters => 2,
            DataType::InputRegisters => 3,
        };
        &CODECS[index]
    }

    /// Check if the data type accepts writes
    pub fn is_writable(self) -> bool {
        self.codec().write_function.is_some()
    }

    /// Configuration name of the data type
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::DiscreteInputs => "discreteInputs",
            DataType::Coils => "coils",
            DataType::HoldingRegisters => "registers",
            DataType::InputRegisters => "inputRegisters",
        }
    }
}

impl DataTypeCodec {
    /// Build the read request covering `window`
    pub fn read_request(&self, unit_id: UnitId, window: ReferenceWindow) -> ModbusRequest {
        ModbusRequest::new_read(unit_id, self.read_function, window)
    }

    /// Decode a read response body of `count` items
    pub fn decode(&self, response: &ModbusResponse, count: u16) -> ModbusResult<ModbusValue> {
        (self.decode)(response, count)
    }

    /// Build the write request for `value` starting at `reference`
    ///
    /// Fails with a configuration error for read-only types and with a type
    /// error when the value's shape does not belong to this data type.
    pub fn write_request(
        &self,
        unit_id: UnitId,
        reference: ModbusAddress,
        value: &ModbusValue,
    ) -> ModbusResult<ModbusRequest> {
        let encode = self.encode_write.ok_or_else(|| {
            ModbusError::configuration(format!("Data type {} is read-only", self.data_type))
        })?;
        if value.shape() != self.shape {
            return Err(ModbusError::type_mismatch(self.shape, value.shape()));
        }
        if value.is_empty() {
            return Err(ModbusError::type_mismatch(
                format!("non-empty {}", self.shape),
                format!("empty {}", value.shape()),
            ));
        }
        encode(unit_id, reference, value)
    }

    /// Apply the data type's change rule
    pub fn changed(&self, old: Option<&ModbusValue>, new: Option<&ModbusValue>) -> bool {
        (self.changed)(old, new)
    }
}

fn decode_bits(response: &ModbusResponse, count: u16) -> ModbusResult<ModbusValue> {
    response.parse_bits(count).map(ModbusValue::Bits)
}

fn decode_registers(response: &ModbusResponse, count: u16) -> ModbusResult<ModbusValue> {
    response.parse_registers(count).map(ModbusValue::Registers)
}

fn encode_write_coils(
    unit_id: UnitId,
    reference: ModbusAddress,
    value: &ModbusValue,
) -> ModbusResult<ModbusRequest> {
    let bits = value
        .as_bits()
        .ok_or_else(|| ModbusError::type_mismatch(BITS, value.shape()))?;
    ModbusRequest::write_coils(unit_id, reference, bits)
}

fn encode_write_registers(
    unit_id: UnitId,
    reference: ModbusAddress,
    value: &ModbusValue,
) -> ModbusResult<ModbusRequest> {
    let registers = value
        .as_registers()
        .ok_or_else(|| ModbusError::type_mismatch(REGISTERS, value.shape()))?;
    ModbusRequest::write_registers(unit_id, reference, registers)
}

fn value_bits_changed(old: Option<&ModbusValue>, new: Option<&ModbusValue>) -> bool {
    bits_changed(old.and_then(ModbusValue::as_bits), new.and_then(ModbusValue::as_bits))
}

fn value_registers_changed(old: Option<&ModbusValue>, new: Option<&ModbusValue>) -> bool {
    registers_changed(
        old.and_then(ModbusValue::as_registers),
        new.and_then(ModbusValue::as_registers),
    )
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discreteinputs" => Ok(DataType::DiscreteInputs),
            "coils" => Ok(DataType::Coils),
            "registers" | "register" => Ok(DataType::HoldingRegisters),
            "inputregisters" | "inputregister" => Ok(DataType::InputRegisters),
            _ => Err(ModbusError::configuration(format!(
                "Unsupported data type: {}",
                s
            ))),
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::BitVector;

    #[test]
    fn test_data_type_parsing() {
        assert_eq!("discreteInputs".parse::<DataType>().unwrap(), DataType::DiscreteInputs);
        assert_eq!("COILS".parse::<DataType>().unwrap(), DataType::Coils);
        assert_eq!("register".parse::<DataType>().unwrap(), DataType::HoldingRegisters);
        assert_eq!("registers".parse::<DataType>().unwrap(), DataType::HoldingRegisters);
        assert_eq!("inputRegister".parse::<DataType>().unwrap(), DataType::InputRegisters);

        let err = "holding".parse::<DataType>().unwrap_err();
        assert!(matches!(err, ModbusError::Configuration { .. }));
    }

    #[test]
    fn test_lookup_table_rows_match_keys() {
        for data_type in DataType::ALL {
            assert_eq!(data_type.codec().data_type, data_type);
            assert_eq!(data_type.as_str().parse::<DataType>().unwrap(), data_type);
        }
        assert!(DataType::Coils.is_writable());
        assert!(DataType::HoldingRegisters.is_writable());
        assert!(!DataType::DiscreteInputs.is_writable());
        assert!(!DataType::InputRegisters.is_writable());
    }

    #[test]
    fn test_registers_read_request() {
        let codec = DataType::HoldingRegisters.codec();
        let request = codec.read_request(0, ReferenceWindow::new(2, 1).unwrap());
        assert_eq!(request.address, 2);
        assert_eq!(request.quantity, 1);
        assert_eq!(request.encode_pdu(), vec![0x03, 0x00, 0x02, 0x00, 0x01]);

        let response = ModbusResponse::decode_pdu(0, &[0x03, 0x02, 0x00, 0x2A], &request).unwrap();
        let value = codec.decode(&response, 1).unwrap();
        assert_eq!(value, ModbusValue::Registers(vec![42]));
    }

    #[test]
    fn test_write_request_shape_checks() {
        let coils = DataType::Coils.codec();
        let registers = ModbusValue::Registers(vec![1, 2]);
        let err = coils.write_request(1, 0, &registers).unwrap_err();
        assert_eq!(err, ModbusError::type_mismatch("bit vector", "register sequence"));

        let empty = ModbusValue::Bits(BitVector::new(0));
        assert!(matches!(
            coils.write_request(1, 0, &empty),
            Err(ModbusError::Type { .. })
        ));

        let inputs = DataType::InputRegisters.codec();
        assert!(matches!(
            inputs.write_request(1, 0, &registers),
            Err(ModbusError::Configuration { .. })
        ));
    }

    #[test]
    fn test_change_rule_dispatch() {
        let codec = DataType::DiscreteInputs.codec();
        let a = ModbusValue::Bits(BitVector::from_bytes(&[0x01]));
        let b = ModbusValue::Bits(BitVector::from_bytes(&[0x02]));
        assert!(!codec.changed(None, None));
        assert!(codec.changed(None, Some(&a)));
        assert!(!codec.changed(Some(&a), Some(&a)));
        assert!(codec.changed(Some(&a), Some(&b)));

        let codec = DataType::InputRegisters.codec();
        let x = ModbusValue::Registers(vec![1]);
        let y = ModbusValue::Registers(vec![1, 0]);
        assert!(codec.changed(Some(&x), Some(&y)));
        assert!(codec.changed(Some(&x), None));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&DataType::InputRegisters).unwrap();
        assert_eq!(json, "\"inputRegisters\"");
        let parsed: DataType = serde_json::from_str("\"Register\"").unwrap();
        assert_eq!(parsed, DataType::HoldingRegisters);
    }
}

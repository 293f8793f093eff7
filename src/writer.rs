//! # Write Dispatcher
//!
//! A [`ModbusWriter`] turns one payload into one write-multiple transaction at
//! the configured reference address and returns the device's acknowledgment.
//! Coils take a [`BitVector`](crate::value::BitVector), holding registers take
//! a register sequence; any other shape is a type error and is never coerced.

use log::debug;
use std::sync::Arc;

use crate::codec::{DataType, DataTypeCodec};
use crate::config::EndpointConfig;
use crate::connection::ModbusConnection;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusAddress, ModbusRequest, WriteAck};
use crate::value::ModbusValue;

/// One-shot writer for coils or holding registers
pub struct ModbusWriter {
    data_type: DataType,
    reference: ModbusAddress,
    codec: &'static DataTypeCodec,
    connection: Arc<ModbusConnection>,
}

impl ModbusWriter {
    /// Create a writer with its own connection
    pub fn new(config: &EndpointConfig) -> ModbusResult<Self> {
        let connection = Arc::new(ModbusConnection::new(config.descriptor()));
        Self::with_connection(config, connection)
    }

    /// Create a writer on an existing connection handle
    ///
    /// Read-only data types are rejected with a configuration error.
    pub fn with_connection(
        config: &EndpointConfig,
        connection: Arc<ModbusConnection>,
    ) -> ModbusResult<Self> {
        config.validate()?;
        if !config.data_type.is_writable() {
            return Err(ModbusError::configuration(format!(
                "Data type {} cannot be written",
                config.data_type
            )));
        }

        Ok(Self {
            data_type: config.data_type,
            reference: config.reference_address,
            codec: config.data_type.codec(),
            connection,
        })
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn connection(&self) -> &Arc<ModbusConnection> {
        &self.connection
    }

    /// Build the write request for `value` without sending it
    pub fn build_request(&self, value: &ModbusValue) -> ModbusResult<ModbusRequest> {
        self.codec
            .write_request(self.connection.unit_id(), self.reference, value)
    }

    /// Write `value` and return the decoded acknowledgment
    ///
    /// The acknowledgment must echo the written reference and count.
    pub async fn write(&self, value: &ModbusValue) -> ModbusResult<WriteAck> {
        let request = self.build_request(value)?;
        let response = self.connection.execute(&request).await?;
        let ack = response.parse_write_ack()?;

        if ack.reference != request.address || ack.count != request.quantity {
            return Err(ModbusError::protocol(format!(
                "Write acknowledged {}+{}, requested {}+{}",
                ack.reference, ack.count, request.address, request.quantity
            )));
        }

        debug!(
            "Wrote {} {} at {} on {}",
            ack.count,
            self.data_type,
            ack.reference,
            self.connection.descriptor()
        );
        Ok(ack)
    }

    /// Close the writer's connection
    pub async fn close(&self) -> ModbusResult<()> {
        self.connection.close().await
    }
}

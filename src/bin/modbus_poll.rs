/// Modbus Poll
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Polls one endpoint described by a JSON file and prints every forwarded
/// value until Ctrl+C, or writes one value and prints the acknowledgment.
///
/// Usage:
///   modbus_poll <endpoint.json> [--log] [--packets]
///   modbus_poll <endpoint.json> --write <value> [--log]
///
/// A coil value is a bit string such as "10110000 01"; a register value is a
/// comma separated list such as "0x1234,42".

use tokio::sync::mpsc;
use modbus_poll::utils::format::format_metrics;
use modbus_poll::{
    console_logger, BitVector, DataType, EndpointConfig, ModbusConnection, ModbusPoller,
    ModbusValue, ModbusWriter,
};
use std::sync::Arc;

fn parse_value(
    data_type: DataType,
    text: &str,
) -> Result<ModbusValue, Box<dyn std::error::Error>> {
    match data_type {
        DataType::Coils | DataType::DiscreteInputs => {
            Ok(ModbusValue::Bits(text.parse::<BitVector>()?))
        }
        DataType::HoldingRegisters | DataType::InputRegisters => {
            let mut registers = Vec::new();
            for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let register = match item.strip_prefix("0x").or_else(|| item.strip_prefix("0X")) {
                    Some(hex) => u16::from_str_radix(hex, 16)?,
                    None => item.parse::<u16>()?,
                };
                registers.push(register);
            }
            Ok(ModbusValue::Registers(registers))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(path) = args.first() else {
        eprintln!("Usage: modbus_poll <endpoint.json> [--write <value>] [--log] [--packets]");
        std::process::exit(2);
    };

    let config = EndpointConfig::from_file(path)?;
    let write_value = args
        .iter()
        .position(|arg| arg == "--write")
        .and_then(|i| args.get(i + 1));

    let packets = args.iter().any(|a| a == "--packets");
    let mut connection = ModbusConnection::new(config.descriptor()).with_packet_logging(packets);
    if args.iter().any(|a| a == "--log") {
        connection = connection.with_logger(console_logger!());
    }
    let connection = Arc::new(connection);

    println!("Modbus Poll {}", modbus_poll::VERSION);
    println!("==============");
    println!("Endpoint: {}", connection.descriptor());
    println!("Data type: {} {}", config.data_type, config.window());

    if let Some(text) = write_value {
        let value = parse_value(config.data_type, text)?;
        let writer = ModbusWriter::with_connection(&config, connection)?;
        match writer.write(&value).await {
            Ok(ack) => println!("✅ Wrote {} items at {}", ack.count, ack.reference),
            Err(e) => eprintln!("❌ Write failed: {}", e),
        }
        writer.close().await?;
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel::<ModbusValue>(64);
    let handle = ModbusPoller::with_connection(config.clone(), connection)?.spawn(tx);
    let changes_only = config.changes_only;

    loop {
        tokio::select! {
            value = rx.recv() => match value {
                Some(value) => {
                    let marker = if changes_only { "changed" } else { "polled" };
                    let now = chrono::Local::now().format("%H:%M:%S%.3f");
                    println!("[{}] {}: {}", now, marker, value);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    match handle.stop().await {
        Ok(poller) => println!("\n{}", format_metrics(poller.metrics())),
        Err(e) => eprintln!("❌ Polling stopped: {}", e),
    }
    Ok(())
}

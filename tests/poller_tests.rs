//! Integration tests for the polling engine against a scripted device

mod common;

use common::MockDevice;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use modbus_poll::utils::logging::init_test_logger;
use modbus_poll::*;

fn endpoint(protocol: Protocol, port: u16, data_type: DataType) -> EndpointConfig {
    let mut config = EndpointConfig::new(protocol, "127.0.0.1", data_type);
    config.port = port;
    config.unit_id = 1;
    config.timeout_ms = 500;
    config.initial_delay_ms = 0;
    config.poll_delay_ms = 20;
    config
}

#[tokio::test]
async fn test_changes_only_discrete_inputs() {
    init_test_logger();
    let device = MockDevice::start_tcp().await;
    device.update(|image| {
        image.discrete_inputs[2] = true;
        image.discrete_inputs[9] = true;
    });

    let mut config = endpoint(Protocol::Tcp, device.port(), DataType::DiscreteInputs);
    config.reference_address = 2;
    config.count = 8;
    config.changes_only = true;
    let mut poller = ModbusPoller::new(config).unwrap();
    let mut sink: Vec<ModbusValue> = Vec::new();

    // nothing polled before, so the first value always counts as changed
    assert!(poller.poll(&mut sink).await.unwrap());
    assert_eq!(sink.len(), 1);
    let bits = sink[0].as_bits().unwrap();
    assert_eq!(bits.len(), 8);
    assert_eq!(bits.to_string(), "10000001");

    // identical device state
    assert!(!poller.poll(&mut sink).await.unwrap());
    assert_eq!(sink.len(), 1);
    assert_eq!(poller.state(), PollerState::Idle);

    device.update(|image| image.discrete_inputs[5] = true);
    assert!(poller.poll(&mut sink).await.unwrap());
    assert_eq!(sink.len(), 2);
    assert_eq!(sink[1].as_bits().unwrap().to_string(), "10010001");

    let requests = device.requests();
    assert_eq!(requests.len(), 3);
    for request in &requests {
        assert_eq!(request.function, ModbusFunction::ReadDiscreteInputs);
        assert_eq!(request.address, 2);
        assert_eq!(request.quantity, 8);
        assert_eq!(request.unit_id, 1);
    }
    // one socket for all ticks
    assert_eq!(device.connections(), 1);
    assert_eq!(poller.metrics().successful_requests, 3);
}

#[tokio::test]
async fn test_forward_every_tick_when_not_filtering() {
    let device = MockDevice::start_tcp().await;
    device.update(|image| image.holding_registers[2] = 0x00FF);

    let mut config = endpoint(Protocol::Tcp, device.port(), DataType::HoldingRegisters);
    config.reference_address = 2;
    let mut poller = ModbusPoller::new(config).unwrap();
    let mut sink: Vec<ModbusValue> = Vec::new();

    for _ in 0..3 {
        assert!(poller.poll(&mut sink).await.unwrap());
    }
    assert_eq!(sink, vec![ModbusValue::Registers(vec![0x00FF]); 3]);
    assert_eq!(poller.last_polled(), Some(&ModbusValue::Registers(vec![0x00FF])));

    let request = &device.requests()[0];
    assert_eq!(request.function, ModbusFunction::ReadHoldingRegisters);
    assert_eq!(request.address, 2);
    assert_eq!(request.quantity, 1);
}

#[tokio::test]
async fn test_spawned_udp_poller_reports_changes() {
    init_test_logger();
    let device = MockDevice::start_udp().await;
    device.update(|image| image.input_registers[..3].copy_from_slice(&[1, 2, 3]));

    let mut config = endpoint(Protocol::Udp, device.port(), DataType::InputRegisters);
    config.count = 3;
    config.changes_only = true;
    let (tx, mut rx) = mpsc::channel::<ModbusValue>(8);
    let handle = ModbusPoller::new(config).unwrap().spawn(tx);

    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, ModbusValue::Registers(vec![1, 2, 3]));

    device.update(|image| image.input_registers[1] = 0xABCD);
    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(second, ModbusValue::Registers(vec![1, 0xABCD, 3]));

    let poller = handle.stop().await.unwrap();
    assert_eq!(poller.last_polled(), Some(&second));
    assert!(!poller.connection().is_connected());
    // unchanged ticks were polled but not forwarded
    assert!(poller.metrics().successful_requests >= 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_timeout_keeps_connection_open() {
    let device = MockDevice::start_tcp().await;
    let mut config = endpoint(Protocol::Tcp, device.port(), DataType::Coils);
    config.timeout_ms = 100;
    let mut poller = ModbusPoller::new(config).unwrap();
    let mut sink: Vec<ModbusValue> = Vec::new();

    device.set_silent(true);
    let err = poller.poll(&mut sink).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));
    assert!(err.is_recoverable());
    assert!(poller.connection().is_connected());
    assert_eq!(poller.state(), PollerState::Idle);

    device.set_silent(false);
    assert!(poller.poll(&mut sink).await.unwrap());
    assert_eq!(sink.len(), 1);
    assert_eq!(device.connections(), 1);
}

#[tokio::test]
async fn test_stop_does_not_wait_for_pending_receive() {
    let device = MockDevice::start_tcp().await;
    device.set_silent(true);

    let mut config = endpoint(Protocol::Tcp, device.port(), DataType::HoldingRegisters);
    config.timeout_ms = 30_000;
    let handle = ModbusPoller::new(config).unwrap().spawn(Vec::<ModbusValue>::new());

    // wait until the first request is in flight
    timeout(Duration::from_secs(2), async {
        while device.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let poller = timeout(Duration::from_secs(2), handle.stop())
        .await
        .expect("stop must not wait for the receive timeout")
        .unwrap();
    assert!(poller.last_polled().is_none());
}

#[tokio::test]
async fn test_unreachable_device_then_recovery() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = endpoint(Protocol::Tcp, port, DataType::Coils);
    let mut poller = ModbusPoller::new(config).unwrap();
    let mut sink: Vec<ModbusValue> = Vec::new();

    let err = poller.poll(&mut sink).await.unwrap_err();
    assert!(matches!(err, ModbusError::Connection { .. }));
    assert!(!poller.connection().is_connected());

    let device = MockDevice::start_tcp_on(port).await;
    device.update(|image| image.coils[0] = true);
    assert!(poller.poll(&mut sink).await.unwrap());
    assert_eq!(sink[0].as_bits().unwrap().get(0), Some(true));
    assert_eq!(poller.metrics().failed_requests, 1);
    assert_eq!(poller.metrics().consecutive_failures, 0);
}

#[tokio::test]
async fn test_device_exception_is_surfaced() {
    let device = MockDevice::start_tcp().await;
    let mut config = endpoint(Protocol::Tcp, device.port(), DataType::HoldingRegisters);
    // more than a device accepts in one request; must not be truncated locally
    config.count = 200;
    let mut poller = ModbusPoller::new(config).unwrap();
    let mut sink: Vec<ModbusValue> = Vec::new();

    let err = poller.poll(&mut sink).await.unwrap_err();
    assert_eq!(err, ModbusError::exception(0x03, 0x03));
    assert!(err.is_protocol_error());
    assert!(poller.last_polled().is_none());
    assert_eq!(device.requests()[0].quantity, 200);

    // the next tick runs independently on the same socket
    let err = poller.poll(&mut sink).await.unwrap_err();
    assert!(matches!(err, ModbusError::Exception { .. }));
    assert_eq!(device.connections(), 1);
}

#[tokio::test]
async fn test_sink_failure_still_updates_last_value() {
    let device = MockDevice::start_tcp().await;
    device.update(|image| image.coils[3] = true);

    let mut config = endpoint(Protocol::Tcp, device.port(), DataType::Coils);
    config.count = 4;
    config.changes_only = true;
    let mut poller = ModbusPoller::new(config).unwrap();

    let (tx, rx) = mpsc::channel::<ModbusValue>(1);
    drop(rx);
    let mut sink = tx;
    let err = poller.poll(&mut sink).await.unwrap_err();
    assert!(matches!(err, ModbusError::Sink { .. }));
    assert_eq!(poller.last_polled().unwrap().to_string(), "0001");

    // the value was recorded, so an unchanged device forwards nothing
    assert!(!poller.poll(&mut sink).await.unwrap());
}

#[tokio::test]
async fn test_resolution_failure_stops_spawned_poller() {
    let config = endpoint(Protocol::Tcp, 502, DataType::Coils);
    let config = EndpointConfig {
        host: "device.invalid".to_string(),
        ..config
    };
    let (tx, mut rx) = mpsc::channel::<ModbusValue>(1);
    let handle = ModbusPoller::new(config).unwrap().spawn(tx);

    // the task ends on its own and drops the sender
    assert!(timeout(Duration::from_secs(10), rx.recv()).await.unwrap().is_none());
    let err = handle.stop().await.err().unwrap();
    assert!(matches!(err, ModbusError::Resolution { .. }));
}

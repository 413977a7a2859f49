//! Driver Integration Tests
//!
//! Runs every driver against the scripted mock devices of `serial-proxy`.
//!
//! Run with: `cargo test -p bench-drivers --test drivers`

use bench_drivers::{
    ActualValues, DriverError, FgSource, MeasurementMode, PowerMaster8121, RefMeter, ZifVersion,
};
use futures::future::join_all;
use serial_proxy::frame::{encode_command, ACK};
use serial_proxy::interface_log::PayloadEncoding;
use serial_proxy::mock::{self, MockHandle, ScriptedPort};
use serial_proxy::{
    CancellationToken, ErrorKind, LogSource, LogSourceKind, MemoryInterfaceLogger, ProtocolError,
    SerialError, SerialPortConnection, SerialPortExecutor, SerialPortOptions,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn executor(port: ScriptedPort, kind: LogSourceKind) -> (SerialPortExecutor, MockHandle) {
    let handle = port.handle();
    let connection = SerialPortConnection::from_transport(
        "bench",
        Box::new(port),
        SerialPortOptions::unit_test(Duration::from_millis(200)),
    )
    .unwrap();
    let source = LogSource::new(kind, connection.endpoint());
    (SerialPortExecutor::unlogged(Arc::new(connection), source), handle)
}

// =============================================================================
// Reference Meter
// =============================================================================

#[tokio::test]
async fn test_actual_values_are_shared_per_round() {
    // slow replies keep the round pending until every caller has joined
    let port = mock::mt786().with_latency(Duration::from_millis(20));
    let (executor, handle) = executor(port, LogSourceKind::RefMeter);
    let meter = RefMeter::new(executor);

    let first = join_all((0..10).map(|_| meter.actual_values())).await;
    for values in &first {
        assert_eq!(values.as_ref().unwrap().frequency, Some(50.0));
    }
    assert_eq!(handle.count_of("AME"), 1);

    let second = join_all((0..10).map(|_| meter.actual_values())).await;
    for values in &second {
        assert_eq!(values.as_ref().unwrap().frequency, Some(50.01));
    }
    assert_eq!(handle.count_of("AME"), 2);
    assert_eq!(handle.count_of("ATI01"), 2);
}

#[tokio::test]
async fn test_actual_values_parse_full_reply() {
    let (executor, _) = executor(mock::mt786(), LogSourceKind::RefMeter);
    let values = RefMeter::new(executor).actual_values().await.unwrap();

    assert_eq!(values.phases[0].voltage, Some(230.0));
    assert_eq!(values.phases[1].current, Some(5.01));
    assert_eq!(values.phases[1].angle_voltage, Some(120.0));
    assert_eq!(values.phases[2].angle_current, Some(240.5));
    assert_eq!(values.phases[0].power_factor, Some(0.99965084));
    assert_eq!(values.phase_order.as_deref(), Some("123"));
}

#[tokio::test]
async fn test_repeated_index_overwrites() {
    let (executor, _) = executor(
        mock::fixed_reply(["ATIACK", "28;1", "28;2", "AMEACK"]),
        LogSourceKind::RefMeter,
    );
    let values = RefMeter::new(executor).actual_values().await.unwrap();
    assert_eq!(values.frequency, Some(2.0));
}

#[tokio::test]
async fn test_empty_actual_value_reply() {
    let (executor, _) = executor(mock::fixed_reply(["ATIACK", "AMEACK"]), LogSourceKind::RefMeter);
    let values = RefMeter::new(executor).actual_values().await.unwrap();
    assert_eq!(values, ActualValues::default());
}

#[tokio::test]
async fn test_missing_acknowledge_times_out() {
    let (executor, _) = executor(mock::fixed_reply(["ATIACK", "0;1"]), LogSourceKind::RefMeter);
    let error = RefMeter::new(executor).actual_values().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_measurement_modes_and_firmware() {
    let (executor, _) = executor(mock::mt786(), LogSourceKind::RefMeter);
    let meter = RefMeter::new(executor);

    assert_eq!(
        meter.measurement_modes().await.unwrap(),
        vec![
            MeasurementMode::TwoWireActivePower,
            MeasurementMode::ThreeWireActivePower,
            MeasurementMode::FourWireActivePower,
        ]
    );
    let firmware = meter.firmware_version().await.unwrap();
    assert_eq!(firmware.model, "MT786");
    assert_eq!(firmware.version, "06.33");
}

// =============================================================================
// FG30x Source
// =============================================================================

#[tokio::test]
async fn test_dosage_cycle() {
    let (executor, handle) = executor(mock::fg30x(), LogSourceKind::Source);
    let source = FgSource::new(executor);

    source.set_dosage_energy(12_500.0).await.unwrap();
    assert_eq!(handle.count_of("3PS45;12.5"), 1);

    let idle = source.dosage_progress().await.unwrap();
    assert!(!idle.active);
    assert_eq!(idle.total, 12_500.0);
    assert_eq!(idle.remaining, 0.0);
    assert_eq!(idle.progress, 12_500.0);

    source.set_dosage_mode(true).await.unwrap();
    assert!(source.current_switched_off_for_dosage().await.unwrap());

    source.start_dosage().await.unwrap();
    assert!(source.dosage_progress().await.unwrap().active);
    assert!(!source.current_switched_off_for_dosage().await.unwrap());

    source.cancel_dosage().await.unwrap();
    assert!(!source.dosage_progress().await.unwrap().active);
}

#[tokio::test]
async fn test_negative_dosage_energy_is_rejected() {
    let (executor, handle) = executor(mock::fg30x(), LogSourceKind::Source);
    let result = FgSource::new(executor).set_dosage_energy(-1.0).await;

    assert!(matches!(result, Err(DriverError::InvalidArgument(_))));
    assert!(handle.written_lines().is_empty());
}

#[tokio::test]
async fn test_unexpected_source_reply_is_protocol_error() {
    let port = ScriptedPort::new("fg").reply("3SA1", ["ERR"]);
    let (executor, _) = executor(port, LogSourceKind::Source);

    let error = FgSource::new(executor).dosage_progress().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_unparsable_energy_is_invalid_number() {
    let port = ScriptedPort::new("fg")
        .reply("3SA1", ["OK3SA1;2"])
        .reply("3MA1", ["OK3MA1;0.5"])
        .reply("3PA45", ["OK3PA45;abc"]);
    let (executor, _) = executor(port, LogSourceKind::Source);

    let error = FgSource::new(executor).dosage_progress().await.unwrap_err();
    assert_eq!(
        error,
        DriverError::Serial(SerialError::Protocol(ProtocolError::InvalidNumber(
            "abc".to_string()
        )))
    );
    assert_eq!(error.kind(), ErrorKind::Protocol);
}

// =============================================================================
// ZIF Socket
// =============================================================================

#[tokio::test]
async fn test_zif_queries() {
    let (executor, _) = executor(mock::zif8121(), LogSourceKind::Zif);
    let socket = PowerMaster8121::new(executor);

    assert_eq!(socket.version().await.unwrap(), ZifVersion { major: 1, minor: 7 });
    assert_eq!(socket.serial_number().await.unwrap(), 12345);

    let status = socket.status().await.unwrap();
    assert!(status.has_meter);
    assert!(!status.active);
    assert!(!status.has_error);

    socket.set_active(true).await.unwrap();
    assert!(socket.is_active().await.unwrap());
    socket.set_active(false).await.unwrap();
    assert!(!socket.is_active().await.unwrap());
}

#[tokio::test]
async fn test_zif_transfers_are_logged() {
    let port = mock::zif8121();
    let connection = Arc::new(
        SerialPortConnection::from_transport(
            "zif",
            Box::new(port),
            SerialPortOptions::unit_test(Duration::from_millis(200)),
        )
        .unwrap(),
    );
    let logger = MemoryInterfaceLogger::new();
    let source = LogSource::new(LogSourceKind::Zif, "mock://zif8121").with_id("3");
    let socket = PowerMaster8121::new(connection.create_executor(source, Arc::new(logger.clone())));

    socket.version().await.unwrap();

    let entries = logger.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].scope.request_id, entries[1].scope.request_id);
    assert!(entries[0].scope.outgoing);
    assert_eq!(entries[0].payload.payload, "A5-02-C2-E7-5A");
    assert_eq!(entries[1].payload.encoding, PayloadEncoding::Raw);
    assert!(entries[1].payload.payload.starts_with("A5-08-06-C2"));
    assert_eq!(entries[1].scope.source.id.as_deref(), Some("3"));
}

#[tokio::test]
async fn test_zif_short_payload_is_bad_length() {
    let port = ScriptedPort::new("zif").respond_bytes_with(|_| {
        encode_command(&[ACK, 0xC2, 0x01, 0x00, 0x00]).unwrap_or_default()
    });
    let (executor, _) = executor(port, LogSourceKind::Zif);

    let error = PowerMaster8121::new(executor).version().await.unwrap_err();
    assert_eq!(
        error,
        DriverError::Serial(SerialError::Protocol(ProtocolError::BadLength {
            expected: 5,
            actual: 3
        }))
    );
}

#[tokio::test]
async fn test_zif_nak_is_protocol_error() {
    let port = ScriptedPort::new("zif")
        .respond_bytes_with(|_| encode_command(&[0x15, 0xC1, 0x02]).unwrap_or_default());
    let (executor, _) = executor(port, LogSourceKind::Zif);

    let error = PowerMaster8121::new(executor).serial_number().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn test_zif_cancellation_stops_waiting_for_reply() {
    let serial_only = encode_command(&[0xC1]).unwrap();
    let port = ScriptedPort::new("zif").respond_bytes_with(move |bytes| {
        if bytes == serial_only.as_slice() {
            encode_command(&[ACK, 0xC1, 0x30, 0x39]).unwrap_or_default()
        } else {
            Vec::new()
        }
    });
    let (executor, handle) = executor(port, LogSourceKind::Zif);
    let token = CancellationToken::new();
    let socket = PowerMaster8121::new(executor.clone())
        .with_timeout(Duration::from_secs(10))
        .with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let started = Instant::now();
    let error = socket.version().await.unwrap_err();
    canceller.await.unwrap();

    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handle.written_bytes().len(), 1);

    // the token stays cancelled, so later commands never reach the wire
    assert_eq!(socket.serial_number().await.unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(handle.written_bytes().len(), 1);

    assert_eq!(PowerMaster8121::new(executor).serial_number().await.unwrap(), 12345);
}

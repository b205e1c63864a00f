//! Watch Pipeline Integration Tests
//!
//! Runs `HexDumpClass` inside a `DeviceSession` on the in-memory backend and
//! checks what reaches the report bridge.
//!
//! Run with: `cargo test -p probe --test watch_tests`

use common::{ReportEvent, create_report_bridge};
use device::test_utils::{DEFAULT_TEST_TIMEOUT, MockContext, mock_bulk_device, mock_hid_device, wait_until};
use device::{DeviceSession, RawDevice, SessionOptions, TransferStatus};
use probe::class::HexDumpClass;
use std::sync::Arc;
use std::time::Duration;

fn fast_options() -> SessionOptions {
    SessionOptions {
        event_timeout_ms: 5,
        drain_timeout_ms: 500,
        ..SessionOptions::default()
    }
}

fn watch_session(
    class: Arc<HexDumpClass>,
    device: Arc<dyn RawDevice>,
    context: &Arc<MockContext>,
) -> DeviceSession {
    let session = DeviceSession::new(class, fast_options());
    session.set_context(context.clone());
    session.set_device(device, None).unwrap();
    session.open_handle().unwrap();
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();
    session
}

#[tokio::test]
async fn test_reports_reach_the_bridge() {
    let context = MockContext::new();
    let device = mock_hid_device(&context);
    let (sender, receiver) = create_report_bridge(16);
    let class = Arc::new(HexDumpClass::new(Vec::new(), sender));
    let session = watch_session(class.clone(), device.clone(), &context);

    assert!(device.io().complete(0x81, TransferStatus::Completed, &[1, 2, 3]));
    let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ReportEvent::Report {
            endpoint: 0x81,
            data: vec![1, 2, 3]
        }
    );

    // The interrupt transfer goes back out after each report
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.io().submissions() == 2));
    assert_eq!(class.reports(), 1);

    session.shutdown().unwrap();
    assert_eq!(session.active_transfers(), 0);
}

#[tokio::test]
async fn test_stall_reports_error_and_retires() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let (sender, receiver) = create_report_bridge(16);
    let session = watch_session(
        Arc::new(HexDumpClass::new(Vec::new(), sender)),
        device.clone(),
        &context,
    );

    device.io().complete(0x81, TransferStatus::Stall, &[]);
    let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ReportEvent::TransferError {
            endpoint: 0x81,
            status: "Stall".to_string()
        }
    );
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.active_transfers() == 0));
    assert_eq!(device.io().submissions(), 1);
}

#[tokio::test]
async fn test_disconnect_stops_watching() {
    let context = MockContext::new();
    let device = mock_hid_device(&context);
    let (sender, receiver) = create_report_bridge(16);
    let session = watch_session(
        Arc::new(HexDumpClass::new(Vec::new(), sender)),
        device.clone(),
        &context,
    );

    device.io().disconnect();
    let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ReportEvent::Stopped { .. }));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.active_transfers() == 0));
}

#[test]
fn test_closed_receiver_retires_transfers() {
    let context = MockContext::new();
    let device = mock_hid_device(&context);
    let (sender, receiver) = create_report_bridge(16);
    let session = watch_session(
        Arc::new(HexDumpClass::new(Vec::new(), sender)),
        device.clone(),
        &context,
    );

    receiver.close();
    device.io().complete(0x81, TransferStatus::Completed, &[9]);

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.active_transfers() == 0));
    assert_eq!(device.io().submissions(), 1);
}

#[test]
fn test_interface_selection() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let (sender, _receiver) = create_report_bridge(16);
    let session = DeviceSession::new(
        Arc::new(HexDumpClass::new(vec![3], sender)),
        fast_options(),
    );
    session.set_context(context.clone());
    session.set_device(device.clone(), None).unwrap();
    session.open_handle().unwrap();
    session.claim_interfaces().unwrap();

    assert!(session.claimed_interfaces().is_empty());
    assert_eq!(session.active_transfers(), 0);

    let mut out = Vec::new();
    session.dump_info(&mut out).unwrap();
    assert!(String::from_utf8(out).unwrap().contains("Watch: no"));
}

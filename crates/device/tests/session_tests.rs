//! Device Session Integration Tests
//!
//! Drives `DeviceSession` against the in-memory backend from
//! `device::test_utils`.
//!
//! # Test Scenarios
//! - Binding, opening and string resolution
//! - Interface claiming and default transfer creation
//! - Completion dispatch, resubmission and retirement
//! - Event pump lifecycle
//! - Shutdown ordering, idempotence and re-entrancy
//! - Descriptor dump
//!
//! Run with: `cargo test -p device --test session_tests`

use device::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockContext, MockDevice, bulk_in, bulk_out, interrupt_in,
    mock_bulk_device, mock_hid_device, wait_until,
};
use device::{
    Completion, DeviceClass, DeviceSession, DispatchOutcome, EndpointAddress, InterfaceDescriptor,
    SessionError, SessionOptions, Speed, Transfer, TransferState, TransferStatus, WeakSession,
};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Test class
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Event {
    endpoint: u8,
    status: Option<TransferStatus>,
    data: Vec<u8>,
}

struct RecordingClass {
    requeue: AtomicBool,
    /// Only claim interfaces of this class, if set
    wanted_class: Option<u8>,
    shutdown_in_handler: bool,
    /// Sleep before shutting down from the handler
    handler_delay: Duration,
    /// Outcome of each shutdown the handler made
    handler_shutdowns: Mutex<Vec<bool>>,
    session: OnceLock<WeakSession>,
    events: Mutex<Vec<Event>>,
    parsed: Mutex<Vec<u8>>,
}

impl RecordingClass {
    fn with(requeue: bool, wanted_class: Option<u8>, shutdown_in_handler: bool) -> Arc<Self> {
        Arc::new(Self {
            requeue: AtomicBool::new(requeue),
            wanted_class,
            shutdown_in_handler,
            handler_delay: Duration::ZERO,
            handler_shutdowns: Mutex::new(Vec::new()),
            session: OnceLock::new(),
            events: Mutex::new(Vec::new()),
            parsed: Mutex::new(Vec::new()),
        })
    }

    fn new(requeue: bool) -> Arc<Self> {
        Self::with(requeue, None, false)
    }

    fn wanting(class_code: u8) -> Arc<Self> {
        Self::with(false, Some(class_code), false)
    }

    fn shutting_down_in_handler() -> Arc<Self> {
        Self::with(true, None, true)
    }

    fn shutting_down_in_handler_after(delay: Duration) -> Arc<Self> {
        let mut class = Arc::into_inner(Self::with(true, None, true)).unwrap();
        class.handler_delay = delay;
        Arc::new(class)
    }

    fn handler_shutdowns(&self) -> Vec<bool> {
        self.handler_shutdowns.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl DeviceClass for RecordingClass {
    fn handle_event(&self, endpoint: EndpointAddress, data: &[u8], transfer: &Transfer) -> bool {
        self.events.lock().unwrap().push(Event {
            endpoint: endpoint.raw(),
            status: transfer.status(),
            data: data.to_vec(),
        });

        if self.shutdown_in_handler {
            if let Some(session) = self.session.get() {
                thread::sleep(self.handler_delay);
                let ok = session.shutdown().is_ok();
                self.handler_shutdowns.lock().unwrap().push(ok);
            }
        }
        self.requeue.load(Ordering::SeqCst)
    }

    fn want_interface(&self, iface: &InterfaceDescriptor) -> bool {
        self.wanted_class.is_none_or(|c| c == iface.class_code)
    }

    fn parse_interface(&self, number: u8, _iface: &InterfaceDescriptor) {
        self.parsed.lock().unwrap().push(number);
    }

    fn dump_extra_interface_info(
        &self,
        out: &mut dyn Write,
        iface: &InterfaceDescriptor,
    ) -> std::io::Result<()> {
        writeln!(out, "        recording class on interface {}", iface.interface_number)
    }
}

fn fast_options() -> SessionOptions {
    SessionOptions {
        event_timeout_ms: 5,
        drain_timeout_ms: 500,
        ..SessionOptions::default()
    }
}

fn open_session(
    class: Arc<RecordingClass>,
    device: Arc<MockDevice>,
    context: &Arc<MockContext>,
) -> DeviceSession {
    let session =
        DeviceSession::with_device(class, fast_options(), context.clone(), device).unwrap();
    session.open_handle().unwrap();
    session
}

// ============================================================================
// Binding and identity
// ============================================================================

#[test]
fn test_open_resolves_identity() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    assert!(session.is_valid());
    assert!(session.is_open());
    assert_eq!(session.language_id(), 0x0409);
    assert_eq!(session.manufacturer(), "Test Manufacturer");
    assert_eq!(session.product_name(), "Bulk Widget");
    assert_eq!(session.serial_number(), "SN000002");
    assert_eq!(session.speed(), Speed::High);
    assert!(session.matches(0x1234, 0x5678));
    assert!(session.matches_vendor(0x1234));
    assert!(!session.matches(0x1234, 0x0001));
}

#[test]
fn test_open_is_idempotent() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let session = open_session(RecordingClass::new(false), device.clone(), &context);

    session.open_handle().unwrap();
    assert_eq!(device.io().opens(), 1);
}

#[test]
fn test_no_string_table_gives_empty_strings() {
    let context = MockContext::new();
    let device = MockDevice::builder(0x1234, 0x0001)
        .languages(Vec::new())
        .build(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    session.set_language_id(0);
    assert_eq!(session.language_id(), 0);
    assert_eq!(session.manufacturer(), "");
    assert_eq!(session.product_name(), "");
    assert_eq!(session.serial_number(), "");
}

#[test]
fn test_ascii_fallback_masks_non_ascii() {
    let context = MockContext::new();
    let device = MockDevice::builder(0x1234, 0x0002)
        .languages(Vec::new())
        .product("Wïdget")
        .build(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    assert_eq!(session.language_id(), 0);
    assert_eq!(session.product_name(), "W?dget");
}

#[test]
fn test_explicit_language_is_kept() {
    let context = MockContext::new();
    let device = mock_hid_device(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    session.set_language_id(0x0407);
    assert_eq!(session.language_id(), 0x0407);
    assert_eq!(session.product_name(), "Test Mouse");
    assert_eq!(session.pull_string(3), "SN000001");
}

#[test]
fn test_unreadable_descriptor_keeps_device_bound() {
    let context = MockContext::new();
    let device = MockDevice::builder(1, 2).unreadable_descriptor().build(&context);
    let session = DeviceSession::new(RecordingClass::new(false), fast_options());
    session.set_context(context.clone());

    let err = session.set_device(device, None).unwrap_err();
    assert!(matches!(err, SessionError::DescriptorRead(_)));
    assert!(session.is_valid());
    assert!(session.descriptor().is_none());
}

#[test]
fn test_open_without_device() {
    let session = DeviceSession::new(RecordingClass::new(false), fast_options());
    assert!(!session.is_valid());
    assert!(matches!(
        session.open_handle(),
        Err(SessionError::InvalidArgument(_))
    ));
    assert!(matches!(
        session.claim_interfaces(),
        Err(SessionError::InvalidArgument(_))
    ));
}

#[test]
fn test_open_failure_surfaces_usb_error() {
    let context = MockContext::new();
    let device = mock_hid_device(&context);
    device.io().fail_open(true);
    let session = DeviceSession::with_device(
        RecordingClass::new(false),
        fast_options(),
        context.clone(),
        device,
    )
    .unwrap();

    assert!(matches!(
        session.open_handle(),
        Err(SessionError::Usb(rusb::Error::Access))
    ));
    assert!(!session.is_open());
}

// ============================================================================
// Claiming
// ============================================================================

#[test]
fn test_claim_starts_default_transfers() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(false);
    let session = open_session(class.clone(), device.clone(), &context);

    session.claim_interfaces().unwrap();

    assert_eq!(session.claimed_interfaces(), vec![0]);
    assert_eq!(*class.parsed.lock().unwrap(), vec![0]);
    // bulk OUT endpoint gets no default transfer
    assert_eq!(session.active_transfers(), 1);
    assert_eq!(device.io().in_flight_on(0x81), 1);
    assert_eq!(device.io().claimed(), vec![0]);
}

#[test]
fn test_claim_is_idempotent() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let session = open_session(RecordingClass::new(false), device.clone(), &context);

    session.claim_interfaces().unwrap();
    session.claim_interfaces().unwrap();

    assert_eq!(session.claimed_interfaces(), vec![0]);
    assert_eq!(session.active_transfers(), 1);
    assert_eq!(device.io().submissions(), 1);
}

#[test]
fn test_claim_requires_open_handle() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let session = DeviceSession::with_device(
        RecordingClass::new(false),
        fast_options(),
        context.clone(),
        device,
    )
    .unwrap();

    assert!(matches!(
        session.claim_interfaces(),
        Err(SessionError::NotOpen)
    ));
}

#[test]
fn test_claim_failure_reports_interface() {
    let context = MockContext::new();
    let device = MockDevice::builder(0x1234, 0x5678)
        .interface(0, 0xFF, vec![bulk_in(0x81, 64)])
        .interface(1, 0xFF, vec![bulk_in(0x82, 64)])
        .fail_claim(1)
        .build(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    match session.claim_interfaces() {
        Err(SessionError::Claim { interface, source }) => {
            assert_eq!(interface, 1);
            assert_eq!(source, rusb::Error::Busy);
        }
        other => panic!("expected claim error, got {:?}", other),
    }
    // earlier claims stay in place
    assert_eq!(session.claimed_interfaces(), vec![0]);
    assert_eq!(session.active_transfers(), 1);
}

#[test]
fn test_unwanted_interfaces_are_skipped() {
    let context = MockContext::new();
    let device = MockDevice::builder(0x1234, 0x5678)
        .interface(0, 0xFF, vec![bulk_in(0x81, 64)])
        .interface(1, 0x03, vec![interrupt_in(0x82, 8, 10)])
        .build(&context);
    let session = open_session(RecordingClass::wanting(0x03), device.clone(), &context);

    session.claim_interfaces().unwrap();
    assert_eq!(session.claimed_interfaces(), vec![1]);
    assert_eq!(device.io().in_flight_on(0x81), 0);
    assert_eq!(device.io().in_flight_on(0x82), 1);
}

#[test]
fn test_submission_failure_during_claim() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    device.io().fail_submissions(true);
    let session = open_session(RecordingClass::new(false), device, &context);

    assert!(matches!(
        session.claim_interfaces(),
        Err(SessionError::TransferSubmission { endpoint: 0x81, .. })
    ));
    assert_eq!(session.claimed_interfaces(), vec![0]);
    assert_eq!(session.active_transfers(), 0);
}

// ============================================================================
// Completion dispatch
// ============================================================================

#[test]
fn test_requeue_resubmits_once() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(true);
    let session = open_session(class.clone(), device.clone(), &context);
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    let transfer = session.transfers().pop().unwrap();
    assert!(device.io().complete(0x81, TransferStatus::Completed, &[1, 2, 3]));

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.io().submissions() == 2));
    assert_eq!(
        class.events(),
        vec![Event {
            endpoint: 0x81,
            status: Some(TransferStatus::Completed),
            data: vec![1, 2, 3],
        }]
    );
    assert_eq!(session.active_transfers(), 1);
    assert_eq!(transfer.submissions(), 2);
    assert_eq!(transfer.completions(), 1);
    assert_eq!(transfer.state(), TransferState::Submitted);
}

#[test]
fn test_handler_false_retires_transfer() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(false);
    let session = open_session(class.clone(), device.clone(), &context);
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    let transfer = session.transfers().pop().unwrap();
    device.io().complete(0x81, TransferStatus::Completed, &[7]);

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.active_transfers() == 0));
    assert_eq!(transfer.state(), TransferState::Retired);
    assert_eq!(device.io().submissions(), 1);
    assert_eq!(class.events().len(), 1);
}

#[test]
fn test_completion_delivered_exactly_once() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(false);
    let session = open_session(class.clone(), device.clone(), &context);
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    let transfer = session.transfers().pop().unwrap();
    device.io().complete(0x81, TransferStatus::Completed, &[1]);
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.active_transfers() == 0));

    // A late duplicate for a retired transfer is dropped
    let outcome = session
        .dispatch_event(&transfer, Completion::new(TransferStatus::Completed, vec![2]))
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Ignored);
    assert!(!device.io().complete(0x81, TransferStatus::Completed, &[3]));

    thread::sleep(Duration::from_millis(20));
    assert_eq!(class.events().len(), 1);
}

#[test]
fn test_dispatch_event_refuses_in_flight_transfer() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(true);
    let session = open_session(class.clone(), device.clone(), &context);
    session.claim_interfaces().unwrap();

    let transfer = session.transfers().pop().unwrap();
    assert_eq!(transfer.state(), TransferState::Submitted);

    let result =
        session.dispatch_event(&transfer, Completion::new(TransferStatus::Completed, vec![1]));
    assert!(matches!(result, Err(SessionError::InvalidArgument(_))));

    // Nothing reached the class and the transfer was not queued again
    assert!(class.events().is_empty());
    assert_eq!(device.io().submissions(), 1);
    assert_eq!(device.io().in_flight_on(0x81), 1);
    assert_eq!(transfer.state(), TransferState::Submitted);
}

#[test]
fn test_error_status_reaches_handler() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(false);
    let session = open_session(class.clone(), device.clone(), &context);
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    device.io().complete(0x81, TransferStatus::Stall, &[]);
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || class.events().len() == 1));
    assert_eq!(class.events()[0].status, Some(TransferStatus::Stall));
}

#[test]
fn test_resubmission_failure_retires() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(true);
    let session = open_session(class.clone(), device.clone(), &context);
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    device.io().fail_submissions(true);
    device.io().complete(0x81, TransferStatus::Completed, &[1]);

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.active_transfers() == 0));
    assert_eq!(class.events().len(), 1);
}

#[test]
fn test_manual_transfer_submission() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(false);
    let session = open_session(class.clone(), device.clone(), &context);
    session.start_event_handling().unwrap();

    let setup = device::TransferSetup::output(
        EndpointAddress::output(2),
        device::TransferKind::Bulk,
        vec![0xAA; 4],
    );
    let transfer = session.submit_transfer(setup).unwrap();
    assert_eq!(device.io().in_flight_on(0x02), 1);

    session.cancel_transfer(&transfer).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || session.active_transfers() == 0));
    assert_eq!(transfer.state(), TransferState::Retired);
    // Cancelled completions never reach the class
    assert!(class.events().is_empty());
}

// ============================================================================
// Event pump
// ============================================================================

#[test]
fn test_start_requires_context() {
    let session = DeviceSession::new(RecordingClass::new(false), fast_options());
    assert!(matches!(
        session.start_event_handling(),
        Err(SessionError::InvalidArgument(_))
    ));
}

#[test]
fn test_start_is_idempotent() {
    let context = MockContext::new();
    let device = mock_hid_device(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    session.start_event_handling().unwrap();
    session.start_event_handling().unwrap();
    assert!(session.is_event_handling());

    session.stop_event_handling();
    assert!(!session.is_event_handling());
    session.stop_event_handling();

    session.start_event_handling().unwrap();
    assert!(session.is_event_handling());
}

#[test]
fn test_no_callback_after_stop() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(true);
    let session = open_session(class.clone(), device.clone(), &context);
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    session.stop_event_handling();
    device.io().complete(0x81, TransferStatus::Completed, &[1]);

    thread::sleep(Duration::from_millis(30));
    assert_eq!(context.queued(), 1);
    assert!(class.events().is_empty());

    // Shutdown drives the leftover completion inline and retires it
    session.shutdown().unwrap();
    assert!(class.events().is_empty());
    assert_eq!(session.active_transfers(), 0);
}

#[test]
fn test_stop_while_handler_shuts_down() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::shutting_down_in_handler_after(Duration::from_millis(100));
    let session = open_session(class.clone(), device.clone(), &context);
    class.session.set(session.downgrade()).ok();
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    device.io().complete(0x81, TransferStatus::Completed, &[4]);
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || class.events().len() == 1));

    // The handler is still sleeping; stop joins the pump while it shuts down
    let started = Instant::now();
    session.stop_event_handling();
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(400),
        "stop waited on a drain: {:?}",
        elapsed
    );
    assert_eq!(class.handler_shutdowns(), vec![true]);
    assert!(!session.is_event_handling());
    assert!(!session.is_open());
    assert_eq!(session.active_transfers(), 0);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_releases_everything() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let session = open_session(RecordingClass::new(true), device.clone(), &context);
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    session.shutdown().unwrap();

    assert_eq!(session.active_transfers(), 0);
    assert!(session.claimed_interfaces().is_empty());
    assert!(device.io().claimed().is_empty());
    assert!(!session.is_open());
    assert!(!session.is_event_handling());
    assert_eq!(device.io().cancels(), 1);
    assert_eq!(device.io().in_flight(), 0);

    // second call is a no-op
    session.shutdown().unwrap();
    assert_eq!(device.io().cancels(), 1);
}

#[test]
fn test_shutdown_without_pump_drains_inline() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let session = open_session(RecordingClass::new(true), device.clone(), &context);
    session.claim_interfaces().unwrap();
    let transfer = session.transfers().pop().unwrap();

    session.shutdown().unwrap();

    assert_eq!(transfer.state(), TransferState::Retired);
    assert_eq!(session.active_transfers(), 0);
    assert_eq!(context.queued(), 0);
}

#[test]
fn test_shutdown_reports_drain_timeout() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let session = DeviceSession::with_device(
        RecordingClass::new(true),
        SessionOptions {
            event_timeout_ms: 5,
            drain_timeout_ms: 50,
            ..SessionOptions::default()
        },
        context.clone(),
        device.clone(),
    )
    .unwrap();
    session.open_handle().unwrap();
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();
    device.io().swallow_cancels(true);

    match session.shutdown() {
        Err(SessionError::Shutdown(errors)) => {
            assert!(
                errors
                    .iter()
                    .any(|e| matches!(e, SessionError::DrainTimeout { remaining: 1 }))
            );
        }
        other => panic!("expected shutdown error, got {:?}", other),
    }
    // remaining steps still ran
    assert_eq!(session.active_transfers(), 0);
    assert!(device.io().claimed().is_empty());
    assert!(!session.is_open());
}

#[test]
fn test_shutdown_from_handler() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::shutting_down_in_handler();
    let session = open_session(class.clone(), device.clone(), &context);
    class.session.set(session.downgrade()).ok();
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();

    device.io().complete(0x81, TransferStatus::Completed, &[9]);

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !session.is_open()));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !session.is_event_handling()));
    assert_eq!(session.active_transfers(), 0);
    assert!(device.io().claimed().is_empty());
    assert_eq!(class.events().len(), 1);
    // the handler asked to requeue, but shutdown won
    assert_eq!(device.io().submissions(), 1);
    assert_eq!(class.handler_shutdowns(), vec![true]);

    session.shutdown().unwrap();
}

#[test]
fn test_concurrent_shutdown_waits_for_running_one() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let session = open_session(RecordingClass::new(true), device.clone(), &context);
    session.claim_interfaces().unwrap();
    session.start_event_handling().unwrap();
    // Keeps the first shutdown in its drain until the timeout
    device.io().swallow_cancels(true);

    let started = Instant::now();
    thread::scope(|scope| {
        let first = scope.spawn(|| session.shutdown());
        thread::sleep(Duration::from_millis(50));

        let second = session.shutdown();
        let waited = started.elapsed();

        assert!(second.is_ok());
        assert!(
            waited >= Duration::from_millis(450),
            "second shutdown returned before the first finished: {:?}",
            waited
        );
        // The running teardown was complete by the time the second returned
        assert!(!session.is_open());
        assert!(!session.is_event_handling());
        assert!(session.claimed_interfaces().is_empty());
        assert!(device.io().claimed().is_empty());

        assert!(matches!(
            first.join().unwrap(),
            Err(SessionError::Shutdown(_))
        ));
    });
}

#[test]
fn test_drop_shuts_down() {
    let context = MockContext::new();
    let device = mock_bulk_device(&context);
    let class = RecordingClass::new(true);
    {
        let session = open_session(class.clone(), device.clone(), &context);
        session.claim_interfaces().unwrap();
        session.start_event_handling().unwrap();
    }
    assert!(device.io().claimed().is_empty());
    assert_eq!(device.io().in_flight(), 0);
}

#[test]
fn test_weak_session_after_drop() {
    let context = MockContext::new();
    let device = mock_hid_device(&context);
    let session = open_session(RecordingClass::new(false), device, &context);
    let weak = session.downgrade();
    assert!(weak.is_alive());

    drop(session);
    assert!(!weak.is_alive());
    assert_eq!(weak.active_transfers(), 0);
    weak.shutdown().unwrap();
}

#[test]
fn test_set_device_rebinds() {
    let context = MockContext::new();
    let first = mock_bulk_device(&context);
    let second = mock_hid_device(&context);
    let session = open_session(RecordingClass::new(true), first.clone(), &context);
    session.claim_interfaces().unwrap();

    session.set_device(second, None).unwrap();

    assert!(first.io().claimed().is_empty());
    assert!(!session.is_open());
    assert!(session.claimed_interfaces().is_empty());
    assert!(session.matches(0x046d, 0xc077));
    assert_eq!(session.product_name(), "");

    session.open_handle().unwrap();
    assert_eq!(session.product_name(), "Test Mouse");
}

#[test]
fn test_clear_device() {
    let context = MockContext::new();
    let device = mock_hid_device(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    session.clear_device().unwrap();
    assert!(!session.is_valid());
    assert!(!session.is_open());
    assert!(session.descriptor().is_none());
}

// ============================================================================
// Extended descriptors and dump
// ============================================================================

const BOS: [u8; 12] = [
    0x05, 0x0F, 12, 0x00, 0x01, // header, one capability
    0x07, 0x10, 0x02, 0x02, 0x00, 0x00, 0x00, // USB 2.0 extension with LPM
];

const RAW_CONFIG: [u8; 31] = [
    0x09, 0x02, 31, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32, // configuration
    0x09, 0x04, 0x00, 0x00, 0x01, 0xFF, 0x00, 0x00, 0x00, // interface 0
    0x07, 0x05, 0x81, 0x02, 0x00, 0x04, 0x00, // bulk IN 0x81
    0x06, 0x30, 0x0F, 0x00, 0x00, 0x00, // SuperSpeed companion
];

#[test]
fn test_extended_descriptors_loaded_on_open() {
    let context = MockContext::new();
    let device = MockDevice::builder(0x1234, 0x5678)
        .usb_version(0x0300)
        .speed(Speed::Super)
        .interface(0, 0xFF, vec![bulk_in(0x81, 1024)])
        .bos(BOS.to_vec())
        .raw_config(RAW_CONFIG.to_vec())
        .build(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    let catalog = session.catalog().unwrap();
    assert!(catalog.bos().is_some());
    assert!(catalog.usb2_extension().unwrap().lpm_supported());
    assert_eq!(
        catalog.ss_companion(EndpointAddress::input(1)).unwrap().max_burst,
        15
    );
}

#[test]
fn test_bos_skipped_before_usb_2_01() {
    let context = MockContext::new();
    let device = MockDevice::builder(0x1234, 0x5678)
        .bos(BOS.to_vec())
        .build(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    assert!(session.catalog().unwrap().bos().is_none());
}

#[test]
fn test_companions_follow_device_config_index() {
    let context = MockContext::new();
    // Configuration 0 is unreadable, so the catalog holds only index 1
    let device = MockDevice::builder(0x1234, 0x5678)
        .usb_version(0x0300)
        .speed(Speed::Super)
        .interface(0, 0xFF, vec![bulk_in(0x81, 1024)])
        .config_index(1)
        .raw_config(RAW_CONFIG.to_vec())
        .build(&context);
    let session = open_session(RecordingClass::new(false), device, &context);

    let catalog = session.catalog().unwrap();
    assert_eq!(catalog.configs().len(), 1);
    assert_eq!(
        catalog.ss_companion(EndpointAddress::input(1)).unwrap().max_burst,
        15
    );
}

#[test]
fn test_dump_info_lists_claims_and_strings() {
    let context = MockContext::new();
    let device = MockDevice::builder(0x1234, 0x5678)
        .manufacturer("Test Manufacturer")
        .product("Bulk Widget")
        .interface(0, 0xFF, vec![bulk_in(0x81, 512), bulk_out(0x02, 512)])
        .interface(1, 0xFF, vec![])
        .build(&context);
    let session = open_session(RecordingClass::wanting(0xFF), device, &context);
    session.claim_interfaces().unwrap();

    let mut out = Vec::new();
    session.dump_info(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.contains("1234:5678"));
    assert!(text.contains("Test Manufacturer"));
    assert!(text.contains("Bulk Widget"));
    assert!(text.contains("Interface 0 [claimed]"));
    assert!(text.contains("Interface 1 [claimed]"));
    assert!(text.contains("Endpoint 0x81 (IN 1)"));
    assert!(text.contains("recording class on interface 0"));
    assert!(text.contains("Claimed interfaces: 0, 1"));
    assert!(text.contains("Active transfers: 1"));
}

//! Device session
//!
//! A [`DeviceSession`] binds one enumerated device, its descriptor catalog,
//! the open handle, the claimed interfaces and the active transfers. Device
//! specific behaviour comes from a [`DeviceClass`] strategy held by the
//! session.
//!
//! Locking: all mutable session state sits behind one mutex. Completion
//! dispatch takes it on the pump thread before touching the active set and
//! releases it while the class handler runs, so a handler may call back into
//! the session (including `shutdown`) through a [`WeakSession`]. The pump slot
//! has its own mutex and is never locked while the state mutex is held.

use crate::backend::{Completion, CompletionFn, EventSource, RawDevice, RawHandle};
use crate::descriptors::{
    self, DescriptorCatalog, DeviceDescriptor, DeviceIdentity, EndpointAddress,
    EndpointDescriptor, InterfaceDescriptor, Speed,
};
use crate::dump::{self, InfoSnapshot};
use crate::error::{Result, SessionError};
use crate::options::SessionOptions;
use crate::transfers::{CompletionAction, Transfer, TransferEngine, TransferSetup, TransferState};
use crate::worker::EventPump;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Device-class policy plugged into a session
///
/// Only `handle_event` and `want_interface` are required. Apart from
/// `handle_event`, hooks run on the caller's thread without the session lock
/// held but should not re-enter the session.
pub trait DeviceClass: Send + Sync {
    /// Handle a completed transfer; return `true` to resubmit it
    ///
    /// Runs on the event pump thread. `data.len()` is the actual length and
    /// `transfer.status()` the completion status.
    fn handle_event(&self, endpoint: EndpointAddress, data: &[u8], transfer: &Transfer) -> bool;

    /// Whether `claim_interfaces` should claim this interface
    fn want_interface(&self, iface: &InterfaceDescriptor) -> bool;

    /// Transfer to create for an endpoint of a claimed interface, if any
    fn create_transfer(&self, endpoint: &EndpointDescriptor) -> Option<TransferSetup> {
        TransferSetup::for_endpoint(endpoint)
    }

    /// Called once per newly claimed interface
    fn parse_interface(&self, number: u8, iface: &InterfaceDescriptor) {
        trace!(
            "Interface {} (class {:#04x}) has no class-specific parsing",
            number, iface.class_code
        );
    }

    /// Extra lines for `dump_info`, written after the interface's endpoints
    fn dump_extra_interface_info(
        &self,
        _out: &mut dyn io::Write,
        _iface: &InterfaceDescriptor,
    ) -> io::Result<()> {
        Ok(())
    }
}

/// Result of dispatching one completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler asked for another round and the transfer is in flight again
    Resubmitted,
    /// Transfer left the active set
    Retired,
    /// Completion for a transfer that was already retired
    Ignored,
}

struct SessionState {
    context: Option<Arc<dyn EventSource>>,
    device: Option<Arc<dyn RawDevice>>,
    handle: Option<Arc<dyn RawHandle>>,
    catalog: Option<DescriptorCatalog>,
    identity: DeviceIdentity,
    claimed: Vec<u8>,
    engine: TransferEngine,
    shutting_down: bool,
    /// Thread running the current teardown
    teardown_thread: Option<ThreadId>,
    /// Pump thread, kept until it is joined
    pump_thread: Option<ThreadId>,
}

struct Shared {
    class: Arc<dyn DeviceClass>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    drained: Condvar,
    /// Signalled when a teardown finishes
    idle: Condvar,
    pump: Mutex<Option<EventPump>>,
}

/// Per-device session
///
/// Dropping the session shuts it down.
pub struct DeviceSession {
    shared: Arc<Shared>,
}

/// Non-owning reference to a session, safe to keep inside a device class
#[derive(Clone)]
pub struct WeakSession {
    shared: Weak<Shared>,
}

impl DeviceSession {
    /// Create an unbound session
    pub fn new(class: Arc<dyn DeviceClass>, options: SessionOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                class,
                options,
                state: Mutex::new(SessionState {
                    context: None,
                    device: None,
                    handle: None,
                    catalog: None,
                    identity: DeviceIdentity::default(),
                    claimed: Vec::new(),
                    engine: TransferEngine::new(),
                    shutting_down: false,
                    teardown_thread: None,
                    pump_thread: None,
                }),
                drained: Condvar::new(),
                idle: Condvar::new(),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Create a session bound to `device` and its event context
    pub fn with_device(
        class: Arc<dyn DeviceClass>,
        options: SessionOptions,
        context: Arc<dyn EventSource>,
        device: Arc<dyn RawDevice>,
    ) -> Result<Self> {
        let session = Self::new(class, options);
        session.set_context(context);
        session.set_device(device, None)?;
        Ok(session)
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    /// Bind the event source driven by the pump
    pub fn set_context(&self, context: Arc<dyn EventSource>) {
        self.shared.lock_state().context = Some(context);
    }

    /// Rebind to a new device, shutting down any open handle first
    ///
    /// `descriptor` skips re-reading the device descriptor when enumeration
    /// already produced it. If the descriptor cannot be read the device stays
    /// bound with an empty catalog and the error is returned.
    pub fn set_device(
        &self,
        device: Arc<dyn RawDevice>,
        descriptor: Option<DeviceDescriptor>,
    ) -> Result<()> {
        if let Err(e) = self.shared.teardown(false) {
            warn!("Teardown before rebinding device: {}", e);
        }

        let catalog = DescriptorCatalog::load(device.as_ref(), descriptor);

        let mut state = self.shared.lock_state();
        state.identity = DeviceIdentity {
            speed: device.speed(),
            ..DeviceIdentity::default()
        };
        state.device = Some(device);

        match catalog {
            Ok(catalog) => {
                state.identity.vendor_id = catalog.device().vendor_id;
                state.identity.product_id = catalog.device().product_id;
                debug!(
                    "Bound device {:04x}:{:04x}",
                    state.identity.vendor_id, state.identity.product_id
                );
                state.catalog = Some(catalog);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to read device descriptor: {}", e);
                state.catalog = None;
                Err(SessionError::DescriptorRead(e))
            }
        }
    }

    /// Shut down and forget the bound device
    pub fn clear_device(&self) -> Result<()> {
        let result = self.shutdown();
        let mut state = self.shared.lock_state();
        state.device = None;
        state.catalog = None;
        state.identity = DeviceIdentity::default();
        result
    }

    pub fn device(&self) -> Option<Arc<dyn RawDevice>> {
        self.shared.lock_state().device.clone()
    }

    /// True when a device is bound (it need not be open)
    pub fn is_valid(&self) -> bool {
        self.shared.lock_state().device.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock_state().handle.is_some()
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.shared.lock_state().identity.clone()
    }

    pub fn manufacturer(&self) -> String {
        self.shared.lock_state().identity.manufacturer.clone()
    }

    pub fn product_name(&self) -> String {
        self.shared.lock_state().identity.product.clone()
    }

    pub fn serial_number(&self) -> String {
        self.shared.lock_state().identity.serial_number.clone()
    }

    pub fn language_id(&self) -> u16 {
        self.shared.lock_state().identity.language_id
    }

    pub fn speed(&self) -> Speed {
        self.shared.lock_state().identity.speed
    }

    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.shared
            .lock_state()
            .catalog
            .as_ref()
            .map(|c| c.device().clone())
    }

    /// Copy of the cached descriptor set
    pub fn catalog(&self) -> Option<DescriptorCatalog> {
        self.shared.lock_state().catalog.clone()
    }

    pub fn matches_vendor(&self, vendor_id: u16) -> bool {
        let state = self.shared.lock_state();
        state.device.is_some() && state.identity.vendor_id == vendor_id
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        let state = self.shared.lock_state();
        state.device.is_some()
            && state.identity.vendor_id == vendor_id
            && state.identity.product_id == product_id
    }

    /// Open the device handle and read the handle-only descriptors
    ///
    /// Also resolves the string table using the configured language.
    pub fn open_handle(&self) -> Result<()> {
        self.shared.open_handle()
    }

    /// Cancel transfers, release interfaces and close the handle
    ///
    /// The event pump keeps running.
    pub fn close_handle(&self) -> Result<()> {
        self.shared.teardown(false)
    }

    /// Claim every wanted interface of the active configuration and start
    /// the class's transfers on its endpoints
    ///
    /// Interfaces already claimed are skipped. A failing claim stops the
    /// sequence with [`SessionError::Claim`]; earlier claims stay in place.
    pub fn claim_interfaces(&self) -> Result<()> {
        self.shared.claim_interfaces()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.shared.lock_state().claimed.clone()
    }

    /// Create and submit a transfer outside the default input set
    pub fn submit_transfer(&self, setup: TransferSetup) -> Result<Arc<Transfer>> {
        let mut state = self.shared.lock_state();
        if state.shutting_down {
            return Err(SessionError::ShuttingDown);
        }
        if state.handle.is_none() {
            return Err(SessionError::NotOpen);
        }
        let transfer = state.engine.create_transfer(setup);
        self.shared.submit_locked(&mut state, &transfer)?;
        Ok(transfer)
    }

    /// Request cancellation; a transfer that already finished is left alone
    pub fn cancel_transfer(&self, transfer: &Transfer) -> Result<()> {
        let mut state = self.shared.lock_state();
        let handle = state.handle.clone();
        state
            .engine
            .cancel(handle.as_deref(), transfer.id())
            .map_err(SessionError::Usb)
    }

    pub fn active_transfers(&self) -> usize {
        self.shared.lock_state().engine.len()
    }

    pub fn transfers(&self) -> Vec<Arc<Transfer>> {
        self.shared.lock_state().engine.transfers()
    }

    /// Start the event pump; a no-op if it is already running
    pub fn start_event_handling(&self) -> Result<()> {
        self.shared.start_event_handling()
    }

    /// Stop and join the event pump; a no-op if it is not running
    pub fn stop_event_handling(&self) {
        self.shared.stop_event_handling();
    }

    pub fn is_event_handling(&self) -> bool {
        self.shared.pump_running()
    }

    /// Cancel and drain transfers, release interfaces, close the handle and
    /// stop the pump
    ///
    /// Every step runs even if an earlier one failed; failures are collected
    /// into [`SessionError::Shutdown`]. From inside a completion handler while
    /// a shutdown is running it returns `Ok(())` at once; any other thread
    /// waits for the running shutdown to finish and then makes its own pass.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.teardown(true)
    }

    /// Select the string-table language and refresh the identity strings
    ///
    /// `0` picks the first language the device reports. Read failures fall
    /// back to language 0 silently.
    pub fn set_language_id(&self, language_id: u16) {
        let timeout = self.shared.options.control_timeout();
        let mut state = self.shared.lock_state();
        resolve_language(&mut state, language_id, timeout);
    }

    /// Read string descriptor `index` in the negotiated language
    pub fn pull_string(&self, index: u8) -> String {
        let state = self.shared.lock_state();
        match state.handle.as_ref() {
            Some(handle) => descriptors::pull_string(
                handle.as_ref(),
                index,
                state.identity.language_id,
                self.shared.options.control_timeout(),
            ),
            None => String::new(),
        }
    }

    /// Route a completion for `transfer` through the class handler
    ///
    /// Backend completions take this path on their own. A transfer the backend
    /// still owns (submitted or cancel-requested) is refused with
    /// `InvalidArgument`, since resubmitting it would queue it twice.
    pub fn dispatch_event(
        &self,
        transfer: &Arc<Transfer>,
        completion: Completion,
    ) -> Result<DispatchOutcome> {
        self.shared.dispatch(transfer, completion, false)
    }

    /// Human-readable dump of identity, descriptors and claim state
    pub fn dump_info(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let snapshot = {
            let state = self.shared.lock_state();
            InfoSnapshot {
                location: state.device.as_ref().map(|d| (d.bus_number(), d.address())),
                identity: state.identity.clone(),
                catalog: state.catalog.clone(),
                claimed: state.claimed.clone(),
                active_transfers: state.engine.len(),
                open: state.handle.is_some(),
            }
        };
        dump::write_info(out, &snapshot, self.shared.class.as_ref())
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Shutdown on drop: {}", e);
        }
    }
}

impl WeakSession {
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    /// Shut the session down if it still exists
    pub fn shutdown(&self) -> Result<()> {
        match self.shared.upgrade() {
            Some(shared) => shared.teardown(true),
            None => Ok(()),
        }
    }

    pub fn stop_event_handling(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stop_event_handling();
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.shared
            .upgrade()
            .map(|shared| shared.lock_state().engine.len())
            .unwrap_or(0)
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<EventPump>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pump_running(&self) -> bool {
        self.lock_pump().as_ref().is_some_and(|p| p.is_running())
    }

    /// True on this session's pump thread, including while another thread
    /// is joining it
    fn on_pump_thread(&self) -> bool {
        self.lock_state().pump_thread == Some(thread::current().id())
    }

    fn open_handle(&self) -> Result<()> {
        let timeout = self.options.control_timeout();
        let mut state = self.lock_state();
        if state.shutting_down {
            return Err(SessionError::ShuttingDown);
        }
        if state.handle.is_some() {
            return Ok(());
        }

        let device = state
            .device
            .clone()
            .ok_or(SessionError::InvalidArgument("no device bound to session"))?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            SessionError::Usb(e)
        })?;

        if let Some(catalog) = state.catalog.as_mut() {
            catalog.load_extended(handle.as_ref(), timeout);
        }
        state.handle = Some(handle);
        info!(
            "Opened device {:04x}:{:04x} (bus {} addr {})",
            state.identity.vendor_id,
            state.identity.product_id,
            device.bus_number(),
            device.address()
        );

        resolve_language(&mut state, self.options.language_id, timeout);
        Ok(())
    }

    fn claim_interfaces(self: &Arc<Self>) -> Result<()> {
        let interfaces: Vec<InterfaceDescriptor> = {
            let state = self.lock_state();
            if state.device.is_none() {
                return Err(SessionError::InvalidArgument("no device bound to session"));
            }
            if state.handle.is_none() {
                return Err(SessionError::NotOpen);
            }
            match state.catalog.as_ref().and_then(|c| c.active_config()) {
                Some(config) => config
                    .interfaces
                    .iter()
                    .filter_map(|i| i.primary().cloned())
                    .collect(),
                None => {
                    warn!("No configuration descriptor available, nothing to claim");
                    return Ok(());
                }
            }
        };

        for iface in interfaces {
            let number = iface.interface_number;
            if self.lock_state().claimed.contains(&number) {
                trace!("Interface {} already claimed", number);
                continue;
            }
            if !self.class.want_interface(&iface) {
                debug!("Skipping unwanted interface {}", number);
                continue;
            }

            {
                let mut state = self.lock_state();
                if state.shutting_down {
                    return Err(SessionError::ShuttingDown);
                }
                if state.claimed.contains(&number) {
                    continue;
                }
                let handle = state.handle.clone().ok_or(SessionError::NotOpen)?;
                handle.claim_interface(number).map_err(|source| {
                    warn!("Failed to claim interface {}: {}", number, source);
                    SessionError::Claim {
                        interface: number,
                        source,
                    }
                })?;
                state.claimed.push(number);
                info!("Claimed interface {}", number);
            }

            self.class.parse_interface(number, &iface);

            for endpoint in &iface.endpoints {
                let Some(setup) = self.class.create_transfer(endpoint) else {
                    continue;
                };
                let mut state = self.lock_state();
                if state.shutting_down {
                    return Err(SessionError::ShuttingDown);
                }
                let transfer = state.engine.create_transfer(setup);
                self.submit_locked(&mut state, &transfer)?;
            }
        }

        Ok(())
    }

    /// Submit with a completion callback routed back to `dispatch`
    fn submit_locked(self: &Arc<Self>, state: &mut SessionState, transfer: &Arc<Transfer>) -> Result<()> {
        let Some(handle) = state.handle.clone() else {
            state.engine.retire(transfer.id());
            self.drained.notify_all();
            return Err(SessionError::NotOpen);
        };

        let weak = Arc::downgrade(self);
        let target = Arc::clone(transfer);
        let done: CompletionFn = Box::new(move |completion| {
            let Some(shared) = weak.upgrade() else {
                trace!("Completion for transfer {} after session drop", target.id());
                return;
            };
            if let Err(e) = shared.dispatch(&target, completion, true) {
                error!(
                    "Transfer {} on {} stopped: {}",
                    target.id(),
                    target.endpoint(),
                    e
                );
            }
        });

        let result = state.engine.submit(handle.as_ref(), transfer, done);
        if result.is_err() {
            self.drained.notify_all();
        }
        result
    }

    fn dispatch(
        self: &Arc<Self>,
        transfer: &Arc<Transfer>,
        completion: Completion,
        from_backend: bool,
    ) -> Result<DispatchOutcome> {
        let action = {
            let mut state = self.lock_state();
            if !from_backend
                && state.engine.contains(transfer.id())
                && matches!(
                    transfer.state(),
                    TransferState::Submitted | TransferState::CancelRequested
                )
            {
                return Err(SessionError::InvalidArgument("transfer is still in flight"));
            }
            let action = state.engine.begin_completion(transfer.id(), &completion);
            if matches!(action, CompletionAction::Retired(_)) {
                self.drained.notify_all();
            }
            action
        };

        let transfer = match action {
            CompletionAction::Stale => {
                trace!("Ignoring completion for retired transfer {}", transfer.id());
                return Ok(DispatchOutcome::Ignored);
            }
            CompletionAction::Retired(t) => {
                debug!("Transfer {} on {} cancelled", t.id(), t.endpoint());
                return Ok(DispatchOutcome::Retired);
            }
            CompletionAction::Deliver(t) => t,
        };

        if !completion.status.is_success() {
            debug!(
                "Transfer {} on {} completed with {:?}",
                transfer.id(),
                transfer.endpoint(),
                completion.status
            );
        }

        let requeue = self
            .class
            .handle_event(transfer.endpoint(), &completion.data, &transfer);

        let mut state = self.lock_state();
        if !state.engine.contains(transfer.id()) {
            // Retired by a shutdown while the handler ran
            return Ok(DispatchOutcome::Retired);
        }
        if !requeue || transfer.is_cancel_requested() || state.shutting_down {
            state.engine.retire(transfer.id());
            self.drained.notify_all();
            return Ok(DispatchOutcome::Retired);
        }

        self.submit_locked(&mut state, &transfer)?;
        Ok(DispatchOutcome::Resubmitted)
    }

    fn start_event_handling(&self) -> Result<()> {
        let stale = {
            let mut slot = self.lock_pump();
            if let Some(pump) = slot.as_ref() {
                if pump.is_running() {
                    return Ok(());
                }
                if pump.is_current_thread() {
                    return Err(SessionError::InvalidArgument(
                        "event pump cannot be restarted from its own thread",
                    ));
                }
            }
            slot.take()
        };
        // A pump stopped from its own thread still needs joining
        if let Some(mut old) = stale {
            old.stop();
        }

        let context = self
            .lock_state()
            .context
            .clone()
            .ok_or(SessionError::InvalidArgument("no event context bound to session"))?;

        let mut slot = self.lock_pump();
        if slot.as_ref().is_some_and(|p| p.is_running()) {
            return Ok(());
        }
        let pump = EventPump::start(context, self.options.event_timeout())?;
        self.lock_state().pump_thread = Some(pump.thread_id());
        *slot = Some(pump);
        info!("Event handling started");
        Ok(())
    }

    fn stop_event_handling(&self) {
        let mut slot = self.lock_pump();
        let Some(mut pump) = slot.take() else {
            return;
        };

        if pump.is_current_thread() {
            pump.request_stop();
            *slot = Some(pump);
            return;
        }

        drop(slot);
        pump.stop();

        let mut state = self.lock_state();
        if state.pump_thread == Some(pump.thread_id()) {
            state.pump_thread = None;
        }
        drop(state);
        info!("Event handling stopped");
    }

    /// Shared body of `close_handle` and `shutdown`
    fn teardown(&self, stop_pump: bool) -> Result<()> {
        let mut errors = Vec::new();

        {
            let me = thread::current().id();
            let mut state = self.lock_state();
            if state.shutting_down {
                if state.teardown_thread == Some(me) || state.pump_thread == Some(me) {
                    debug!("Teardown already in progress");
                    return Ok(());
                }
                debug!("Waiting for concurrent teardown");
                state = self
                    .idle
                    .wait_while(state, |s| s.shutting_down)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.shutting_down = true;
            state.teardown_thread = Some(me);
            let handle = state.handle.clone();
            errors.extend(state.engine.cancel_all(handle.as_deref()));
        }

        if let Err(e) = self.drain() {
            errors.push(e);
        }

        {
            let mut state = self.lock_state();
            errors.extend(release_claims(&mut state));
            if state.handle.take().is_some() {
                info!(
                    "Closed device handle {:04x}:{:04x}",
                    state.identity.vendor_id, state.identity.product_id
                );
            }
        }

        if stop_pump {
            self.stop_event_handling();
        }

        {
            let mut state = self.lock_state();
            state.shutting_down = false;
            state.teardown_thread = None;
        }
        self.idle.notify_all();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Shutdown(errors))
        }
    }

    /// Wait for cancelled transfers to report back
    ///
    /// Uses the pump when it runs, otherwise drives the event source inline.
    /// From inside a completion callback nothing further can be delivered
    /// until it returns, so the remaining transfers are retired at once.
    fn drain(&self) -> Result<()> {
        let deadline = Instant::now() + self.options.drain_timeout();

        if self.on_pump_thread() {
            let retired = self.lock_state().engine.retire_all();
            if retired > 0 {
                debug!("Retired {} transfer(s) from the pump thread", retired);
            }
            return Ok(());
        }

        if self.pump_running() {
            let state = self.lock_state();
            let timeout = deadline.saturating_duration_since(Instant::now());
            let _ = self
                .drained
                .wait_timeout_while(state, timeout, |s| !s.engine.is_empty())
                .unwrap_or_else(PoisonError::into_inner);
        } else {
            let context = self.lock_state().context.clone();
            while let Some(source) = context.as_ref() {
                if self.lock_state().engine.is_empty() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let wait = self.options.event_timeout().min(deadline - now);
                if let Err(e) = source.handle_events(wait) {
                    debug!("Event handling during drain: {}", e);
                }
            }
        }

        let remaining = self.lock_state().engine.retire_all();
        if remaining > 0 {
            warn!("{} transfer(s) did not drain in time", remaining);
            return Err(SessionError::DrainTimeout { remaining });
        }
        Ok(())
    }
}

/// Release every claimed interface, clearing the claim set
fn release_claims(state: &mut SessionState) -> Vec<SessionError> {
    let mut errors = Vec::new();
    let claimed: Vec<u8> = state.claimed.drain(..).collect();
    let Some(handle) = state.handle.as_ref() else {
        return errors;
    };

    for interface in claimed {
        match handle.release_interface(interface) {
            Ok(()) => debug!("Released interface {}", interface),
            Err(e) => {
                warn!("Failed to release interface {}: {}", interface, e);
                errors.push(SessionError::Usb(e));
            }
        }
    }
    errors
}

/// Pick the string-table language and re-read the identity strings
fn resolve_language(state: &mut SessionState, requested: u16, timeout: Duration) {
    let Some(handle) = state.handle.clone() else {
        debug!("Language {:#06x} recorded; no open handle", requested);
        state.identity.language_id = requested;
        return;
    };

    let language = if requested != 0 {
        requested
    } else {
        match descriptors::read_languages(handle.as_ref(), timeout) {
            Ok(languages) => languages.first().copied().unwrap_or(0),
            Err(e) => {
                debug!("Language list unavailable ({}), using ASCII fallback", e);
                0
            }
        }
    };
    state.identity.language_id = language;

    let Some(desc) = state.catalog.as_ref().map(|c| c.device().clone()) else {
        return;
    };
    let pull = |index: Option<u8>| {
        descriptors::pull_string(handle.as_ref(), index.unwrap_or(0), language, timeout)
    };
    state.identity.manufacturer = pull(desc.manufacturer_string_index);
    state.identity.product = pull(desc.product_string_index);
    state.identity.serial_number = pull(desc.serial_number_string_index);

    debug!(
        "Language {:#06x}: manufacturer={:?} product={:?} serial={:?}",
        language,
        state.identity.manufacturer,
        state.identity.product,
        state.identity.serial_number
    );
}

//! Asynchronous transfer engine
//!
//! Owns the set of active transfers for a session. A transfer lives in the
//! active set from its first successful submission until it is retired; the
//! set holds an `Arc` so a completion running on the pump thread can never
//! observe a freed transfer, even while the session tears down.
//!
//! The engine itself is not synchronized. The session keeps it behind its
//! state mutex and every method here runs with that lock held.

use crate::backend::{BackendResult, Completion, CompletionFn, RawHandle, TransferStatus};
use crate::descriptors::{Direction, EndpointAddress, EndpointDescriptor, EndpointType};
use crate::error::SessionError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Packets per isochronous transfer created by default
pub const DEFAULT_ISO_PACKETS: u32 = 8;

/// Max-packet multiples per default bulk IN transfer
pub const DEFAULT_BULK_PACKETS: usize = 16;

/// Session-unique transfer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transfer type as submitted to the host library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Interrupt,
    Bulk,
    /// Buffer is split into `packets` equal packets
    Isochronous { packets: u32 },
}

/// Shape of a transfer before the engine assigns it an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSetup {
    pub endpoint: EndpointAddress,
    pub kind: TransferKind,
    /// Buffer length in bytes
    pub length: usize,
    /// Data stage for OUT transfers, sent unchanged on every submission
    pub payload: Vec<u8>,
}

impl TransferSetup {
    /// IN transfer reading up to `length` bytes
    pub fn input(endpoint: EndpointAddress, kind: TransferKind, length: usize) -> Self {
        Self {
            endpoint,
            kind,
            length,
            payload: Vec::new(),
        }
    }

    /// OUT transfer sending `payload`
    pub fn output(endpoint: EndpointAddress, kind: TransferKind, payload: Vec<u8>) -> Self {
        Self {
            endpoint,
            kind,
            length: payload.len(),
            payload,
        }
    }

    /// Default factory: one polling transfer per IN endpoint
    ///
    /// Interrupt endpoints get one packet, bulk endpoints
    /// [`DEFAULT_BULK_PACKETS`] packets and isochronous endpoints
    /// [`DEFAULT_ISO_PACKETS`] service intervals. Control and OUT endpoints
    /// have nothing to poll and yield `None`.
    pub fn for_endpoint(ep: &EndpointDescriptor) -> Option<Self> {
        if ep.address.direction() != Direction::In {
            return None;
        }

        let packet = ep.packet_size().max(1);
        let (kind, length) = match ep.transfer_type {
            EndpointType::Interrupt => (TransferKind::Interrupt, packet),
            EndpointType::Bulk => (TransferKind::Bulk, packet * DEFAULT_BULK_PACKETS),
            EndpointType::Isochronous => (
                TransferKind::Isochronous {
                    packets: DEFAULT_ISO_PACKETS,
                },
                packet * DEFAULT_ISO_PACKETS as usize,
            ),
            EndpointType::Control => return None,
        };

        Some(Self::input(ep.address, kind, length))
    }
}

/// Lifecycle of a transfer
///
/// `Created → Submitted → (Completed → Submitted | Completed → Retired)
/// | CancelRequested → Retired`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Submitted,
    Completed,
    CancelRequested,
    Retired,
}

impl TransferState {
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Created, Submitted)
                | (Created, Retired)
                | (Submitted, Completed)
                | (Submitted, CancelRequested)
                // backend refused the submission
                | (Submitted, Retired)
                | (Completed, Submitted)
                | (Completed, Retired)
                | (CancelRequested, Retired)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TransferState::Retired
    }
}

#[derive(Debug)]
struct Progress {
    state: TransferState,
    cancel_requested: bool,
    last_status: Option<TransferStatus>,
    actual_length: usize,
    submissions: u64,
    completions: u64,
}

/// One asynchronous I/O request bound to an endpoint
#[derive(Debug)]
pub struct Transfer {
    id: TransferId,
    endpoint: EndpointAddress,
    kind: TransferKind,
    length: usize,
    payload: Vec<u8>,
    progress: Mutex<Progress>,
}

impl Transfer {
    fn new(id: TransferId, setup: TransferSetup) -> Self {
        Self {
            id,
            endpoint: setup.endpoint,
            kind: setup.kind,
            length: setup.length,
            payload: setup.payload,
            progress: Mutex::new(Progress {
                state: TransferState::Created,
                cancel_requested: false,
                last_status: None,
                actual_length: 0,
                submissions: 0,
                completions: 0,
            }),
        }
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn state(&self) -> TransferState {
        self.progress().state
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.progress().cancel_requested
    }

    /// Status of the most recent completion
    pub fn status(&self) -> Option<TransferStatus> {
        self.progress().last_status
    }

    /// Bytes moved by the most recent completion
    pub fn actual_length(&self) -> usize {
        self.progress().actual_length
    }

    /// Number of accepted submissions so far
    pub fn submissions(&self) -> u64 {
        self.progress().submissions
    }

    /// Number of completions delivered so far
    pub fn completions(&self) -> u64 {
        self.progress().completions
    }

    /// Buffer handed to the backend for one submission
    fn make_buffer(&self) -> Vec<u8> {
        match self.endpoint.direction() {
            Direction::In => vec![0u8; self.length],
            Direction::Out => self.payload.clone(),
        }
    }

    /// Terminal state, reachable from anywhere during teardown
    fn mark_retired(&self) {
        let mut p = self.progress();
        if p.state != TransferState::Retired {
            trace!("Transfer {}: {:?} -> Retired", self.id, p.state);
            p.state = TransferState::Retired;
        }
    }

    /// Move to `next`, returning false if the transition is not allowed
    fn advance(&self, next: TransferState) -> bool {
        let mut p = self.progress();
        if !p.state.can_transition_to(next) {
            warn!(
                "Transfer {} on {}: rejected transition {:?} -> {:?}",
                self.id, self.endpoint, p.state, next
            );
            return false;
        }
        trace!("Transfer {}: {:?} -> {:?}", self.id, p.state, next);
        p.state = next;
        true
    }
}

/// What the session should do with a completion
#[derive(Debug)]
pub enum CompletionAction {
    /// Not in the active set (already retired); drop it
    Stale,
    /// Cancel was requested; the transfer has been retired
    Retired(Arc<Transfer>),
    /// Hand the data to the device class
    Deliver(Arc<Transfer>),
}

/// Pool of active transfers for one session
#[derive(Debug, Default)]
pub struct TransferEngine {
    active: HashMap<TransferId, Arc<Transfer>>,
    next_id: u64,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a transfer in `Created` state; it joins the active set on submit
    pub fn create_transfer(&mut self, setup: TransferSetup) -> Arc<Transfer> {
        self.next_id += 1;
        let transfer = Arc::new(Transfer::new(TransferId(self.next_id), setup));
        debug!(
            "Created transfer {} for endpoint {} ({:?}, {} bytes)",
            transfer.id, transfer.endpoint, transfer.kind, transfer.length
        );
        transfer
    }

    /// Submit (or resubmit) `transfer`; `done` fires exactly once on success
    ///
    /// On failure the transfer is retired and removed from the active set.
    pub fn submit(
        &mut self,
        handle: &dyn RawHandle,
        transfer: &Arc<Transfer>,
        done: CompletionFn,
    ) -> Result<(), SessionError> {
        let endpoint = transfer.endpoint.raw();

        if transfer.is_cancel_requested() || !transfer.advance(TransferState::Submitted) {
            self.retire(transfer.id);
            transfer.mark_retired();
            return Err(SessionError::TransferSubmission {
                endpoint,
                source: rusb::Error::InvalidParam,
            });
        }

        match handle.submit(transfer, transfer.make_buffer(), done) {
            Ok(()) => {
                transfer.progress().submissions += 1;
                self.active.insert(transfer.id, Arc::clone(transfer));
                trace!("Submitted transfer {} on {}", transfer.id, transfer.endpoint);
                Ok(())
            }
            Err(source) => {
                warn!(
                    "Submission of transfer {} on {} failed: {}",
                    transfer.id, transfer.endpoint, source
                );
                self.retire(transfer.id);
                transfer.mark_retired();
                Err(SessionError::TransferSubmission { endpoint, source })
            }
        }
    }

    /// Record a completion for `id` and decide how it is handled
    pub fn begin_completion(&mut self, id: TransferId, completion: &Completion) -> CompletionAction {
        let Some(transfer) = self.active.get(&id).cloned() else {
            return CompletionAction::Stale;
        };

        {
            let mut p = transfer.progress();
            p.completions += 1;
            p.last_status = Some(completion.status);
            p.actual_length = completion.data.len();
        }

        if transfer.is_cancel_requested()
            || transfer.state() == TransferState::CancelRequested
            || completion.status == TransferStatus::Cancelled
        {
            self.retire(id);
            return CompletionAction::Retired(transfer);
        }

        if !transfer.advance(TransferState::Completed) {
            self.retire(id);
            return CompletionAction::Retired(transfer);
        }
        CompletionAction::Deliver(transfer)
    }

    /// Cancel one transfer; a transfer that already completed is left alone
    pub fn cancel(&mut self, handle: Option<&dyn RawHandle>, id: TransferId) -> BackendResult<()> {
        let Some(transfer) = self.active.get(&id).cloned() else {
            trace!("Cancel of inactive transfer {} ignored", id);
            return Ok(());
        };

        let in_flight = {
            let mut p = transfer.progress();
            p.cancel_requested = true;
            p.state == TransferState::Submitted
        };

        if !in_flight {
            // Completion handler is running; dispatch retires it afterwards
            return Ok(());
        }

        transfer.advance(TransferState::CancelRequested);
        match handle {
            Some(h) => match h.cancel(id) {
                Ok(()) | Err(rusb::Error::NotFound) => Ok(()),
                Err(e) => Err(e),
            },
            None => Ok(()),
        }
    }

    /// Cancel every active transfer, collecting failures
    pub fn cancel_all(&mut self, handle: Option<&dyn RawHandle>) -> Vec<SessionError> {
        let ids: Vec<TransferId> = self.active.keys().copied().collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.cancel(handle, id) {
                warn!("Failed to cancel transfer {}: {}", id, e);
                errors.push(SessionError::Usb(e));
            }
        }
        errors
    }

    /// Remove `id` from the active set and mark it `Retired`
    pub fn retire(&mut self, id: TransferId) -> Option<Arc<Transfer>> {
        let transfer = self.active.remove(&id)?;
        transfer.mark_retired();
        debug!("Retired transfer {} on {}", id, transfer.endpoint);
        Some(transfer)
    }

    /// Retire everything left in the active set
    pub fn retire_all(&mut self) -> usize {
        let ids: Vec<TransferId> = self.active.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.retire(id)).count()
    }

    pub fn get(&self, id: TransferId) -> Option<&Arc<Transfer>> {
        self.active.get(&id)
    }

    pub fn contains(&self, id: TransferId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Snapshot of the active transfers
    pub fn transfers(&self) -> Vec<Arc<Transfer>> {
        self.active.values().cloned().collect()
    }
}

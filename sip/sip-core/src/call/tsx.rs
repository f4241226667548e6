use super::timer::Timers;
use crate::IncomingRequest;
use crate::app::CallbackKind;
use crate::reply::OutgoingResponse;
use bytesstr::BytesStr;
use sip_types::{Method, SipUri};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;

/// Per-call transaction identifier, dense and monotonically assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TsxId(pub(crate) u64);

impl fmt::Display for TsxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// States of the UAS state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsxState {
    /// Waiting for the authorize decision
    Authorize,

    /// Waiting for the route decision
    Route,

    /// INVITE being processed, provisional responses may flow
    InviteProceeding,

    /// Non-INVITE being processed
    Trying,

    /// ACK being processed, no response will ever be sent
    Ack,

    /// A final response has been sent
    Completed,

    /// Terminal state, the transaction is destroyed on entry
    Finished,
}

/// Transaction key per RFC 3261 Section 17.2.3.
///
/// INVITE and ACK share a key so transaction-level ACKs match the INVITE
/// transaction they acknowledge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct TsxKey {
    pub branch: BytesStr,
    pub method: Option<Method>,
}

impl TsxKey {
    pub(crate) fn of(method: &Method, branch: &BytesStr) -> Self {
        let method = if *method == Method::INVITE || *method == Method::ACK {
            None
        } else {
            Some(method.clone())
        };

        Self {
            branch: branch.clone(),
            method,
        }
    }

    /// The key the INVITE transaction targeted by a CANCEL would have
    pub(crate) fn invite(branch: &BytesStr) -> Self {
        Self {
            branch: branch.clone(),
            method: None,
        }
    }
}

/// An application callback that has been issued but not yet answered
#[derive(Debug)]
pub(crate) struct PendingCallback {
    pub kind: CallbackKind,
    pub issued_in: TsxState,
    pub bridge: AbortHandle,
}

/// Server transaction record, one per received request.
///
/// The immutable keys are set at construction; everything else is mutated
/// only by the owning call actor.
#[derive(Debug)]
pub(crate) struct UasTsx {
    pub id: TsxId,
    pub key: TsxKey,
    pub method: Method,
    pub ruri: SipUri,
    pub proto: &'static str,
    pub reliable: bool,
    pub loop_id: Option<u64>,
    pub start: Instant,
    pub request: Arc<IncomingRequest>,
    pub local_tag: BytesStr,

    pub state: TsxState,
    pub response: Option<OutgoingResponse>,
    /// Status of the latest sent response, 0 until one was sent
    pub code: u16,
    pub stateless: bool,
    /// The fork engine owns the downstream legs of this transaction
    pub forked: bool,
    pub timers: Timers,
    pub pending: Option<PendingCallback>,
}

impl UasTsx {
    pub(crate) fn new(
        id: TsxId,
        request: Arc<IncomingRequest>,
        loop_id: Option<u64>,
        local_tag: BytesStr,
    ) -> Self {
        Self {
            id,
            key: TsxKey::of(&request.line.method, &request.base_headers.branch),
            method: request.line.method.clone(),
            ruri: request.line.uri.clone(),
            proto: request.tp_info.transport.name(),
            reliable: request.tp_info.transport.reliable(),
            loop_id,
            start: Instant::now(),
            request,
            local_tag,
            state: TsxState::Authorize,
            response: None,
            code: 0,
            stateless: false,
            forked: false,
            timers: Timers::default(),
            pending: None,
        }
    }
}

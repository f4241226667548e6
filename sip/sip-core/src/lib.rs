//! Server-side transaction core of the rill SIP stack.
//!
//! The core receives parsed requests, groups them into per-Call-ID actors and
//! drives every request through the UAS state machine: authorization,
//! routing, processing and exactly one final response. Applications plug in
//! through the [`SipApp`] callback trait and an ordered [`Layer`] chain that
//! may intercept and rewrite every callback; transport, parsing, the dialog
//! engine and the proxy/fork engine are external collaborators behind small
//! trait contracts.

use bytes::Bytes;
use sip_types::{BaseHeaders, Headers, RequestLine};
use std::fmt;

mod app;
mod call;
mod dialog;
mod endpoint;
mod error;
mod proxy;
mod reply;
mod transport;

pub use app::{
    AuthToken, AuthorizeOutcome, CallbackArgs, CallbackKind, Control, Decision, DefaultApp,
    DigestVerifier, Layer, MethodReply, ReplyToken, RouteDecision, RouteOpts, SipApp, UasRequest,
};
pub use call::{TsxId, TsxState, consts};
pub use dialog::{DialogError, DialogHook, DialogId, PermissiveDialog};
pub use endpoint::{Config, Endpoint, EndpointBuilder};
pub use error::{Error, Result};
pub use proxy::{ForkUpstream, NoProxy, ProxyHook, ProxyOutcome};
pub use reply::{OutgoingResponse, SipReply};
pub use transport::{MessageTpInfo, Transport, TpHandle};

/// Request delivered to the endpoint by the (external) transport frontend.
///
/// Everything in here was already parsed; `id` is the frontend's message id
/// used for duplicate-delivery suppression.
#[derive(Debug)]
pub struct IncomingRequest {
    pub id: u64,
    pub tp_info: MessageTpInfo,

    pub line: RequestLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

impl fmt::Display for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

use crate::app::RouteOpts;
use crate::call::{CallEvent, TsxId};
use crate::reply::SipReply;
use crate::{Error, IncomingRequest, Result};
use sip_types::{Code, SipUri};
use tokio::sync::mpsc;

/// Outcome of handing a request to the proxy engine
#[derive(Debug)]
pub enum ProxyOutcome {
    /// The request was forwarded statelessly; the transaction terminates
    /// immediately
    Stateless,

    /// The fork engine took over the downstream legs. Its best final response
    /// is delivered through the [`ForkUpstream`] handle and forwarded
    /// upstream exactly once.
    Forked,

    /// The request could not be routed; answer locally
    Reply(SipReply),
}

/// Handle the fork engine uses to deliver the winning final response of a
/// forked request back into the owning transaction.
#[derive(Debug)]
pub struct ForkUpstream {
    pub(crate) tsx: TsxId,
    pub(crate) events: mpsc::UnboundedSender<CallEvent>,
}

impl ForkUpstream {
    /// Deliver the best final response upstream.
    ///
    /// Replies after the transaction completed (or a second reply) are
    /// discarded by the transaction.
    pub fn answer(self, reply: SipReply) -> Result<()> {
        self.events
            .send(CallEvent::ForkReply {
                tsx: self.tsx,
                reply,
            })
            .map_err(|_| Error::CallGone)
    }
}

/// Contract between the transaction core and the proxy/fork engine.
///
/// The owning call is suspended while a hook call runs, so implementations
/// must hand off quickly and never block.
#[async_trait::async_trait]
pub trait ProxyHook: Send + Sync + 'static {
    /// Forward the request to one or more targets, possibly forking
    async fn proxy(
        &self,
        request: &IncomingRequest,
        targets: &[SipUri],
        opts: &RouteOpts,
        upstream: ForkUpstream,
    ) -> ProxyOutcome;

    /// Pre-RFC 3261 strict routing: forward to the topmost Route header
    async fn strict_proxy(
        &self,
        _request: &IncomingRequest,
        _opts: &RouteOpts,
        _upstream: ForkUpstream,
    ) -> ProxyOutcome {
        ProxyOutcome::Reply(SipReply::with_reason(
            Code::SERVER_INTERNAL_ERROR,
            "No Proxy Attached",
        ))
    }
}

/// Stub used when no proxy engine is attached; answers every proxy route
/// decision with a local `500`.
#[derive(Debug, Default)]
pub struct NoProxy;

#[async_trait::async_trait]
impl ProxyHook for NoProxy {
    async fn proxy(
        &self,
        request: &IncomingRequest,
        _targets: &[SipUri],
        _opts: &RouteOpts,
        _upstream: ForkUpstream,
    ) -> ProxyOutcome {
        log::warn!("no proxy engine attached, cannot forward {}", request);

        ProxyOutcome::Reply(SipReply::with_reason(
            Code::SERVER_INTERNAL_ERROR,
            "No Proxy Attached",
        ))
    }
}

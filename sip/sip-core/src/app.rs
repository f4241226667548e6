use crate::call::{CallEvent, TsxId, TsxState};
use crate::endpoint::{Endpoint, EndpointBuilder};
use crate::reply::SipReply;
use crate::{Error, IncomingRequest, Result};
use bytesstr::BytesStr;
use downcast_rs::{Downcast, impl_downcast};
use sip_types::{Method, Name, Scheme, SipUri};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Instrument;

/// The named application callbacks the core may invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Authorize,
    Route,
    Invite,
    ReInvite,
    Bye,
    Options,
    Register,
    Info,
    Message,
    Subscribe,
    ReSubscribe,
    Notify,
    Refer,
    Publish,
    Update,
    Prack,
    Ack,
}

impl CallbackKind {
    pub fn name(self) -> &'static str {
        match self {
            CallbackKind::Authorize => "authorize",
            CallbackKind::Route => "route",
            CallbackKind::Invite => "invite",
            CallbackKind::ReInvite => "reinvite",
            CallbackKind::Bye => "bye",
            CallbackKind::Options => "options",
            CallbackKind::Register => "register",
            CallbackKind::Info => "info",
            CallbackKind::Message => "message",
            CallbackKind::Subscribe => "subscribe",
            CallbackKind::ReSubscribe => "resubscribe",
            CallbackKind::Notify => "notify",
            CallbackKind::Refer => "refer",
            CallbackKind::Publish => "publish",
            CallbackKind::Update => "update",
            CallbackKind::Prack => "prack",
            CallbackKind::Ack => "ack",
        }
    }

    /// The method callback a request maps to, `None` for unknown methods
    pub(crate) fn of_method(method: &Method, in_dialog: bool) -> Option<Self> {
        use CallbackKind::*;

        let kind = if *method == Method::INVITE {
            if in_dialog { ReInvite } else { Invite }
        } else if *method == Method::ACK {
            Ack
        } else if *method == Method::BYE {
            Bye
        } else if *method == Method::OPTIONS {
            Options
        } else if *method == Method::REGISTER {
            Register
        } else if *method == Method::INFO {
            Info
        } else if *method == Method::MESSAGE {
            Message
        } else if *method == Method::SUBSCRIBE {
            if in_dialog { ReSubscribe } else { Subscribe }
        } else if *method == Method::NOTIFY {
            Notify
        } else if *method == Method::REFER {
            Refer
        } else if *method == Method::PUBLISH {
            Publish
        } else if *method == Method::UPDATE {
            Update
        } else if *method == Method::PRACK {
            Prack
        } else {
            return None;
        };

        Some(kind)
    }
}

/// Evidence collected for the `authorize` callback
#[derive(Debug, Clone)]
pub enum AuthToken {
    /// The request arrived inside an existing dialog
    Dialog,

    /// Digest credentials were present and checked against the password the
    /// application supplied via `get_user_pass`
    Digest { realm: BytesStr, ok: bool },
}

/// Decision of the `authorize` callback
#[derive(Debug)]
pub enum AuthorizeOutcome {
    /// Let the request proceed to routing
    Ok,

    /// Reject with `403 Forbidden`
    Forbidden,

    /// Challenge with `401` and a WWW-Authenticate header
    Authenticate { realm: Option<BytesStr> },

    /// Challenge with `407` and a Proxy-Authenticate header
    ProxyAuthenticate { realm: Option<BytesStr> },

    /// Answer with an explicit reply
    Reply(SipReply),

    /// The decision is delivered later through the [`ReplyToken`]
    Defer,
}

#[derive(Debug, Clone, Default)]
pub struct RouteOpts {
    /// Run the transaction stateless: no timers, destroyed right after its
    /// response. Only legal for non-INVITE requests.
    pub stateless: bool,
}

/// Decision of the `route` callback
#[derive(Debug)]
pub enum RouteDecision {
    /// Proceed to the local method handler
    Process { opts: RouteOpts },

    /// Forward to one or more next hops, possibly forked
    Proxy { targets: Vec<SipUri>, opts: RouteOpts },

    /// Pre-RFC 3261 strict routing via the topmost Route header
    StrictProxy { opts: RouteOpts },

    /// Answer locally
    Respond { reply: SipReply, opts: RouteOpts },

    /// The decision is delivered later through the [`ReplyToken`]
    Defer,
}

impl RouteDecision {
    pub fn process() -> Self {
        Self::Process {
            opts: RouteOpts::default(),
        }
    }

    pub fn proxy(targets: Vec<SipUri>) -> Self {
        Self::Proxy {
            targets,
            opts: RouteOpts::default(),
        }
    }

    pub fn respond(reply: SipReply) -> Self {
        Self::Respond {
            reply,
            opts: RouteOpts::default(),
        }
    }

    pub fn respond_stateless(reply: SipReply) -> Self {
        Self::Respond {
            reply,
            opts: RouteOpts { stateless: true },
        }
    }
}

/// A bare reply as route decision means: answer stateless
impl From<SipReply> for RouteDecision {
    fn from(reply: SipReply) -> Self {
        Self::respond_stateless(reply)
    }
}

/// Decision of a method callback (`invite`, `bye`, `options`, ...)
#[derive(Debug)]
pub enum MethodReply {
    /// Send this reply. Provisional replies keep the transaction (and the
    /// callback) alive, a final reply completes it.
    Reply(SipReply),

    /// The application takes over and answers later through the
    /// [`ReplyToken`]
    NoReply,

    /// Use the built-in default handler for the method
    Default,
}

impl From<SipReply> for MethodReply {
    fn from(reply: SipReply) -> Self {
        Self::Reply(reply)
    }
}

/// Terminal value of a callback invocation
#[derive(Debug)]
pub enum Decision {
    Authorize(AuthorizeOutcome),
    Route(RouteDecision),
    Method(MethodReply),
}

/// What the bridge reports back into the call actor
#[derive(Debug)]
pub(crate) enum BridgeReply {
    Decision(Decision),
    AckDone,
    Deferred,
    Failed,
}

/// Arguments a callback is invoked with.
///
/// Layers receive these ahead of the application and may rewrite them.
#[derive(Debug, Clone)]
pub enum CallbackArgs {
    Authorize {
        tokens: Vec<AuthToken>,
    },
    Route {
        scheme: Scheme,
        user: Option<BytesStr>,
        domain: BytesStr,
    },
    Method {
        kind: CallbackKind,
    },
    Ack,
}

/// Verdict of a single layer in the callback chain
#[derive(Debug)]
pub enum Control {
    /// Run the next layer (or the application) with the given arguments
    Continue(CallbackArgs),

    /// Short-circuit the chain with a terminal decision
    Stop(Decision),
}

/// Layers are extensions to the endpoint.
///
/// They are added to the endpoint in the building stage by calling
/// [`EndpointBuilder::add_layer`] and intercept every application callback in
/// insertion order, each either passing the (possibly rewritten) arguments on
/// or short-circuiting with a terminal decision. The final sink of the chain
/// is the application itself.
#[async_trait::async_trait]
pub trait Layer: Downcast + Send + Sync + 'static {
    /// Return a descriptive and unique name of the layer
    fn name(&self) -> &'static str;

    /// When building the endpoint each layer may make modifications to the
    /// [`EndpointBuilder`]
    fn init(&mut self, _endpoint: &mut EndpointBuilder) {}

    /// Intercept one callback invocation
    async fn handle(
        &self,
        _endpoint: &Endpoint,
        _request: &UasRequest,
        args: CallbackArgs,
    ) -> Control {
        Control::Continue(args)
    }
}

impl_downcast!(Layer);

/// The application driving this endpoint.
///
/// Every callback is optional; the default bodies reproduce the stack's
/// built-in behavior, so an empty `impl SipApp for MyApp {}` yields a
/// functional albeit boring UAS.
#[async_trait::async_trait]
pub trait SipApp: Send + Sync + 'static {
    /// Decide whether the request may enter routing.
    ///
    /// `tokens` carries the evidence the stack collected: dialog membership
    /// and the outcome of digest credential checks.
    async fn authorize(&self, _tokens: &[AuthToken], _request: &UasRequest) -> AuthorizeOutcome {
        AuthorizeOutcome::Ok
    }

    /// Decide what to do with the request: process it locally, proxy it or
    /// answer it directly.
    async fn route(
        &self,
        _scheme: Scheme,
        _user: Option<&BytesStr>,
        _domain: &BytesStr,
        _request: &UasRequest,
    ) -> RouteDecision {
        RouteDecision::process()
    }

    async fn invite(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn reinvite(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn bye(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn options(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn register(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn info(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn message(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn subscribe(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn resubscribe(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn notify(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn refer(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn publish(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn update(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    async fn prack(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::Default
    }

    /// ACK notification; the result is ignored and no response is ever sent
    async fn ack(&self, _request: &UasRequest) {}

    /// Password lookup for digest credential checks
    async fn get_user_pass(
        &self,
        _user: &BytesStr,
        _realm: &BytesStr,
        _request: &UasRequest,
    ) -> Option<BytesStr> {
        None
    }
}

/// Application that answers everything with the stack defaults
#[derive(Debug, Default)]
pub struct DefaultApp;

impl SipApp for DefaultApp {}

/// Collaborator validating digest credentials.
///
/// The credential header grammar lives with the implementation; the core only
/// routes identities and passwords between it and the application.
pub trait DigestVerifier: Send + Sync + 'static {
    /// Extract `(user, realm)` from a credentials header value
    fn identify(&self, credentials: &BytesStr) -> Option<(BytesStr, BytesStr)>;

    /// Check the credentials against the password `get_user_pass` supplied
    fn verify(&self, credentials: &BytesStr, password: &BytesStr) -> bool;

    /// Build the challenge header value for a 401/407
    fn challenge(&self, realm: &BytesStr) -> BytesStr {
        BytesStr::from(format!("Digest realm=\"{}\"", realm))
    }
}

/// Handle on a transaction's request, passed to every callback
#[derive(Debug, Clone)]
pub struct UasRequest {
    pub(crate) request: Arc<IncomingRequest>,
    pub(crate) token: ReplyToken,
}

impl UasRequest {
    /// Token to answer this callback with after returning a defer value
    pub fn reply_token(&self) -> ReplyToken {
        self.token.clone()
    }
}

impl Deref for UasRequest {
    type Target = IncomingRequest;

    fn deref(&self) -> &Self::Target {
        &self.request
    }
}

/// Opaque handle identifying one outstanding application callback.
///
/// Lets the application deliver a deferred decision without referencing call
/// internals. Deliveries are validated against the transaction's current
/// state; a reply that arrives after the transaction moved on is discarded.
#[derive(Debug, Clone)]
pub struct ReplyToken {
    pub(crate) kind: CallbackKind,
    pub(crate) tsx: TsxId,
    pub(crate) issued_in: TsxState,
    pub(crate) events: mpsc::UnboundedSender<CallEvent>,
}

impl ReplyToken {
    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    /// Deliver a deferred `authorize` decision
    pub fn authorize(self, outcome: AuthorizeOutcome) -> Result<()> {
        self.deliver(Decision::Authorize(outcome))
    }

    /// Deliver a deferred `route` decision
    pub fn route(self, decision: RouteDecision) -> Result<()> {
        self.deliver(Decision::Route(decision))
    }

    /// Deliver a reply for a deferred method callback
    pub fn reply(self, reply: SipReply) -> Result<()> {
        self.deliver(Decision::Method(MethodReply::Reply(reply)))
    }

    fn deliver(self, decision: Decision) -> Result<()> {
        self.events
            .send(CallEvent::AppReply {
                tsx: self.tsx,
                kind: self.kind,
                issued_in: self.issued_in,
                reply: BridgeReply::Decision(decision),
            })
            .map_err(|_| Error::CallGone)
    }
}

/// Run the layer chain and the application sink for one callback invocation
pub(crate) async fn run_chain(
    endpoint: &Endpoint,
    request: &UasRequest,
    mut args: CallbackArgs,
) -> BridgeReply {
    if let CallbackArgs::Authorize { tokens } = &mut args {
        collect_digest_tokens(endpoint, request, tokens).await;
    }

    let mut decision = None;
    let mut args = Some(args);

    for layer in endpoint.layers() {
        let span = tracing::info_span!("layer", name = %layer.name());

        let current = args.take().expect("args is always repopulated before the next iteration");
        match layer.handle(endpoint, request, current).instrument(span).await {
            Control::Continue(next) => args = Some(next),
            Control::Stop(terminal) => {
                decision = Some(terminal);
                break;
            }
        }
    }

    let decision = match decision {
        Some(decision) => decision,
        None => {
            let app = endpoint.app();

            match args.expect("args is always repopulated when no layer stopped the chain") {
                CallbackArgs::Authorize { tokens } => {
                    Decision::Authorize(app.authorize(&tokens, request).await)
                }
                CallbackArgs::Route {
                    scheme,
                    user,
                    domain,
                } => Decision::Route(app.route(scheme, user.as_ref(), &domain, request).await),
                CallbackArgs::Method { kind } => {
                    Decision::Method(dispatch_method(app, kind, request).await)
                }
                CallbackArgs::Ack => {
                    app.ack(request).await;
                    return BridgeReply::AckDone;
                }
            }
        }
    };

    match decision {
        Decision::Authorize(AuthorizeOutcome::Defer)
        | Decision::Route(RouteDecision::Defer)
        | Decision::Method(MethodReply::NoReply) => BridgeReply::Deferred,
        decision => BridgeReply::Decision(decision),
    }
}

async fn dispatch_method(
    app: &dyn SipApp,
    kind: CallbackKind,
    request: &UasRequest,
) -> MethodReply {
    match kind {
        CallbackKind::Invite => app.invite(request).await,
        CallbackKind::ReInvite => app.reinvite(request).await,
        CallbackKind::Bye => app.bye(request).await,
        CallbackKind::Options => app.options(request).await,
        CallbackKind::Register => app.register(request).await,
        CallbackKind::Info => app.info(request).await,
        CallbackKind::Message => app.message(request).await,
        CallbackKind::Subscribe => app.subscribe(request).await,
        CallbackKind::ReSubscribe => app.resubscribe(request).await,
        CallbackKind::Notify => app.notify(request).await,
        CallbackKind::Refer => app.refer(request).await,
        CallbackKind::Publish => app.publish(request).await,
        CallbackKind::Update => app.update(request).await,
        CallbackKind::Prack => app.prack(request).await,
        CallbackKind::Authorize | CallbackKind::Route | CallbackKind::Ack => {
            unreachable!("not a method callback kind")
        }
    }
}

async fn collect_digest_tokens(
    endpoint: &Endpoint,
    request: &UasRequest,
    tokens: &mut Vec<AuthToken>,
) {
    let Some(digest) = endpoint.digest() else {
        return;
    };

    for name in [Name::AUTHORIZATION, Name::PROXY_AUTHORIZATION] {
        for credentials in request.headers.get_all(&name) {
            let Some((user, realm)) = digest.identify(credentials) else {
                log::debug!("unintelligible credentials in {}, skipped", name);
                continue;
            };

            let ok = match endpoint.app().get_user_pass(&user, &realm, request).await {
                Some(password) => digest.verify(credentials, &password),
                None => false,
            };

            tokens.push(AuthToken::Digest { realm, ok });
        }
    }
}

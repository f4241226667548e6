use crate::app::{DefaultApp, DigestVerifier, Layer, SipApp};
use crate::call::{self, CallEvent, CallHandle, consts};
use crate::dialog::{DialogHook, PermissiveDialog};
use crate::proxy::{NoProxy, ProxyHook};
use crate::reply::{self, OutgoingResponse, SipReply};
use crate::{IncomingRequest, Result};
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_types::{Code, Method};
use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write;
use std::mem::take;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendError;

/// Tunables of the transaction core
#[derive(Debug, Clone)]
pub struct Config {
    /// RFC 3261 T1 round-trip estimate
    pub t1: Duration,

    /// How long an INVITE may sit in proceeding before it is aborted with a
    /// `408`
    pub timer_c: Duration,

    /// Non-INVITE transaction deadline (RFC timer F)
    pub non_invite_timeout: Duration,

    /// Deadline for a single application callback
    pub app_timeout: Duration,

    /// Send an automatic `100 Trying` for INVITEs over unreliable transports
    pub auto_100: bool,

    /// Keep strict-routed requests stateful and leave the whole Route set to
    /// the proxy engine instead of mirroring the legacy first-hop-stateless
    /// behavior
    pub strict_route_all: bool,

    /// Bound of the per-call duplicate-suppression message log
    pub msg_log_bound: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            t1: consts::T1,
            timer_c: Duration::from_secs(180),
            non_invite_timeout: consts::T1 * 64,
            app_timeout: Duration::from_secs(30),
            auto_100: true,
            strict_route_all: false,
            msg_log_bound: 256,
        }
    }
}

/// The endpoint is the centerpiece of the stack. It carries the application,
/// the layer chain, the collaborator hooks and the registry of live calls.
///
/// It being a wrapper of a `Arc<Inner>` (where `Inner` is an internal struct)
/// makes it relatively cheap to clone and store where needed.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.inner.name)
            .field("inner_refcount", &Arc::strong_count(&self.inner))
            .finish_non_exhaustive()
    }
}

struct Inner {
    name: BytesStr,

    // capabilities
    allow: Vec<Method>,
    supported: Vec<BytesStr>,

    config: Config,

    app: Arc<dyn SipApp>,
    layer: Box<[Box<dyn Layer>]>,

    dialogs: Arc<dyn DialogHook>,
    proxy: Arc<dyn ProxyHook>,
    digest: Option<Arc<dyn DigestVerifier>>,

    calls: Mutex<HashMap<BytesStr, CallHandle>>,
}

impl Endpoint {
    /// Construct a new [`EndpointBuilder`]
    pub fn builder<N>(name: N) -> EndpointBuilder
    where
        N: Into<BytesStr>,
    {
        EndpointBuilder::new(name)
    }

    /// Pass a received request to the endpoint for processing.
    ///
    /// The owning call actor is looked up (or created) by Call-ID and the
    /// request is queued into it; events of one call are handled strictly in
    /// arrival order.
    pub fn receive(&self, request: IncomingRequest) {
        let call_id = request.base_headers.call_id.clone();

        let mut calls = self.inner.calls.lock();

        let handle = calls
            .entry(call_id.clone())
            .or_insert_with(|| call::spawn(self.clone(), call_id.clone()));

        if let Err(SendError(event)) = handle.events.send(CallEvent::Request(request)) {
            // the actor died without deregistering, replace it
            let handle = call::spawn(self.clone(), call_id.clone());
            let _ = handle.events.send(event);
            calls.insert(call_id, handle);
        }
    }

    /// The application identity this endpoint was built with
    pub fn name(&self) -> &BytesStr {
        &self.inner.name
    }

    /// All methods this endpoint advertises in Allow headers
    pub fn allowed(&self) -> &[Method] {
        &self.inner.allow
    }

    /// Whether the given extension token is advertised as supported
    pub fn supports(&self, extension: &str) -> bool {
        self.inner
            .supported
            .iter()
            .any(|s| s.eq_ignore_ascii_case(extension))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Create a response to an incoming request with a given status code and
    /// optional reason
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: Code,
        reason: Option<BytesStr>,
    ) -> OutgoingResponse {
        reply::build(
            request,
            None,
            SipReply {
                code,
                reason,
                headers: Vec::new(),
                body: Bytes::new(),
            },
        )
    }

    /// Print the response to its buffer (if needed) and send it via its
    /// transport
    pub fn send_response(&self, response: &mut OutgoingResponse) -> Result<()> {
        response.print();

        log::trace!(
            "sending response '{}' to {}",
            response.msg.line,
            response.destination
        );

        response
            .transport
            .send(response.buffer.clone(), response.destination)?;

        Ok(())
    }

    /// Access a layer inside the endpoint
    ///
    /// Panics if the layer does not exist in the endpoint
    pub fn layer<L: Layer>(&self) -> &L {
        self.inner
            .layer
            .iter()
            .find_map(|l| l.downcast_ref())
            .unwrap_or_else(|| panic!("endpoint is missing layer {}", type_name::<L>()))
    }

    pub(crate) fn app(&self) -> &dyn SipApp {
        &*self.inner.app
    }

    pub(crate) fn layers(&self) -> &[Box<dyn Layer>] {
        &self.inner.layer
    }

    pub(crate) fn dialogs(&self) -> &dyn DialogHook {
        &*self.inner.dialogs
    }

    pub(crate) fn proxy(&self) -> &dyn ProxyHook {
        &*self.inner.proxy
    }

    pub(crate) fn digest(&self) -> Option<&dyn DigestVerifier> {
        self.inner.digest.as_deref()
    }

    pub(crate) fn calls(&self) -> &Mutex<HashMap<BytesStr, CallHandle>> {
        &self.inner.calls
    }

    /// Allow header value listing every advertised method
    pub(crate) fn allow_header(&self) -> BytesStr {
        let mut value = String::new();

        for method in &self.inner.allow {
            if !value.is_empty() {
                value.push_str(", ");
            }

            let _ = write!(value, "{}", method);
        }

        value.into()
    }

    pub(crate) fn supported_header(&self) -> Option<BytesStr> {
        if self.inner.supported.is_empty() {
            return None;
        }

        let mut value = String::new();

        for extension in &self.inner.supported {
            if !value.is_empty() {
                value.push_str(", ");
            }

            value.push_str(extension);
        }

        Some(value.into())
    }
}

/// Builder instance for [`Endpoint`]
pub struct EndpointBuilder {
    name: BytesStr,

    allow: Vec<Method>,
    supported: Vec<BytesStr>,

    config: Config,

    layer: Vec<Box<dyn Layer>>,
    app: Option<Arc<dyn SipApp>>,
    dialogs: Option<Arc<dyn DialogHook>>,
    proxy: Option<Arc<dyn ProxyHook>>,
    digest: Option<Arc<dyn DigestVerifier>>,
}

impl EndpointBuilder {
    /// Start building an endpoint with the given application identity.
    ///
    /// The identity names the application in logs and feeds the loop
    /// detection fingerprint. The standard method set is advertised by
    /// default; [`add_allow`](Self::add_allow) extends it.
    pub fn new<N>(name: N) -> Self
    where
        N: Into<BytesStr>,
    {
        Self {
            name: name.into(),
            allow: vec![
                Method::INVITE,
                Method::ACK,
                Method::CANCEL,
                Method::BYE,
                Method::OPTIONS,
                Method::INFO,
                Method::UPDATE,
                Method::SUBSCRIBE,
                Method::NOTIFY,
                Method::REFER,
                Method::MESSAGE,
            ],
            supported: Vec::new(),
            config: Config::default(),
            layer: Vec::new(),
            app: None,
            dialogs: None,
            proxy: None,
            digest: None,
        }
    }

    pub fn set_config(&mut self, config: Config) -> &mut Self {
        self.config = config;
        self
    }

    /// Add an ALLOW entry to the endpoints capabilities
    pub fn add_allow(&mut self, allowed: Method) -> &mut Self {
        if !self.allow.contains(&allowed) {
            self.allow.push(allowed);
        }
        self
    }

    /// Add a SUPPORTED extension to the endpoints capabilities
    pub fn add_supported<S>(&mut self, supported: S) -> &mut Self
    where
        S: Into<BytesStr>,
    {
        self.supported.push(supported.into());
        self
    }

    /// Add an implementation of [`Layer`] to the endpoint.
    ///
    /// Note that the insertion order is relevant: it is the order in which
    /// layers intercept application callbacks.
    pub fn add_layer<L>(&mut self, layer: L) -> &mut Self
    where
        L: Layer,
    {
        self.layer.push(Box::new(layer));
        self
    }

    /// Set the application; [`DefaultApp`] answers when none is given
    pub fn set_app<A>(&mut self, app: A) -> &mut Self
    where
        A: SipApp,
    {
        self.app = Some(Arc::new(app));
        self
    }

    pub fn set_dialog_hook<D>(&mut self, dialogs: D) -> &mut Self
    where
        D: DialogHook,
    {
        self.dialogs = Some(Arc::new(dialogs));
        self
    }

    pub fn set_proxy_hook<P>(&mut self, proxy: P) -> &mut Self
    where
        P: ProxyHook,
    {
        self.proxy = Some(Arc::new(proxy));
        self
    }

    pub fn set_digest_verifier<V>(&mut self, digest: V) -> &mut Self
    where
        V: DigestVerifier,
    {
        self.digest = Some(Arc::new(digest));
        self
    }

    /// Complete building the endpoint
    pub fn build(&mut self) -> Endpoint {
        let mut layer = take(&mut self.layer).into_boxed_slice();
        for layer in layer.iter_mut() {
            layer.init(self);
        }

        let inner = Inner {
            name: self.name.clone(),
            allow: take(&mut self.allow),
            supported: take(&mut self.supported),
            config: self.config.clone(),
            app: self.app.take().unwrap_or_else(|| Arc::new(DefaultApp)),
            layer,
            dialogs: self
                .dialogs
                .take()
                .unwrap_or_else(|| Arc::new(PermissiveDialog)),
            proxy: self.proxy.take().unwrap_or_else(|| Arc::new(NoProxy)),
            digest: self.digest.take(),
            calls: Default::default(),
        };

        Endpoint {
            inner: Arc::new(inner),
        }
    }
}

//! UAS state machine: drives every received request from authorization over
//! routing into processing and out through exactly one final response.

use super::consts;
use super::timer::TimerName;
use super::tsx::{PendingCallback, TsxId, TsxKey, TsxState, UasTsx};
use super::{Call, CallEvent};
use crate::IncomingRequest;
use crate::app::{
    self, AuthToken, AuthorizeOutcome, BridgeReply, CallbackArgs, CallbackKind, Decision,
    MethodReply, ReplyToken, RouteDecision, RouteOpts, UasRequest,
};
use crate::dialog::DialogError;
use crate::proxy::{ForkUpstream, ProxyOutcome};
use crate::reply::{self, SipReply};
use bytesstr::BytesStr;
use rand::Rng;
use sip_types::{BaseHeaders, Code, CodeKind, Method, Name};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

impl Call {
    /// Entry point for every request the transport delivered for this call
    pub(super) async fn uas_request(&mut self, request: IncomingRequest) {
        if self.seen(request.id) {
            log::debug!("duplicate delivery of message {}, dropped", request.id);
            return;
        }

        // CANCEL is intercepted before it could ever reach the state machine
        if request.line.method == Method::CANCEL {
            self.uas_cancel(request).await;
            return;
        }

        let key = TsxKey::of(&request.line.method, &request.base_headers.branch);

        if let Some(idx) = self.transactions.iter().position(|t| t.key == key) {
            if request.line.method == Method::ACK {
                self.absorb_ack(idx);
            } else {
                self.retransmission(idx);
            }
            return;
        }

        self.uas_start(request).await;
    }

    /// Match a CANCEL against the INVITE transaction it targets.
    ///
    /// The CANCEL is answered first and the termination injected right after,
    /// in the same actor step, so the 200/487 pair leaves in order and cannot
    /// be torn apart by failures in between.
    async fn uas_cancel(&mut self, request: IncomingRequest) {
        let target = TsxKey::invite(&request.base_headers.branch);

        let mut terminate = None;

        let reply = match self.transactions.iter().position(|t| t.key == target) {
            Some(idx) => {
                let invite = &self.transactions[idx];

                if invite.request.tp_info.source != request.tp_info.source {
                    log::warn!(
                        "CANCEL from {} does not match INVITE source {}, rejecting",
                        request.tp_info.source,
                        invite.request.tp_info.source
                    );
                    SipReply::new(Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST)
                } else if matches!(
                    invite.state,
                    TsxState::Authorize | TsxState::Route | TsxState::InviteProceeding
                ) {
                    terminate = Some(idx);
                    SipReply::new(Code::OK)
                } else {
                    SipReply::new(Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST)
                }
            }
            None => SipReply::new(Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST),
        };

        // the CANCEL has no transaction record carrying a local tag, but its
        // responses still need one
        let local_tag = BytesStr::from(format!("{}.{:x}", self.uid, request.id));

        let mut out = reply::build(&request, Some(&local_tag), reply);
        if let Err(e) = self.endpoint.send_response(&mut out) {
            log::error!("failed to answer CANCEL: {}", e);
        }

        if let Some(idx) = terminate {
            self.respond(idx, SipReply::new(Code::REQUEST_TERMINATED)).await;
        }
    }

    /// Create the transaction for a new request and start it through the
    /// state machine
    async fn uas_start(&mut self, request: IncomingRequest) {
        let method = request.line.method.clone();

        // loop detection applies to initial requests only; an ACK is never
        // answered, so it cannot take part either
        let initial = request.base_headers.to_tag.is_none() && method != Method::ACK;
        let loop_id =
            initial.then(|| loop_fingerprint(self.endpoint.name(), &request.base_headers));

        if let Some(loop_id) = loop_id {
            if self.transactions.iter().any(|t| t.loop_id == Some(loop_id)) {
                log::debug!("request merges with a transaction already in progress, rejecting");

                let local_tag = BytesStr::from(format!("{}.{:x}", self.uid, request.id));

                let mut out = reply::build(
                    &request,
                    Some(&local_tag),
                    SipReply::new(Code::LOOP_DETECTED),
                );
                if let Err(e) = self.endpoint.send_response(&mut out) {
                    log::error!("failed to send 482: {}", e);
                }
                return;
            }
        }

        let id = self.alloc_tsx_id();
        let local_tag = BytesStr::from(format!("{}.{:x}", self.uid, id.0));
        let mut tsx = UasTsx::new(id, Arc::new(request), loop_id, local_tag);

        let config = self.endpoint.config();
        let t1 = config.t1;
        let auto_100 = config.auto_100;
        let non_invite_timeout = config.non_invite_timeout;

        if method == Method::INVITE {
            if !tsx.reliable && auto_100 {
                let mut out = reply::build(&tsx.request, None, SipReply::new(Code::TRYING));

                if let Err(e) = self.endpoint.send_response(&mut out) {
                    log::error!("failed to send 100 Trying: {}", e);

                    let mut out = reply::build(
                        &tsx.request,
                        Some(&tsx.local_tag),
                        SipReply::with_reason(Code::SERVICE_UNAVAILABLE, "Transport Failure"),
                    );
                    let _ = self.endpoint.send_response(&mut out);
                    return;
                }

                tsx.response = Some(out);
                tsx.code = 100;
                tsx.timers.arm(TimerName::Timer100, t1, id, &self.events);
            }

            if let Some(expires) = expires_of(&tsx.request) {
                tsx.timers.arm(TimerName::Expire, expires, id, &self.events);
            }
        } else if method != Method::ACK {
            tsx.timers
                .arm(TimerName::NoInvite, non_invite_timeout, id, &self.events);
        }

        let mut tokens = Vec::new();
        if tsx.request.base_headers.to_tag.is_some() {
            tokens.push(AuthToken::Dialog);
        }

        let idx = self.transactions.len();
        self.transactions.push(tsx);

        self.launch(idx, CallbackArgs::Authorize { tokens });
    }

    /// Issue one application callback through the layer chain.
    ///
    /// The invocation runs detached so the actor stays responsive; its
    /// outcome re-enters as an [`CallEvent::AppReply`] carrying the state it
    /// was issued in. The `app_<kind>` timer bounds it.
    fn launch(&mut self, idx: usize, args: CallbackArgs) {
        let kind = match &args {
            CallbackArgs::Authorize { .. } => CallbackKind::Authorize,
            CallbackArgs::Route { .. } => CallbackKind::Route,
            CallbackArgs::Method { kind } => *kind,
            CallbackArgs::Ack => CallbackKind::Ack,
        };

        let (tsx_id, issued_in, request) = {
            let t = &self.transactions[idx];
            (t.id, t.state, t.request.clone())
        };

        let token = ReplyToken {
            kind,
            tsx: tsx_id,
            issued_in,
            events: self.events.clone(),
        };
        let uas_request = UasRequest { request, token };

        let endpoint = self.endpoint.clone();
        let events = self.events.clone();
        let span = tracing::info_span!("callback", kind = kind.name(), tsx = %tsx_id);

        let chain = tokio::spawn(
            async move { app::run_chain(&endpoint, &uas_request, args).await }.instrument(span),
        );
        let bridge = chain.abort_handle();

        tokio::spawn(async move {
            let reply = match chain.await {
                Ok(BridgeReply::Deferred) => return,
                Ok(reply) => reply,
                Err(e) if e.is_cancelled() => return,
                Err(_) => {
                    log::error!("application callback panicked");
                    BridgeReply::Failed
                }
            };

            let _ = events.send(CallEvent::AppReply {
                tsx: tsx_id,
                kind,
                issued_in,
                reply,
            });
        });

        let app_timeout = self.endpoint.config().app_timeout;
        let t = &mut self.transactions[idx];
        t.pending = Some(PendingCallback {
            kind,
            issued_in,
            bridge,
        });
        t.timers
            .arm(TimerName::App(kind), app_timeout, tsx_id, &self.events);
    }

    /// Deliver a callback outcome into the state machine.
    ///
    /// The reply is only accepted if the transaction still has the matching
    /// callback outstanding and sits in the state it was issued in; anything
    /// else is a late reply and gets discarded.
    pub(super) async fn app_reply(
        &mut self,
        tsx: TsxId,
        kind: CallbackKind,
        issued_in: TsxState,
        reply: BridgeReply,
    ) {
        let Some(idx) = self.find(tsx) else {
            log::debug!("reply for unknown transaction {}, discarded", tsx);
            return;
        };

        {
            let t = &self.transactions[idx];
            let valid =
                t.pending.as_ref().is_some_and(|p| p.kind == kind) && t.state == issued_in;

            if !valid {
                log::debug!(
                    "transaction {} moved on since the {} callback was issued, reply discarded",
                    tsx,
                    kind.name()
                );
                return;
            }
        }

        match reply {
            BridgeReply::Deferred => {}
            BridgeReply::Failed => {
                self.clear_pending(idx);
                self.respond(
                    idx,
                    SipReply::with_reason(Code::SERVER_INTERNAL_ERROR, "SipApp Error"),
                )
                .await;
            }
            BridgeReply::AckDone => {
                self.clear_pending(idx);
                self.finish(idx);
            }
            BridgeReply::Decision(decision) => match (kind, decision) {
                (CallbackKind::Authorize, Decision::Authorize(outcome)) => {
                    self.authorized(idx, outcome).await
                }
                (CallbackKind::Route, Decision::Route(decision)) => {
                    self.routed(idx, decision).await
                }
                (kind, Decision::Method(reply))
                    if !matches!(
                        kind,
                        CallbackKind::Authorize | CallbackKind::Route | CallbackKind::Ack
                    ) =>
                {
                    self.method_reply(idx, kind, reply).await
                }
                _ => {
                    log::warn!(
                        "application delivered a mismatching decision for the {} callback",
                        kind.name()
                    );
                    self.clear_pending(idx);
                    self.respond(
                        idx,
                        SipReply::with_reason(Code::SERVER_INTERNAL_ERROR, "Invalid SipApp reply"),
                    )
                    .await;
                }
            },
        }
    }

    async fn authorized(&mut self, idx: usize, outcome: AuthorizeOutcome) {
        self.clear_pending(idx);

        match outcome {
            AuthorizeOutcome::Ok => {
                let args = {
                    let t = &mut self.transactions[idx];
                    t.state = TsxState::Route;

                    CallbackArgs::Route {
                        scheme: t.ruri.scheme,
                        user: t.ruri.user.clone(),
                        domain: t.ruri.host.clone(),
                    }
                };

                self.launch(idx, args);
            }
            AuthorizeOutcome::Forbidden => {
                self.respond(idx, SipReply::new(Code::FORBIDDEN)).await;
            }
            AuthorizeOutcome::Authenticate { realm } => {
                let reply = self.challenge(Code::UNAUTHORIZED, Name::WWW_AUTHENTICATE, realm);
                self.respond(idx, reply).await;
            }
            AuthorizeOutcome::ProxyAuthenticate { realm } => {
                let reply = self.challenge(
                    Code::PROXY_AUTHENTICATION_REQUIRED,
                    Name::PROXY_AUTHENTICATE,
                    realm,
                );
                self.respond(idx, reply).await;
            }
            AuthorizeOutcome::Reply(reply) => {
                self.respond(idx, ensure_final(reply)).await;
            }
            AuthorizeOutcome::Defer => {}
        }
    }

    fn challenge(&self, code: Code, header: Name, realm: Option<BytesStr>) -> SipReply {
        let realm = realm.unwrap_or_else(|| self.endpoint.name().clone());

        let value = match self.endpoint.digest() {
            Some(digest) => digest.challenge(&realm),
            None => BytesStr::from(format!("Digest realm=\"{}\"", realm)),
        };

        SipReply::new(code).header(header, value)
    }

    async fn routed(&mut self, idx: usize, decision: RouteDecision) {
        self.clear_pending(idx);

        match decision {
            RouteDecision::Respond { reply, opts } => {
                self.set_stateless(idx, &opts);
                self.respond(idx, ensure_final(reply)).await;
            }
            RouteDecision::Process { opts } => self.do_process(idx, opts).await,
            RouteDecision::Proxy { targets, opts } => {
                let upstream = self.upstream(idx);
                let request = self.transactions[idx].request.clone();

                let outcome = self
                    .endpoint
                    .proxy()
                    .proxy(&request, &targets, &opts, upstream)
                    .await;

                self.proxy_outcome(idx, outcome).await;
            }
            RouteDecision::StrictProxy { opts } => {
                // Mirror legacy behavior unless configured otherwise: the
                // strict hop is forwarded stateless.
                if !self.endpoint.config().strict_route_all {
                    let t = &mut self.transactions[idx];
                    if t.method != Method::INVITE {
                        t.stateless = true;
                    }
                }

                let upstream = self.upstream(idx);
                let request = self.transactions[idx].request.clone();

                let outcome = self
                    .endpoint
                    .proxy()
                    .strict_proxy(&request, &opts, upstream)
                    .await;

                self.proxy_outcome(idx, outcome).await;
            }
            RouteDecision::Defer => {}
        }
    }

    async fn do_process(&mut self, idx: usize, opts: RouteOpts) {
        self.set_stateless(idx, &opts);

        let (method, request, in_dialog, stateless, tsx_id, local_tag) = {
            let t = &self.transactions[idx];
            (
                t.method.clone(),
                t.request.clone(),
                t.request.base_headers.to_tag.is_some(),
                t.stateless,
                t.id,
                t.local_tag.clone(),
            )
        };

        // a CANCEL can never be processed locally
        if method == Method::CANCEL {
            self.respond(idx, SipReply::new(Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST))
                .await;
            return;
        }

        if method != Method::ACK {
            let unsupported = self.unsupported_extensions(&request);

            if !unsupported.is_empty() {
                let mut tokens = String::new();
                for token in &unsupported {
                    if !tokens.is_empty() {
                        tokens.push(',');
                    }
                    tokens.push_str(token);
                }

                let reply = SipReply::new(Code::BAD_EXTENSION)
                    .header(Name::UNSUPPORTED, tokens.as_str())
                    .body(tokens.into_bytes());

                self.respond(idx, reply).await;
                return;
            }
        }

        let skip_dialog = stateless || (method == Method::ACK && !in_dialog);

        if !skip_dialog {
            let associated = self
                .endpoint
                .dialogs()
                .dialog_request(&request, &local_tag)
                .await;

            match associated {
                Ok(dialog) => {
                    log::debug!("transaction {} associated with dialog {:?}", tsx_id, dialog)
                }
                Err(e) if method == Method::ACK => {
                    log::info!("ACK could not be associated with a dialog ({}), dropped", e);
                    self.finish(idx);
                    return;
                }
                Err(e) => {
                    log::debug!("dialog conflict for transaction {}: {}", tsx_id, e);
                    self.respond(idx, dialog_error_reply(e)).await;
                    return;
                }
            }
        }

        let Some(kind) = CallbackKind::of_method(&method, in_dialog) else {
            let reply = SipReply::new(Code::METHOD_NOT_ALLOWED)
                .header(Name::ALLOW, self.endpoint.allow_header());
            self.respond(idx, reply).await;
            return;
        };

        match kind {
            CallbackKind::Ack => {
                self.transactions[idx].state = TsxState::Ack;
                self.launch(idx, CallbackArgs::Ack);
            }
            CallbackKind::Invite | CallbackKind::ReInvite => {
                let timer_c = self.endpoint.config().timer_c;

                let t = &mut self.transactions[idx];
                t.state = TsxState::InviteProceeding;
                t.timers.arm(TimerName::TimerC, timer_c, tsx_id, &self.events);

                self.launch(idx, CallbackArgs::Method { kind });
            }
            _ => {
                self.transactions[idx].state = TsxState::Trying;
                self.launch(idx, CallbackArgs::Method { kind });
            }
        }
    }

    async fn method_reply(&mut self, idx: usize, kind: CallbackKind, reply: MethodReply) {
        match reply {
            MethodReply::Reply(reply) if !reply.code.is_final() => {
                // provisional replies don't advance the state machine and
                // leave the callback outstanding for the final one
                if self.transactions[idx].state == TsxState::InviteProceeding {
                    let tsx_id = self.transactions[idx].id;
                    self.respond(idx, reply).await;

                    // a provisional shows the application is alive; from here
                    // on timer C governs the proceeding state, not the
                    // callback deadline
                    if let Some(idx) = self.find(tsx_id) {
                        self.transactions[idx].timers.cancel(TimerName::App(kind));
                    }
                } else {
                    log::debug!(
                        "dropping provisional {} response outside invite processing",
                        reply.code
                    );
                }
            }
            MethodReply::Reply(reply) => {
                self.clear_pending(idx);
                self.respond(idx, reply).await;
            }
            MethodReply::Default => {
                self.clear_pending(idx);

                match self.default_reply(kind) {
                    Some(reply) => self.respond(idx, reply).await,
                    None => self.finish(idx),
                }
            }
            MethodReply::NoReply => {}
        }
    }

    /// The `not_exported` defaults: what the stack answers when the
    /// application has no handler for a method
    fn default_reply(&self, kind: CallbackKind) -> Option<SipReply> {
        let reply = match kind {
            CallbackKind::Options => {
                let mut reply =
                    SipReply::new(Code::OK).header(Name::ALLOW, self.endpoint.allow_header());

                if let Some(supported) = self.endpoint.supported_header() {
                    reply = reply.header(Name::SUPPORTED, supported);
                }

                reply
            }
            CallbackKind::Bye | CallbackKind::Prack | CallbackKind::Update => {
                SipReply::new(Code::OK)
            }
            CallbackKind::Invite | CallbackKind::ReInvite => SipReply::new(Code::DECLINE),
            CallbackKind::Ack => return None,
            _ => SipReply::new(Code::METHOD_NOT_ALLOWED)
                .header(Name::ALLOW, self.endpoint.allow_header()),
        };

        Some(reply)
    }

    pub(super) async fn timer_fired(&mut self, tsx: TsxId, name: TimerName) {
        let Some(idx) = self.find(tsx) else {
            log::trace!("timer {} fired for finished transaction {}, dropped", name, tsx);
            return;
        };

        if !self.transactions[idx].timers.fired(name) {
            // cancellation raced the event queue
            return;
        }

        match name {
            TimerName::Timer100 => {
                if self.transactions[idx].code > 100 {
                    return;
                }

                if let Some(response) = &mut self.transactions[idx].response {
                    if let Err(e) = self.endpoint.send_response(response) {
                        log::warn!("failed to re-send 100 Trying: {}", e);
                    }
                }

                let t1 = self.endpoint.config().t1;
                self.transactions[idx]
                    .timers
                    .arm(TimerName::Timer100, t1, tsx, &self.events);
            }
            TimerName::TimerC | TimerName::NoInvite => {
                log::debug!("transaction {} timed out waiting for processing", tsx);
                self.respond(idx, SipReply::new(Code::REQUEST_TIMEOUT)).await;
            }
            TimerName::Expire => {
                self.respond(idx, SipReply::new(Code::REQUEST_TERMINATED))
                    .await;
            }
            TimerName::TimerH | TimerName::TimerI | TimerName::TimerJ => self.finish(idx),
            TimerName::App(kind) => {
                let outstanding = self.transactions[idx]
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.kind == kind);

                if !outstanding {
                    return;
                }

                log::warn!("application callback {} timed out", kind.name());
                self.clear_pending(idx);

                if kind == CallbackKind::Ack {
                    self.finish(idx);
                } else {
                    self.respond(
                        idx,
                        SipReply::with_reason(Code::SERVER_INTERNAL_ERROR, "SipApp Error"),
                    )
                    .await;
                }
            }
        }
    }

    /// Best final response of a forked request, forwarded upstream once
    pub(super) async fn fork_reply(&mut self, tsx: TsxId, reply: SipReply) {
        let Some(idx) = self.find(tsx) else {
            log::debug!("fork reply for finished transaction {}, discarded", tsx);
            return;
        };

        if !self.transactions[idx].forked {
            log::debug!("fork reply for transaction {} that was never forked, discarded", tsx);
            return;
        }

        self.respond(idx, ensure_final(reply)).await;
    }

    async fn proxy_outcome(&mut self, idx: usize, outcome: ProxyOutcome) {
        match outcome {
            ProxyOutcome::Stateless => {
                let t = &mut self.transactions[idx];
                t.stateless = true;
                log::debug!("transaction {} forwarded statelessly", t.id);
                self.finish(idx);
            }
            ProxyOutcome::Forked => {
                let timer_c = self.endpoint.config().timer_c;

                let t = &mut self.transactions[idx];
                t.forked = true;

                if t.method == Method::INVITE {
                    let id = t.id;
                    t.state = TsxState::InviteProceeding;
                    t.timers.arm(TimerName::TimerC, timer_c, id, &self.events);
                } else {
                    t.state = TsxState::Trying;
                }
            }
            ProxyOutcome::Reply(reply) => self.respond(idx, ensure_final(reply)).await,
        }
    }

    fn upstream(&self, idx: usize) -> ForkUpstream {
        ForkUpstream {
            tsx: self.transactions[idx].id,
            events: self.events.clone(),
        }
    }

    fn set_stateless(&mut self, idx: usize, opts: &RouteOpts) {
        if !opts.stateless {
            return;
        }

        let t = &mut self.transactions[idx];

        if t.method == Method::INVITE {
            log::warn!("stateless mode is not valid for INVITE, staying stateful");
        } else {
            t.stateless = true;
        }
    }

    fn unsupported_extensions(&self, request: &IncomingRequest) -> Vec<BytesStr> {
        let mut unsupported: Vec<BytesStr> = Vec::new();

        for value in request.headers.get_all(&Name::REQUIRE) {
            for token in value.split(',') {
                let token = token.trim();

                if token.is_empty() || self.endpoint.supports(token) {
                    continue;
                }

                if unsupported.iter().any(|t| t.eq_ignore_ascii_case(token)) {
                    continue;
                }

                unsupported.push(BytesStr::from(token));
            }
        }

        unsupported
    }

    fn clear_pending(&mut self, idx: usize) {
        let t = &mut self.transactions[idx];

        if let Some(pending) = t.pending.take() {
            pending.bridge.abort();
            t.timers.cancel(TimerName::App(pending.kind));
        }
    }

    /// Send a response for the transaction.
    ///
    /// This is the single place final responses leave through, which is what
    /// keeps them at-most-once per transaction.
    async fn respond(&mut self, idx: usize, reply: SipReply) {
        if self.transactions[idx].method == Method::ACK {
            log::debug!("suppressing response for ACK transaction");
            self.finish(idx);
            return;
        }

        if self.transactions[idx].code >= 200 {
            log::debug!(
                "transaction already answered, dropping {} response",
                reply.code
            );
            return;
        }

        let code = reply.code;

        let mut out = {
            let t = &self.transactions[idx];
            let tag = (code != Code::TRYING).then(|| t.local_tag.clone());
            reply::build(&t.request, tag.as_ref(), reply)
        };

        if let Err(e) = self.endpoint.send_response(&mut out) {
            log::error!("failed to send {} response: {}", code, e);
            self.transport_failure(idx).await;
            return;
        }

        let t = &mut self.transactions[idx];
        t.response = Some(out);
        t.code = code.into_u16();

        if !code.is_final() {
            if code != Code::TRYING {
                t.timers.cancel(TimerName::Timer100);
            }
            return;
        }

        if let Some(pending) = t.pending.take() {
            pending.bridge.abort();
            t.timers.cancel(TimerName::App(pending.kind));
        }

        t.timers.cancel(TimerName::Timer100);
        t.timers.cancel(TimerName::TimerC);
        t.timers.cancel(TimerName::NoInvite);
        t.timers.cancel(TimerName::Expire);
        t.state = TsxState::Completed;

        if t.stateless {
            self.finish(idx);
            return;
        }

        let t1 = self.endpoint.config().t1;
        let t = &mut self.transactions[idx];
        let id = t.id;

        if t.method == Method::INVITE {
            if code.kind() == CodeKind::Success {
                // 2xx retransmissions and the matching ACK are owned by the
                // dialog layer, the transaction is done
                self.finish(idx);
            } else {
                t.timers.arm(TimerName::TimerH, t1 * 64, id, &self.events);
            }
        } else if t.reliable {
            self.finish(idx);
        } else {
            t.timers.arm(TimerName::TimerJ, t1 * 64, id, &self.events);
        }
    }

    async fn transport_failure(&mut self, idx: usize) {
        let mut out = {
            let t = &self.transactions[idx];
            reply::build(
                &t.request,
                Some(&t.local_tag),
                SipReply::with_reason(Code::SERVICE_UNAVAILABLE, "Transport Failure"),
            )
        };

        let sent = self.endpoint.send_response(&mut out).is_ok();

        let t = &mut self.transactions[idx];
        if sent {
            t.code = 503;
            t.response = Some(out);
        }

        self.finish(idx);
    }

    /// Destroy the transaction; all timers are cancelled and a still
    /// outstanding callback is aborted
    fn finish(&mut self, idx: usize) {
        let mut t = self.transactions.remove(idx);

        if let Some(pending) = t.pending.take() {
            pending.bridge.abort();
        }

        t.timers.cancel_all();
        t.state = TsxState::Finished;

        log::debug!(
            "transaction {} finished with code {} after {:?}",
            t.id,
            t.code,
            t.start.elapsed()
        );
    }

    /// A request re-arrived inside a live transaction: trigger the stored
    /// response without touching any state
    fn retransmission(&mut self, idx: usize) {
        let id = self.transactions[idx].id;

        match &mut self.transactions[idx].response {
            Some(response) => {
                log::debug!("retransmission hit transaction {}, re-sending latest response", id);

                if let Err(e) = self.endpoint.send_response(response) {
                    log::warn!("failed to re-send response: {}", e);
                }
            }
            None => {
                log::trace!("retransmission hit transaction {} before any response, ignored", id);
            }
        }
    }

    /// Transaction-level ACK for a negative INVITE final response
    fn absorb_ack(&mut self, idx: usize) {
        let t = &mut self.transactions[idx];

        match t.state {
            TsxState::Completed if t.code >= 300 => {
                let id = t.id;
                t.timers.cancel(TimerName::TimerH);
                t.timers.arm(TimerName::TimerI, consts::T4, id, &self.events);
            }
            state => {
                log::debug!("ACK for transaction {} in state {:?}, ignored", t.id, state);
            }
        }
    }
}

fn ensure_final(reply: SipReply) -> SipReply {
    if reply.code.is_final() {
        reply
    } else {
        log::warn!(
            "application produced a non-final {} response where a final one was required",
            reply.code
        );
        SipReply::with_reason(Code::SERVER_INTERNAL_ERROR, "Invalid SipApp reply")
    }
}

fn dialog_error_reply(error: DialogError) -> SipReply {
    match error {
        DialogError::ProceedingUac => SipReply::new(Code::REQUEST_PENDING),
        DialogError::ProceedingUas => {
            let retry_after = rand::rng().random_range(0..10u32);

            SipReply::with_reason(Code::SERVER_INTERNAL_ERROR, "Processing Previous INVITE")
                .header(Name::RETRY_AFTER, retry_after.to_string())
        }
        DialogError::OldCSeq => {
            SipReply::with_reason(Code::SERVER_INTERNAL_ERROR, "Old CSeq in Dialog")
        }
        DialogError::NoDialog => SipReply::new(Code::CALL_OR_TRANSACTION_DOES_NOT_EXIST),
    }
}

/// Fingerprint over the identity of an initial request, RFC 3261 16.3 style
fn loop_fingerprint(app: &BytesStr, base: &BaseHeaders) -> u64 {
    let mut hasher = DefaultHasher::new();

    app.hash(&mut hasher);
    base.call_id.hash(&mut hasher);
    base.from_tag.hash(&mut hasher);
    base.cseq.cseq.hash(&mut hasher);
    base.cseq.method.hash(&mut hasher);

    hasher.finish()
}

fn expires_of(request: &IncomingRequest) -> Option<Duration> {
    let value = request.headers.get(&Name::EXPIRES)?;
    let secs = value.trim().parse::<u64>().ok()?;

    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::CSeq;

    fn base(call_id: &str, from_tag: &str, cseq: u32, method: Method) -> BaseHeaders {
        BaseHeaders {
            via: "SIP/2.0/UDP host;branch=z9hG4bKtest".into(),
            from: "<sip:a@example.org>;tag=abc".into(),
            from_tag: from_tag.into(),
            to: "<sip:b@example.org>".into(),
            to_tag: None,
            call_id: call_id.into(),
            cseq: CSeq::new(cseq, method),
            branch: "z9hG4bKtest".into(),
        }
    }

    #[test]
    fn loop_fingerprint_is_stable() {
        let app = BytesStr::from_static("svc");

        let a = loop_fingerprint(&app, &base("c1", "t1", 1, Method::INVITE));
        let b = loop_fingerprint(&app, &base("c1", "t1", 1, Method::INVITE));

        assert_eq!(a, b);
    }

    #[test]
    fn loop_fingerprint_varies_with_identity() {
        let app = BytesStr::from_static("svc");
        let reference = loop_fingerprint(&app, &base("c1", "t1", 1, Method::INVITE));

        assert_ne!(
            reference,
            loop_fingerprint(&app, &base("c1", "t1", 2, Method::INVITE))
        );
        assert_ne!(
            reference,
            loop_fingerprint(&app, &base("c1", "t2", 1, Method::INVITE))
        );
        assert_ne!(
            reference,
            loop_fingerprint(&app, &base("c2", "t1", 1, Method::INVITE))
        );
        assert_ne!(
            reference,
            loop_fingerprint(&app, &base("c1", "t1", 1, Method::MESSAGE))
        );
    }
}

//! End-to-end UAS scenarios driven through a capturing mock transport

mod common;

use rill_sip_core::{
    AuthToken, AuthorizeOutcome, CallbackArgs, CallbackKind, Control, Decision, Endpoint, Layer,
    MethodReply, ReplyToken, RouteDecision, SipApp, SipReply, UasRequest,
};
use sip_types::{Code, Method, Name};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn options_is_answered_with_allow() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").build();

    endpoint.receive(common::request(&tp, Method::OPTIONS, "z9hG4bK-o1", "opt-1", 1));

    let frame = rx.recv().await.unwrap();
    assert_eq!(common::status_of(&frame), 200);

    let allow = common::header_of(&frame, "Allow").expect("200 carries Allow");
    assert!(allow.contains("OPTIONS"));
    assert!(allow.contains("INVITE"));
}

/// Application for the INVITE scenario: 180 and 200 delivered asynchronously
/// through the reply token
struct RingingApp;

#[async_trait::async_trait]
impl SipApp for RingingApp {
    async fn invite(&self, request: &UasRequest) -> MethodReply {
        let token = request.reply_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            token
                .clone()
                .reply(SipReply::new(Code::RINGING))
                .expect("transaction alive");

            tokio::time::sleep(Duration::from_millis(300)).await;
            token.reply(SipReply::new(Code::OK)).expect("transaction alive");
        });

        MethodReply::NoReply
    }
}

#[tokio::test(start_paused = true)]
async fn invite_trying_ringing_ok() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(RingingApp).build();

    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-i1", "inv-1", 1));

    // the automatic 100 goes out first on unreliable transports
    assert_eq!(common::recv_status(&mut rx).await, 100);

    // skip 100 re-sends until the application's ringing arrives
    let status = loop {
        let status = common::recv_status(&mut rx).await;
        if status != 100 {
            break status;
        }
    };
    assert_eq!(status, 180);

    assert_eq!(common::recv_status(&mut rx).await, 200);

    // timer C was cancelled by the final response: no 408 ever shows up
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(rx.try_recv().is_err());
}

/// Rings quickly but takes its time to pick up: the final response arrives
/// well past the callback deadline, still inside the timer C window
struct SlowPickupApp;

#[async_trait::async_trait]
impl SipApp for SlowPickupApp {
    async fn invite(&self, request: &UasRequest) -> MethodReply {
        let token = request.reply_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token
                .clone()
                .reply(SipReply::new(Code::RINGING))
                .expect("transaction alive");

            tokio::time::sleep(Duration::from_secs(40)).await;
            token.reply(SipReply::new(Code::OK)).expect("transaction alive");
        });

        MethodReply::NoReply
    }
}

#[tokio::test(start_paused = true)]
async fn provisional_reply_disarms_the_callback_deadline() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(SlowPickupApp).build();

    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-i2", "inv-2", 1));

    assert_eq!(common::recv_status(&mut rx).await, 100);
    assert_eq!(common::recv_status(&mut rx).await, 180);

    // ringing for longer than the callback deadline does not abort the
    // transaction; the eventual 200 goes through
    assert_eq!(common::recv_status(&mut rx).await, 200);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn loop_is_detected_on_second_initial_invite() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(SilentInvite).build();

    // same From-tag, Call-ID and CSeq, but a different branch: this is not a
    // retransmission but a merged request
    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-l1", "loop-1", 7));
    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-l2", "loop-1", 7));

    assert_eq!(common::recv_status(&mut rx).await, 100);
    assert_eq!(common::recv_status(&mut rx).await, 482);
}

/// Application that never answers its INVITEs
struct SilentInvite;

#[async_trait::async_trait]
impl SipApp for SilentInvite {
    async fn invite(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::NoReply
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_require_yields_420_with_tokens() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").build();

    let mut request = common::request(&tp, Method::MESSAGE, "z9hG4bK-r1", "req-1", 1);
    request.headers.insert(Name::REQUIRE, "100rel, foo");

    endpoint.receive(request);

    let frame = rx.recv().await.unwrap();
    assert_eq!(common::status_of(&frame), 420);
    assert_eq!(
        common::header_of(&frame, "Unsupported").as_deref(),
        Some("100rel,foo")
    );
    assert_eq!(common::body_of(&frame), "100rel,foo");
}

#[tokio::test(start_paused = true)]
async fn supported_extensions_are_not_listed_in_420() {
    let (tp, mut rx) = common::transport(false);

    let mut builder = Endpoint::builder("svc");
    builder.add_supported("100rel");
    let endpoint = builder.build();

    let mut request = common::request(&tp, Method::MESSAGE, "z9hG4bK-r2", "req-2", 1);
    request.headers.insert(Name::REQUIRE, "100rel, foo");

    endpoint.receive(request);

    let frame = rx.recv().await.unwrap();
    assert_eq!(common::status_of(&frame), 420);
    assert_eq!(common::header_of(&frame, "Unsupported").as_deref(), Some("foo"));
}

#[tokio::test(start_paused = true)]
async fn stateful_retransmission_repeats_the_response() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").build();

    endpoint.receive(common::request(&tp, Method::OPTIONS, "z9hG4bK-rt1", "rtx-1", 1));
    let first = rx.recv().await.unwrap();
    assert_eq!(common::status_of(&first), 200);

    // same branch, new message id: a retransmission hitting the completed
    // transaction inside its linger window
    endpoint.receive(common::request(&tp, Method::OPTIONS, "z9hG4bK-rt1", "rtx-1", 1));
    let second = rx.recv().await.unwrap();

    assert_eq!(first, second);
}

/// Route callback answering with a bare reply, which means stateless
struct BareReplyRoute;

#[async_trait::async_trait]
impl SipApp for BareReplyRoute {
    async fn route(
        &self,
        _scheme: sip_types::Scheme,
        _user: Option<&bytesstr::BytesStr>,
        _domain: &bytesstr::BytesStr,
        _request: &UasRequest,
    ) -> RouteDecision {
        SipReply::new(Code::OK).into()
    }
}

#[tokio::test(start_paused = true)]
async fn stateless_transaction_holds_no_timers() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(BareReplyRoute).build();

    endpoint.receive(common::request(&tp, Method::MESSAGE, "z9hG4bK-s1", "stl-1", 1));
    assert_eq!(common::recv_status(&mut rx).await, 200);

    // were any timer still armed it would fire within this window
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(rx.try_recv().is_err());
}

/// Route callback that defers and parks its token for the test to misuse
struct DeferringRoute {
    token: Arc<Mutex<Option<ReplyToken>>>,
}

#[async_trait::async_trait]
impl SipApp for DeferringRoute {
    async fn route(
        &self,
        _scheme: sip_types::Scheme,
        _user: Option<&bytesstr::BytesStr>,
        _domain: &bytesstr::BytesStr,
        request: &UasRequest,
    ) -> RouteDecision {
        *self.token.lock().unwrap() = Some(request.reply_token());
        RouteDecision::Defer
    }
}

#[tokio::test(start_paused = true)]
async fn late_reply_after_timeout_is_discarded() {
    let token = Arc::new(Mutex::new(None));

    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc")
        .set_app(DeferringRoute {
            token: token.clone(),
        })
        .build();

    endpoint.receive(common::request(&tp, Method::MESSAGE, "z9hG4bK-d1", "late-1", 1));

    // nothing is answered until the callback deadline aborts the transaction
    // with an internal error
    assert_eq!(common::recv_status(&mut rx).await, 500);

    // the deferred decision arrives after the transaction moved on
    let token = token.lock().unwrap().take().expect("route was invoked");
    let _ = token.route(RouteDecision::process());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}

/// Authorization outcomes map to their responses
struct RejectingApp;

#[async_trait::async_trait]
impl SipApp for RejectingApp {
    async fn authorize(&self, _tokens: &[AuthToken], _request: &UasRequest) -> AuthorizeOutcome {
        AuthorizeOutcome::Forbidden
    }
}

#[tokio::test(start_paused = true)]
async fn authorize_false_yields_403() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(RejectingApp).build();

    endpoint.receive(common::request(&tp, Method::MESSAGE, "z9hG4bK-a1", "auth-1", 1));

    assert_eq!(common::recv_status(&mut rx).await, 403);
}

struct ChallengingApp;

#[async_trait::async_trait]
impl SipApp for ChallengingApp {
    async fn authorize(&self, _tokens: &[AuthToken], _request: &UasRequest) -> AuthorizeOutcome {
        AuthorizeOutcome::Authenticate {
            realm: Some("rill.example".into()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn authorize_challenge_yields_401() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(ChallengingApp).build();

    endpoint.receive(common::request(&tp, Method::MESSAGE, "z9hG4bK-a2", "auth-2", 1));

    let frame = rx.recv().await.unwrap();
    assert_eq!(common::status_of(&frame), 401);

    let challenge = common::header_of(&frame, "WWW-Authenticate").expect("401 challenges");
    assert!(challenge.contains("rill.example"));
}

/// Layer that short-circuits every MESSAGE callback before the application
struct MessageGate;

#[async_trait::async_trait]
impl Layer for MessageGate {
    fn name(&self) -> &'static str {
        "message-gate"
    }

    async fn handle(
        &self,
        _endpoint: &Endpoint,
        _request: &UasRequest,
        args: CallbackArgs,
    ) -> Control {
        if let CallbackArgs::Method {
            kind: CallbackKind::Message,
        } = args
        {
            return Control::Stop(Decision::Method(MethodReply::Reply(SipReply::new(
                Code::FORBIDDEN,
            ))));
        }

        Control::Continue(args)
    }
}

#[tokio::test(start_paused = true)]
async fn layer_short_circuits_the_application() {
    let (tp, mut rx) = common::transport(false);

    let mut builder = Endpoint::builder("svc");
    builder.add_layer(MessageGate);
    let endpoint = builder.build();

    // the layer is reachable through the endpoint
    assert_eq!(endpoint.layer::<MessageGate>().name(), "message-gate");

    endpoint.receive(common::request(&tp, Method::MESSAGE, "z9hG4bK-g1", "gate-1", 1));
    assert_eq!(common::recv_status(&mut rx).await, 403);

    // other methods pass the gate untouched
    endpoint.receive(common::request(&tp, Method::OPTIONS, "z9hG4bK-g2", "gate-2", 1));
    assert_eq!(common::recv_status(&mut rx).await, 200);
}

#[tokio::test(start_paused = true)]
async fn invite_without_handler_is_declined() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").build();

    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-n1", "dfl-1", 1));

    assert_eq!(common::recv_status(&mut rx).await, 100);
    assert_eq!(common::recv_status(&mut rx).await, 603);
}

#[tokio::test(start_paused = true)]
async fn unknown_method_yields_405() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").build();

    endpoint.receive(common::request(
        &tp,
        Method::from("STORE"),
        "z9hG4bK-u1",
        "unk-1",
        1,
    ));

    let frame = rx.recv().await.unwrap();
    assert_eq!(common::status_of(&frame), 405);
    assert!(common::header_of(&frame, "Allow").is_some());
}

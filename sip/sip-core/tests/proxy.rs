//! Route decisions that hand the request to the proxy/fork engine

mod common;

use bytesstr::BytesStr;
use rill_sip_core::{
    Endpoint, ForkUpstream, IncomingRequest, ProxyHook, ProxyOutcome, RouteDecision, RouteOpts,
    SipApp, SipReply, UasRequest,
};
use sip_types::{Code, Method, Scheme, SipUri};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Route everything to two downstream targets
struct ForkingRoute;

#[async_trait::async_trait]
impl SipApp for ForkingRoute {
    async fn route(
        &self,
        _scheme: Scheme,
        _user: Option<&BytesStr>,
        _domain: &BytesStr,
        _request: &UasRequest,
    ) -> RouteDecision {
        RouteDecision::proxy(vec![
            SipUri::new("a.example.org").with_user("u1"),
            SipUri::new("b.example.org").with_user("u2"),
        ])
    }
}

/// Proxy engine stub that forks and parks the upstream handle for the test
#[derive(Debug, Default)]
struct ForkingProxy {
    targets_seen: Arc<Mutex<usize>>,
    upstream: Arc<Mutex<Option<ForkUpstream>>>,
}

#[async_trait::async_trait]
impl ProxyHook for ForkingProxy {
    async fn proxy(
        &self,
        _request: &IncomingRequest,
        targets: &[SipUri],
        _opts: &RouteOpts,
        upstream: ForkUpstream,
    ) -> ProxyOutcome {
        *self.targets_seen.lock().unwrap() = targets.len();
        *self.upstream.lock().unwrap() = Some(upstream);

        ProxyOutcome::Forked
    }
}

#[tokio::test(start_paused = true)]
async fn forked_invite_forwards_the_best_response_once() {
    let targets_seen = Arc::new(Mutex::new(0));
    let upstream = Arc::new(Mutex::new(None));

    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc")
        .set_app(ForkingRoute)
        .set_proxy_hook(ForkingProxy {
            targets_seen: targets_seen.clone(),
            upstream: upstream.clone(),
        })
        .build();

    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-f1", "frk-1", 1));
    assert_eq!(common::recv_status(&mut rx).await, 100);

    // give the actor a chance to run the route callback and the proxy hook
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(*targets_seen.lock().unwrap(), 2);

    let upstream = upstream.lock().unwrap().take().expect("request was forked");
    upstream.answer(SipReply::new(Code::OK)).unwrap();

    assert_eq!(common::recv_status(&mut rx).await, 200);

    // exactly one upstream forward: nothing else ever leaves
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(rx.try_recv().is_err());
}

/// Proxy engine stub that claims stateless forwarding
#[derive(Debug, Default)]
struct StatelessProxy;

#[async_trait::async_trait]
impl ProxyHook for StatelessProxy {
    async fn proxy(
        &self,
        _request: &IncomingRequest,
        _targets: &[SipUri],
        _opts: &RouteOpts,
        _upstream: ForkUpstream,
    ) -> ProxyOutcome {
        ProxyOutcome::Stateless
    }
}

#[tokio::test(start_paused = true)]
async fn stateless_proxy_terminates_without_response_or_timers() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc")
        .set_app(ForkingRoute)
        .set_proxy_hook(StatelessProxy)
        .build();

    endpoint.receive(common::request(&tp, Method::MESSAGE, "z9hG4bK-f2", "frk-2", 1));

    // forwarding is the proxy engine's business; the core stays silent and
    // holds no timer that could fire later
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn proxy_reply_outcome_is_answered_locally() {
    let (tp, mut rx) = common::transport(false);

    // no proxy hook attached: the stub answers 500 locally
    let endpoint = Endpoint::builder("svc").set_app(ForkingRoute).build();

    endpoint.receive(common::request(&tp, Method::MESSAGE, "z9hG4bK-f3", "frk-3", 1));

    assert_eq!(common::recv_status(&mut rx).await, 500);
}

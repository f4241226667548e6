//! CANCEL matching against the INVITE transaction it targets

mod common;

use rill_sip_core::{Endpoint, MethodReply, SipApp, UasRequest};
use sip_types::Method;

/// Application that never answers its INVITEs, keeping them cancellable
struct SilentInvite;

#[async_trait::async_trait]
impl SipApp for SilentInvite {
    async fn invite(&self, _request: &UasRequest) -> MethodReply {
        MethodReply::NoReply
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_terminates_the_invite() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(SilentInvite).build();

    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-c1", "cnc-1", 1));
    assert_eq!(common::recv_status(&mut rx).await, 100);

    endpoint.receive(common::request(&tp, Method::CANCEL, "z9hG4bK-c1", "cnc-1", 1));

    // 200 for the CANCEL first, then the 487 terminating the INVITE
    assert_eq!(common::recv_status(&mut rx).await, 200);
    assert_eq!(common::recv_status(&mut rx).await, 487);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_the_final_response_finds_no_transaction() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(SilentInvite).build();

    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-c2", "cnc-2", 1));
    assert_eq!(common::recv_status(&mut rx).await, 100);

    endpoint.receive(common::request(&tp, Method::CANCEL, "z9hG4bK-c2", "cnc-2", 1));
    assert_eq!(common::recv_status(&mut rx).await, 200);
    assert_eq!(common::recv_status(&mut rx).await, 487);

    // the INVITE now has its final response: a second CANCEL is answered
    // with 481
    endpoint.receive(common::request(&tp, Method::CANCEL, "z9hG4bK-c2", "cnc-2", 1));
    assert_eq!(common::recv_status(&mut rx).await, 481);
}

#[tokio::test(start_paused = true)]
async fn cancel_from_a_different_source_is_rejected() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").set_app(SilentInvite).build();

    endpoint.receive(common::request(&tp, Method::INVITE, "z9hG4bK-c3", "cnc-3", 1));
    assert_eq!(common::recv_status(&mut rx).await, 100);

    let mut cancel = common::request(&tp, Method::CANCEL, "z9hG4bK-c3", "cnc-3", 1);
    cancel.tp_info.source = "203.0.113.99:5060".parse().unwrap();

    endpoint.receive(cancel);
    assert_eq!(common::recv_status(&mut rx).await, 481);

    // the INVITE is untouched and still cancellable from the right source
    endpoint.receive(common::request(&tp, Method::CANCEL, "z9hG4bK-c3", "cnc-3", 1));
    assert_eq!(common::recv_status(&mut rx).await, 200);
    assert_eq!(common::recv_status(&mut rx).await, 487);
}

#[tokio::test(start_paused = true)]
async fn cancel_without_an_invite_finds_no_transaction() {
    let (tp, mut rx) = common::transport(false);
    let endpoint = Endpoint::builder("svc").build();

    endpoint.receive(common::request(&tp, Method::CANCEL, "z9hG4bK-c4", "cnc-4", 1));

    assert_eq!(common::recv_status(&mut rx).await, 481);
}

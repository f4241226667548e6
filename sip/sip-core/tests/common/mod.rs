#![allow(dead_code)]

use bytes::Bytes;
use rill_sip_core::{IncomingRequest, MessageTpInfo, Transport, TpHandle};
use sip_types::{BaseHeaders, CSeq, Headers, Method, RequestLine, SipUri};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Transport that captures every sent frame for the test to inspect
#[derive(Debug)]
pub struct MockTransport {
    reliable: bool,
    frames: mpsc::UnboundedSender<Bytes>,
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        if self.reliable { "TCP" } else { "UDP" }
    }

    fn reliable(&self) -> bool {
        self.reliable
    }

    fn send(&self, buffer: Bytes, _destination: SocketAddr) -> io::Result<()> {
        self.frames
            .send(buffer)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "capture closed"))
    }
}

pub fn transport(reliable: bool) -> (TpHandle, mpsc::UnboundedReceiver<Bytes>) {
    let (frames, receiver) = mpsc::unbounded_channel();

    (
        TpHandle::new(MockTransport { reliable, frames }),
        receiver,
    )
}

pub fn source() -> SocketAddr {
    "198.51.100.7:5060".parse().unwrap()
}

static MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Build a plain incoming request; tests tweak the public fields afterwards
pub fn request(
    transport: &TpHandle,
    method: Method,
    branch: &str,
    call_id: &str,
    cseq: u32,
) -> IncomingRequest {
    IncomingRequest {
        id: MSG_ID.fetch_add(1, Ordering::Relaxed),
        tp_info: MessageTpInfo {
            transport: transport.clone(),
            source: source(),
        },
        line: RequestLine {
            method: method.clone(),
            uri: SipUri::new("example.org").with_user("svc"),
        },
        base_headers: BaseHeaders {
            via: format!("SIP/2.0/UDP client.example.org;branch={branch}").into(),
            from: "<sip:alice@example.org>;tag=42".into(),
            from_tag: "42".into(),
            to: "<sip:svc@example.org>".into(),
            to_tag: None,
            call_id: call_id.into(),
            cseq: CSeq::new(cseq, method),
            branch: branch.into(),
        },
        headers: Headers::new(),
        body: Bytes::new(),
    }
}

pub fn status_of(frame: &Bytes) -> u16 {
    let text = std::str::from_utf8(frame).expect("response is utf-8");
    let mut parts = text.split_whitespace();

    assert_eq!(parts.next(), Some("SIP/2.0"));

    parts
        .next()
        .and_then(|code| code.parse().ok())
        .expect("status code")
}

pub fn header_of(frame: &Bytes, name: &str) -> Option<String> {
    let text = std::str::from_utf8(frame).expect("response is utf-8");
    let head = text.split("\r\n\r\n").next().unwrap_or(text);

    for line in head.split("\r\n").skip(1) {
        if let Some((line_name, value)) = line.split_once(':') {
            if line_name.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }

    None
}

pub fn body_of(frame: &Bytes) -> String {
    let text = std::str::from_utf8(frame).expect("response is utf-8");

    text.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

pub async fn recv_status(receiver: &mut mpsc::UnboundedReceiver<Bytes>) -> u16 {
    let frame = receiver.recv().await.expect("expected a response frame");
    status_of(&frame)
}

use crate::IncomingRequest;
use crate::transport::TpHandle;
use bytes::{Bytes, BytesMut};
use bytesstr::BytesStr;
use sip_types::{Code, Headers, Name, Response, StatusLine};
use std::fmt::Write;
use std::net::SocketAddr;

/// Reply value handed around between the application, the layers and the
/// core before it is bound to a concrete request.
///
/// Only the parts the sender cares about are carried here; the reply engine
/// completes it into a full [`Response`] by copying the transactional headers
/// from the request it answers.
#[derive(Debug, Clone)]
pub struct SipReply {
    pub code: Code,
    pub reason: Option<BytesStr>,
    pub headers: Vec<(Name, BytesStr)>,
    pub body: Bytes,
}

impl SipReply {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            reason: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_reason<R>(code: Code, reason: R) -> Self
    where
        R: Into<BytesStr>,
    {
        Self {
            reason: Some(reason.into()),
            ..Self::new(code)
        }
    }

    /// Attach an additional header to the reply
    pub fn header<N, V>(mut self, name: N, value: V) -> Self
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body<B>(mut self, body: B) -> Self
    where
        B: Into<Bytes>,
    {
        self.body = body.into();
        self
    }
}

impl From<Code> for SipReply {
    fn from(code: Code) -> Self {
        Self::new(code)
    }
}

/// Response bound to a transport and destination, ready to be sent
#[derive(Debug)]
pub struct OutgoingResponse {
    pub msg: Response,
    pub transport: TpHandle,
    pub destination: SocketAddr,

    pub(crate) buffer: Bytes,
}

impl OutgoingResponse {
    pub fn code(&self) -> Code {
        self.msg.line.code
    }

    /// Print the response to its buffer if that has not happened yet
    pub(crate) fn print(&mut self) {
        if !self.buffer.is_empty() {
            return;
        }

        let mut buffer = BytesMut::new();

        self.msg.headers.remove(&Name::CONTENT_LENGTH);
        self.msg
            .headers
            .insert(Name::CONTENT_LENGTH, self.msg.body.len().to_string());

        let _ = write!(buffer, "{}\r\n{}\r\n", self.msg.line, self.msg.headers);

        buffer.extend_from_slice(&self.msg.body);

        self.buffer = buffer.freeze();
    }
}

/// Complete `reply` into a response to `request`.
///
/// Copies Via/From/To/Call-ID/CSeq from the request, inserts `local_tag` into
/// To on everything but `100` when the request carried no tag, and copies the
/// Timestamp header onto a `100`.
pub(crate) fn build(
    request: &IncomingRequest,
    local_tag: Option<&BytesStr>,
    reply: SipReply,
) -> OutgoingResponse {
    let SipReply {
        code,
        reason,
        headers: extra,
        body,
    } = reply;

    let base = &request.base_headers;

    let mut headers = Headers::with_capacity(5 + extra.len());

    headers.insert(Name::VIA, base.via.clone());
    headers.insert(Name::FROM, base.from.clone());

    let needs_tag = code != Code::TRYING && base.to_tag.is_none();
    let to = match local_tag {
        Some(tag) if needs_tag => BytesStr::from(format!("{};tag={}", base.to, tag)),
        _ => base.to.clone(),
    };
    headers.insert(Name::TO, to);

    headers.insert(Name::CALL_ID, base.call_id.clone());
    headers.insert(Name::CSEQ, base.cseq.to_string());

    if code == Code::TRYING {
        request.headers.clone_into(&mut headers, &Name::TIMESTAMP);
    }

    for (name, value) in extra {
        headers.insert(name, value);
    }

    OutgoingResponse {
        msg: Response {
            line: StatusLine { code, reason },
            headers,
            body,
        },
        transport: request.tp_info.transport.clone(),
        destination: request.tp_info.source,
        buffer: Bytes::new(),
    }
}

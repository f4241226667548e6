//! Message lines and the pre-extracted parts every SIP message carries

use crate::code::Code;
use crate::header::Headers;
use crate::method::Method;
use crate::uri::SipUri;
use bytes::Bytes;
use bytesstr::BytesStr;
use std::fmt;

/// First line of a SIP request
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// First line of a SIP response
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub code: Code,
    pub reason: Option<BytesStr>,
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {}", self.code)?;

        if let Some(reason) = &self.reason {
            write!(f, " {}", reason)?;
        } else if let Some(text) = self.code.text() {
            write!(f, " {}", text)?;
        }

        Ok(())
    }
}

/// CSeq header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub cseq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(cseq: u32, method: Method) -> Self {
        Self { cseq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}

/// Pre-extracted identities every message carries.
///
/// `from`/`to`/`via` hold the verbatim header values so responses can copy
/// them unchanged; the tags and the top Via branch are extracted next to them
/// because the transaction layer keys on those.
#[derive(Debug, Clone)]
pub struct BaseHeaders {
    /// Topmost Via header value, verbatim
    pub via: BytesStr,
    /// From header value, verbatim
    pub from: BytesStr,
    pub from_tag: BytesStr,
    /// To header value, verbatim
    pub to: BytesStr,
    pub to_tag: Option<BytesStr>,
    pub call_id: BytesStr,
    pub cseq: CSeq,
    /// `branch` parameter of the top Via, the RFC 3261 transaction key
    pub branch: BytesStr,
}

/// Basic request
#[derive(Debug, Clone)]
pub struct Request {
    pub line: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    /// Create an empty request
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            line: RequestLine { method, uri },
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

/// Basic Response
#[derive(Debug, Clone)]
pub struct Response {
    pub line: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

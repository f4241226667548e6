//! Message types for the rill SIP stack.
//!
//! Requests reach this stack already parsed by the transport frontend; these
//! types carry the parts the transaction layer works with and know how to
//! print themselves back onto the wire. The full header/URI grammar lives
//! with the parser, not here.

mod code;
mod header;
mod method;
mod msg;
mod uri;

pub use code::{Code, CodeKind};
pub use header::{Headers, Name};
pub use method::Method;
pub use msg::{BaseHeaders, CSeq, Request, RequestLine, Response, StatusLine};
pub use uri::{Scheme, SipUri};

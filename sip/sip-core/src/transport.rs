use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

/// Contract between the transaction core and the message transport.
///
/// Implementations enqueue the buffer for delivery and must not block the
/// caller; a delivery failure is surfaced synchronously as an error. Datagram
/// retransmission below the transaction layer is the transport's business.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Protocol name as it appears in Via headers, e.g. `UDP`
    fn name(&self) -> &'static str;

    /// Whether the transport delivers reliably (TCP/TLS/SCTP)
    fn reliable(&self) -> bool;

    fn send(&self, buffer: Bytes, destination: SocketAddr) -> io::Result<()>;
}

/// Cheap to clone handle to a [`Transport`]
#[derive(Debug, Clone)]
pub struct TpHandle(Arc<dyn Transport>);

impl TpHandle {
    pub fn new<T>(transport: T) -> Self
    where
        T: Transport,
    {
        Self(Arc::new(transport))
    }
}

impl Deref for TpHandle {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

/// Transport info attached to every received message
#[derive(Debug, Clone)]
pub struct MessageTpInfo {
    pub transport: TpHandle,
    pub source: SocketAddr,
}

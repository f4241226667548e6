use bytesstr::BytesStr;
use std::fmt;

/// URI scheme of a request target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => f.write_str("sip"),
            Scheme::Sips => f.write_str("sips"),
        }
    }
}

/// Pre-parsed SIP URI carrying the parts the transaction layer routes on.
///
/// The full URI grammar (parameters, headers, escaping) is the parser's
/// business; by the time a request reaches the transaction core only these
/// components matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<BytesStr>,
    pub host: BytesStr,
    pub port: Option<u16>,
}

impl SipUri {
    /// Create a `sip:` URI with just a host part
    pub fn new<H>(host: H) -> Self
    where
        H: Into<BytesStr>,
    {
        Self {
            scheme: Scheme::Sip,
            user: None,
            host: host.into(),
            port: None,
        }
    }

    pub fn with_user<U>(mut self, user: U) -> Self
    where
        U: Into<BytesStr>,
    {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;

        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }

        f.write_str(&self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }

        Ok(())
    }
}

use bytesstr::BytesStr;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Name of a SIP header field.
///
/// Names compare and hash case-insensitively. Well known names are available
/// as constants and keep their canonical printed form.
#[derive(Debug, Clone)]
pub struct Name(Repr);

macro_rules! names {
    ($($print:literal, $ident:ident;)+) => {
        #[derive(Debug, Clone)]
        enum Repr {
            $($ident,)+
            Other(BytesStr),
        }

        impl Name {
            $(pub const $ident: Self = Self(Repr::$ident);)+

            fn from_name(name: &str) -> Self {
                $(
                if name.eq_ignore_ascii_case($print) {
                    return Self(Repr::$ident);
                }
                )+

                Self(Repr::Other(BytesStr::from(name)))
            }

            /// The canonical printed form of the name
            pub fn as_print_str(&self) -> &str {
                match &self.0 {
                    $(Repr::$ident => $print,)+
                    Repr::Other(other) => other,
                }
            }
        }
    };
}

names! {
    "Via",                  VIA;
    "From",                 FROM;
    "To",                   TO;
    "Call-ID",              CALL_ID;
    "CSeq",                 CSEQ;
    "Contact",              CONTACT;
    "Expires",              EXPIRES;
    "Max-Forwards",         MAX_FORWARDS;
    "Route",                ROUTE;
    "Record-Route",         RECORD_ROUTE;
    "Allow",                ALLOW;
    "Supported",            SUPPORTED;
    "Unsupported",          UNSUPPORTED;
    "Require",              REQUIRE;
    "Timestamp",            TIMESTAMP;
    "Retry-After",          RETRY_AFTER;
    "Content-Length",       CONTENT_LENGTH;
    "Content-Type",         CONTENT_TYPE;
    "WWW-Authenticate",     WWW_AUTHENTICATE;
    "Proxy-Authenticate",   PROXY_AUTHENTICATE;
    "Authorization",        AUTHORIZATION;
    "Proxy-Authorization",  PROXY_AUTHORIZATION;
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.as_print_str().eq_ignore_ascii_case(other.as_print_str())
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.as_print_str().as_bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_print_str())
    }
}

impl From<&str> for Name {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

/// Headers is a simple container for SIP-Message headers.
///
/// The headers are stored as [`BytesStr`] under their respective [`Name`],
/// backed by a `Vec` to keep insertion order.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    entries: Vec<(Name, BytesStr)>,
}

impl Headers {
    /// Returns a new empty [`Headers`]
    #[inline]
    pub const fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Returns a new empty [`Headers`] with the specified capacity
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Headers {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Append a header at the end of the container
    pub fn insert<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        self.entries.push((name.into(), value.into()));
    }

    /// Insert a header in front of all existing ones
    pub fn insert_front<N, V>(&mut self, name: N, value: V)
    where
        N: Into<Name>,
        V: Into<BytesStr>,
    {
        self.entries.insert(0, (name.into(), value.into()));
    }

    /// Returns whether a header with the given name exists
    pub fn contains(&self, name: &Name) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Returns the first value stored under `name`
    pub fn get(&self, name: &Name) -> Option<&BytesStr> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Returns all values stored under `name` in insertion order
    pub fn get_all<'s>(&'s self, name: &'s Name) -> impl Iterator<Item = &'s BytesStr> + 's {
        self.entries
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Removes all values stored under `name`, returning them
    pub fn remove(&mut self, name: &Name) -> Vec<BytesStr> {
        let mut removed = Vec::new();

        self.entries.retain(|(n, v)| {
            if n == name {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    /// Copy all values of `name` into `dst`, keeping their order
    pub fn clone_into(&self, dst: &mut Headers, name: &Name) {
        for value in self.get_all(name) {
            dst.insert(name.clone(), value.clone());
        }
    }

    /// Iterate over all `(name, value)` entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Name, &BytesStr)> + '_ {
        self.entries.iter().map(|(n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{}: {}\r\n", name, value)?;
        }

        Ok(())
    }
}

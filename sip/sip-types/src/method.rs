use bytesstr::BytesStr;
use std::fmt;

/// Represents a SIP-Method.
///
/// Well known methods are available as constants:
///
/// ```
/// use rill_sip_types::Method;
///
/// let _invite = Method::INVITE;
///
/// // custom methods can be used as well:
/// let _custom = Method::from("HELLO");
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Method(Repr);

macro_rules! methods {
    ($($print:literal, $ident:ident;)+) => {
        #[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[allow(clippy::upper_case_acronyms)]
        enum Repr {
            $($ident,)+
            Other(BytesStr),
        }

        impl Method {
            $(pub const $ident: Self = Self(Repr::$ident);)+

            fn from_name(name: &str) -> Self {
                $(
                if name.eq_ignore_ascii_case($print) {
                    return Self(Repr::$ident);
                }
                )+

                Self(Repr::Other(BytesStr::from(name)))
            }
        }

        impl fmt::Display for Method {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.0 {
                    $(Repr::$ident => f.write_str($print),)+
                    Repr::Other(other) => f.write_str(other),
                }
            }
        }
    };
}

methods! {
    "INVITE",       INVITE;
    "ACK",          ACK;
    "CANCEL",       CANCEL;
    "BYE",          BYE;
    "OPTIONS",      OPTIONS;
    "REGISTER",     REGISTER;
    "INFO",         INFO;
    "MESSAGE",      MESSAGE;
    "SUBSCRIBE",    SUBSCRIBE;
    "NOTIFY",       NOTIFY;
    "REFER",        REFER;
    "PUBLISH",      PUBLISH;
    "UPDATE",       UPDATE;
    "PRACK",        PRACK;
}

impl From<&str> for Method {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

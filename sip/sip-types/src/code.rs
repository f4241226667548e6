use std::fmt;

/// Code is a representation of an SIP-Code encoded in an u16
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Code(u16);

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("Code");
        tuple.field(&self.0);
        if let Some(text) = self.text() {
            tuple.field(&text);
        }
        tuple.finish()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CodeKind represents the kind of SIP-Code for broader Code handling
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CodeKind {
    /// Represents code 100..=199
    Provisional,

    /// Represents code 200..=299
    Success,

    /// Represents code 300..=399
    Redirection,

    /// Represents code 400..=499
    RequestFailure,

    /// Represents code 500..=599
    ServerFailure,

    /// Represents code 600..=699
    GlobalFailure,

    /// Represents all other codes
    Custom,
}

impl Code {
    /// Returns the [CodeKind] of the code
    #[inline]
    pub fn kind(self) -> CodeKind {
        match self.0 {
            100..=199 => CodeKind::Provisional,
            200..=299 => CodeKind::Success,
            300..=399 => CodeKind::Redirection,
            400..=499 => CodeKind::RequestFailure,
            500..=599 => CodeKind::ServerFailure,
            600..=699 => CodeKind::GlobalFailure,
            _ => CodeKind::Custom,
        }
    }

    /// Returns true for any code that completes a transaction (>= 200)
    #[inline]
    pub fn is_final(self) -> bool {
        self.0 >= 200
    }

    /// Returns the number that the code represents
    pub fn into_u16(self) -> u16 {
        self.0
    }
}

impl From<u16> for Code {
    fn from(r: u16) -> Code {
        Code(r)
    }
}

macro_rules! codes {
    ($($(#[$comments:meta])* [$code:expr => $name:ident, $text:literal];)*) => {
        impl Code {
            /// Returns the default response-text for a known Code
            pub fn text(self) -> Option<&'static str> {
                match self.0 {
                    $($code => Some($text),)*
                    _ => None
                }
            }

            $(
            $(#[$comments])*
            pub const $name: Code = Code($code);
            )*
        }
    };
}

codes! {
    // ==== PROVISIONAL 1XX ====

    /// 100 Trying
    [100 => TRYING, "Trying"];

    /// 180 Ringing
    [180 => RINGING, "Ringing"];

    /// 183 Session Progress
    [183 => SESSION_PROGRESS, "Session Progress"];

    // ==== SUCCESS 2XX ====

    /// 200 OK
    [200 => OK, "OK"];

    // ==== REQUEST FAILURE 4XX ====

    /// 400 Bad Request
    [400 => BAD_REQUEST, "Bad Request"];

    /// 401 Unauthorized
    [401 => UNAUTHORIZED, "Unauthorized"];

    /// 403 Forbidden
    [403 => FORBIDDEN, "Forbidden"];

    /// 404 Not Found
    [404 => NOT_FOUND, "Not Found"];

    /// 405 Method Not Allowed
    [405 => METHOD_NOT_ALLOWED, "Method Not Allowed"];

    /// 407 Proxy Authentication Required
    [407 => PROXY_AUTHENTICATION_REQUIRED, "Proxy Authentication Required"];

    /// 408 Request Timeout
    [408 => REQUEST_TIMEOUT, "Request Timeout"];

    /// 420 Bad Extension
    [420 => BAD_EXTENSION, "Bad Extension"];

    /// 481 Call/Transaction Does Not Exist
    [481 => CALL_OR_TRANSACTION_DOES_NOT_EXIST, "Call/Transaction Does Not Exist"];

    /// 482 Loop Detected
    [482 => LOOP_DETECTED, "Loop Detected"];

    /// 486 Busy Here
    [486 => BUSY_HERE, "Busy Here"];

    /// 487 Request Terminated
    [487 => REQUEST_TERMINATED, "Request Terminated"];

    /// 488 Not Acceptable Here
    [488 => NOT_ACCEPTABLE_HERE, "Not Acceptable Here"];

    /// 491 Request Pending
    [491 => REQUEST_PENDING, "Request Pending"];

    // ==== SERVER FAILURE 5XX ====

    /// 500 Server Internal Error
    [500 => SERVER_INTERNAL_ERROR, "Server Internal Error"];

    /// 503 Service Unavailable
    [503 => SERVICE_UNAVAILABLE, "Service Unavailable"];

    // ==== GLOBAL FAILURE 6XX ====

    /// 603 Decline
    [603 => DECLINE, "Decline"];
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_ranges() {
        assert_eq!(Code::TRYING.kind(), CodeKind::Provisional);
        assert_eq!(Code::OK.kind(), CodeKind::Success);
        assert_eq!(Code::LOOP_DETECTED.kind(), CodeKind::RequestFailure);
        assert_eq!(Code::from(700).kind(), CodeKind::Custom);
    }

    #[test]
    fn finality() {
        assert!(!Code::RINGING.is_final());
        assert!(Code::OK.is_final());
        assert!(Code::DECLINE.is_final());
    }
}

//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have bridge `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling the bridge protocol.
///
/// Every error maps to one of the short problem codes carried in
/// `close` control messages; see [`Error::problem`].
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// A frame violated the length-prefix framing rules.
    BadMessage,
    /// A control message or channel option violated the protocol.
    Protocol,
    /// A resource (package path, pooled connection target) is absent.
    NotFound,
    /// A payload type or capability is unknown.
    NotSupported,
    /// Credentials were rejected.
    AuthenticationFailed,
    /// The user is not permitted.
    AccessDenied,
    /// No way to authenticate is available.
    AuthenticationUnavailable,
    /// The requested authentication mechanism is unknown.
    AuthenticationNotSupported,
    /// The peer went away, or we chose to kill the channel.
    Terminated,
    /// An invariant was violated inside the bridge.
    Internal,
    /// An `io::Error` on an underlying stream.
    Io,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_bad_message() -> Error {
        Error::new(Kind::BadMessage)
    }

    pub(crate) fn new_protocol() -> Error {
        Error::new(Kind::Protocol)
    }

    pub(crate) fn new_not_found() -> Error {
        Error::new(Kind::NotFound)
    }

    pub(crate) fn new_not_supported() -> Error {
        Error::new(Kind::NotSupported)
    }

    pub(crate) fn new_terminated() -> Error {
        Error::new(Kind::Terminated)
    }

    pub(crate) fn new_internal() -> Error {
        Error::new(Kind::Internal)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    /// Construct an error from a problem code received on the wire.
    pub fn from_problem(problem: &str) -> Error {
        let kind = match problem {
            "protocol-error" => Kind::Protocol,
            "not-found" => Kind::NotFound,
            "not-supported" => Kind::NotSupported,
            "authentication-failed" => Kind::AuthenticationFailed,
            "access-denied" => Kind::AccessDenied,
            "authentication-unavailable" => Kind::AuthenticationUnavailable,
            "authentication-not-supported" => Kind::AuthenticationNotSupported,
            "internal-error" => Kind::Internal,
            _ => Kind::Terminated,
        };
        Error::new(kind)
    }

    /// The short problem code for this error, as carried in `close.problem`.
    pub fn problem(&self) -> &'static str {
        match self.inner.kind {
            Kind::BadMessage | Kind::Protocol => "protocol-error",
            Kind::NotFound => "not-found",
            Kind::NotSupported => "not-supported",
            Kind::AuthenticationFailed => "authentication-failed",
            Kind::AccessDenied => "access-denied",
            Kind::AuthenticationUnavailable => "authentication-unavailable",
            Kind::AuthenticationNotSupported => "authentication-not-supported",
            Kind::Terminated | Kind::Io => "terminated",
            Kind::Internal => "internal-error",
        }
    }

    /// Returns true if this was a framing violation.
    pub fn is_bad_message(&self) -> bool {
        matches!(self.inner.kind, Kind::BadMessage)
    }

    /// Returns true if this was a protocol violation.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::BadMessage | Kind::Protocol)
    }

    /// Returns true if a resource was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self.inner.kind, Kind::NotFound)
    }

    /// Returns true if the peer went away.
    pub fn is_terminated(&self) -> bool {
        matches!(self.inner.kind, Kind::Terminated | Kind::Io)
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::BadMessage => "bad-message",
            Kind::Protocol => "protocol violation",
            Kind::NotFound => "resource not found",
            Kind::NotSupported => "not supported",
            Kind::AuthenticationFailed => "authentication failed",
            Kind::AccessDenied => "access denied",
            Kind::AuthenticationUnavailable => "authentication unavailable",
            Kind::AuthenticationNotSupported => "authentication mechanism not supported",
            Kind::Terminated => "peer terminated",
            Kind::Internal => "internal error inside the bridge, please report",
            Kind::Io => "stream error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("cockpit_bridge::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::new_io(err)
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

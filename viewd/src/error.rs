use std::fmt;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The failure classes surfaced to clients and to the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The view has not completed its initial scan.
    NotReady,
    /// A bdv, wallet, or delegate id did not resolve.
    UnknownId,
    /// Malformed arguments or an unknown method.
    InvalidArgument,
    /// A side scan is already running, or too many callback waiters.
    Busy,
    /// The store returned an inconsistent script history.
    StorageCorrupt,
    /// The framing layer reported a closed transport.
    TransportClosed,
    /// Unrecoverable index damage; the service shuts down.
    Fatal,
    /// Start-up failed.
    Init,
    Generic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotReady => write!(f, "view is not ready"),
            ErrorKind::UnknownId => write!(f, "unknown id"),
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::Busy => write!(f, "busy"),
            ErrorKind::StorageCorrupt => write!(f, "storage corrupt"),
            ErrorKind::TransportClosed => write!(f, "transport closed"),
            ErrorKind::Fatal => write!(f, "fatal error"),
            ErrorKind::Init => write!(f, "initialization error"),
            ErrorKind::Generic => write!(f, "error"),
        }
    }
}

impl std::error::Error for ErrorKind {}

impl ErrorKind {
    /// Wraps a source error with this kind.
    pub fn context(self, source: impl Into<BoxError>) -> Error {
        Error {
            kind: self,
            source: Some(source.into()),
        }
    }

    /// The code carried by the wire `Error` argument.
    pub fn wire_code(self) -> u8 {
        match self {
            ErrorKind::NotReady => 1,
            ErrorKind::UnknownId => 2,
            ErrorKind::InvalidArgument => 3,
            ErrorKind::Busy => 4,
            ErrorKind::StorageCorrupt => 5,
            ErrorKind::TransportClosed => 6,
            ErrorKind::Fatal => 7,
            ErrorKind::Init | ErrorKind::Generic => 0xFF,
        }
    }
}

/// Error type.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<BoxError>,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.kind, source),
            None => self.kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { kind, source: None }
    }
}

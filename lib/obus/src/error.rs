use std::fmt;
use std::io;
use std::net::AddrParseError;

/// The object/call/provider categories a [`NotFound`](ErrorKind::NotFound)
/// or [`InvalidState`](ErrorKind::InvalidState) error can refer to, kept
/// purely for diagnostics.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    NotFound,
    Io,
    ProtocolMismatch,
}

/// Unified error type for all synchronous, caller-visible failures.
///
/// Asynchronous failures (write timeout, decode error, peer disconnect)
/// never surface as an `ObusError` to user code — they are
/// absorbed by the engine and re-emitted through the bus-event channel or
/// a call's completion callback instead.
#[derive(Debug)]
pub struct ObusError {
    kind: ErrorKind,
    message: String,
}

impl ObusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> ObusError {
        ObusError {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> ObusError {
        ObusError::new(ErrorKind::InvalidArgument, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> ObusError {
        ObusError::new(ErrorKind::InvalidState, message)
    }

    pub fn not_found(message: impl Into<String>) -> ObusError {
        ObusError::new(ErrorKind::NotFound, message)
    }

    pub fn protocol_mismatch(message: impl Into<String>) -> ObusError {
        ObusError::new(ErrorKind::ProtocolMismatch, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for ObusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ObusError {}

impl From<io::Error> for ObusError {
    fn from(err: io::Error) -> Self {
        ObusError::new(ErrorKind::Io, err.to_string())
    }
}

impl From<AddrParseError> for ObusError {
    fn from(err: AddrParseError) -> Self {
        ObusError::new(ErrorKind::InvalidArgument, err.to_string())
    }
}

/// Outcome of an I/O operation that distinguishes "would block, try
/// later" from a genuine fatal failure, so non-blocking code never has
/// to special-case `io::ErrorKind::WouldBlock` at every call site.
#[derive(Debug)]
pub enum IoOutcome {
    Wait,
    Fatal(ObusError),
}

impl From<io::Error> for IoOutcome {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => IoOutcome::Wait,
            _ => IoOutcome::Fatal(err.into()),
        }
    }
}

pub type IoResult<T> = Result<T, IoOutcome>;

impl IoOutcome {
    pub fn is_wait(&self) -> bool {
        matches!(self, IoOutcome::Wait)
    }
}

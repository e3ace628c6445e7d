// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A stable kind on every error so callers can dispatch on it without string-matching

use backtrace_error::DynBacktraceError;
use std::borrow::Cow;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Stable classification of everything that can go wrong in the engine.
/// Callers are expected to match on this, never on message text.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Named file does not exist.
    NotFound,
    /// Named file exists but holds zero bytes.
    EmptyFile,
    /// A read returned fewer bytes than requested.
    IoShort,
    /// Eviction could not free enough space within the wait budget.
    InsufficientMemory,
    /// Another thread is currently reading the same path (tryGetFile only).
    BusyReading,
    /// Another thread is already waiting for memory to come free.
    AnotherWaiterPresent,
    /// The bounded wait for memory expired.
    WaitTimeout,
    /// A mutation or release was attempted on a storage with active references.
    StorageInUse,
    /// Persisted index file has a malformed header.
    BadHeader,
    /// Persisted index file has inconsistent or truncated bitmap offsets.
    BadOffsets,
    /// Persisted index file disagrees with itself about sizes.
    SizeMismatch,
    /// Operation requested on a column type the engine does not handle.
    UnsupportedType,
    /// An internal invariant failed; indicates a bug.
    InternalInvariant,
    /// Any other I/O failure.
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    #[allow(dead_code)]
    inner: DynBacktraceError,
}

pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(kind: ErrorKind, err: E) -> Error {
        error!(target: "sift", "{:?}: {:?}", kind, err);
        let inner = DynBacktraceError::from(err);
        Error { kind, inner }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::UnexpectedEof => ErrorKind::IoShort,
            std::io::ErrorKind::OutOfMemory => ErrorKind::InsufficientMemory,
            _ => ErrorKind::Io,
        };
        Error::new(kind, err)
    }
}

pub fn err(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::new(kind, err)
}

#[test]
fn test_error() {
    let e = err(ErrorKind::BadHeader, "test error");
    assert_eq!(e.kind(), ErrorKind::BadHeader);
    let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
    assert_eq!(e.kind(), ErrorKind::NotFound);
}

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Errors surfaced through [`crate::Pool::acquire`]'s callback.
///
/// The `Display` text of [`Error::ConnectionFailed`] and
/// [`Error::FailedToConnect`] are literal contract values (see `spec.md`
/// §7): callers matching on the exact string, as the source this crate is
/// modeled on does, keep working.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Every target was tried and every connect attempt failed.
    ConnectionFailed,
    /// The connect collaborator failed to even allocate/start a connection.
    FailedToConnect(io::Error),
    /// The DNS collaborator failed to resolve a `Named` target. Per spec,
    /// this is never retried against another target.
    Resolve(Box<dyn StdError + Send + Sync>),
    /// `cancel_acquire` was called before the attempt completed.
    Canceled,
    /// The pool has been disposed.
    Disposed,
    /// `init_specific` was called with an empty target list (I5).
    NoTargets,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectionFailed => f.write_str("connection failed"),
            Error::FailedToConnect(_) => f.write_str("failed to connect to host"),
            Error::Resolve(e) => write!(f, "{e}"),
            Error::Canceled => f.write_str("acquire was canceled"),
            Error::Disposed => f.write_str("pool has been disposed"),
            Error::NoTargets => f.write_str("pool has no targets"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::FailedToConnect(e) => Some(e),
            Error::Resolve(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

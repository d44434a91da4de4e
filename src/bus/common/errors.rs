use std::fmt::{Debug, Display};
use std::sync::PoisonError;
use std::{fmt, io, result};

/// Error is the crate-wide error type. Like the teacher crate, the variants
/// are boxed behind a single struct to keep `Result<T>` small on the stack.
#[derive(Debug)]
pub struct Error {
    err: Box<ErrorKind>,
}

#[derive(Debug)]
pub enum ErrorKind {
    /// A recoverable out-of-memory condition (§7.1). Callers may retry later;
    /// no transport state is corrupted.
    LowMemoryError,
    /// The peer closed the connection, or disconnect() was already called.
    ClosedError,
    /// An auth mechanism rejected the peer's credentials or a malformed line.
    AuthRefused(String),
    /// A watch, fd, or message was used in a way the transport does not own.
    InvariantViolation(String),
    StringError(String),
    IOError(io::Error),
    PoisonError,
    Utf8Error(std::str::Utf8Error),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn low_mem() -> Self {
        Error {
            err: Box::new(ErrorKind::LowMemoryError),
        }
    }

    pub fn closed() -> Self {
        Error {
            err: Box::new(ErrorKind::ClosedError),
        }
    }

    pub fn auth_refused<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::AuthRefused(s.to_string())),
        }
    }

    pub fn invariant<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::InvariantViolation(s.to_string())),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// True if this error represents out-of-memory, as opposed to a fatal
    /// I/O condition. Distinguishing the two lets callers decide whether to
    /// retry (OOM) or disconnect (everything else) per §7.
    pub fn is_oom(&self) -> bool {
        matches!(&*self.err, ErrorKind::LowMemoryError)
    }

    /// True if this error is a transient `EAGAIN`/`EWOULDBLOCK` from a
    /// non-blocking socket call (§7.2): expected, silent, "come back later".
    pub fn is_would_block(&self) -> bool {
        matches!(&*self.err, ErrorKind::IOError(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(String::from(err))),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::OutOfMemory {
            return Error::low_mem();
        }
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error {
            err: Box::new(ErrorKind::Utf8Error(err)),
        }
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_err: PoisonError<Guard>) -> Self {
        Error {
            err: Box::new(ErrorKind::PoisonError),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::LowMemoryError => f.write_str("not enough memory to handle this request"),
            ErrorKind::ClosedError => f.write_str("transport is closed"),
            ErrorKind::AuthRefused(s) => write!(f, "authentication refused: {}", s),
            ErrorKind::InvariantViolation(s) => write!(f, "invariant violation: {}", s),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::IOError(e) => Display::fmt(&e, f),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
            ErrorKind::Utf8Error(e) => Display::fmt(&e, f),
        }
    }
}

impl std::error::Error for Error {}

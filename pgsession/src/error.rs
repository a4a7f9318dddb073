//! `pgsession` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io};

use crate::{
    codec::{CodecError, UnsupportedType},
    common::unit_error,
    connection::{AuthError, ConfigError, UnsupportedAuth},
    postgres::{DatabaseError, ProtocolError},
    row::{DecodeError, RowNotFound},
    transaction::{AbortedTransaction, TxClosed},
};

/// A specialized [`Result`] type for `pgsession` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgsession` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Prefix the error message with additional context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Returns the server error, if this error came from the server.
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match &self.kind {
            ErrorKind::Database(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the SQLSTATE code of a server error.
    pub fn code(&self) -> Option<&str> {
        self.as_database().map(DatabaseError::code)
    }

    /// Returns `true` if the session cannot be used after this error.
    pub fn is_fatal(&self) -> bool {
        match &self.kind {
            ErrorKind::Io(_)
            | ErrorKind::Auth(_)
            | ErrorKind::UnsupportedAuth(_)
            | ErrorKind::Closed(_) => true,
            ErrorKind::Protocol(e) => e.is_fatal(),
            ErrorKind::Database(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// Returns `true` for the error reported on pipeline jobs following a failed one.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }

    pub(crate) fn is_stale_statement(&self) -> bool {
        self.as_database().is_some_and(DatabaseError::is_stale_statement)
    }

    pub(crate) fn closed() -> Self {
        Closed.into()
    }

    pub(crate) fn cancelled() -> Self {
        Cancelled.into()
    }

    pub(crate) fn conflict(reason: &'static str) -> Self {
        ConflictError { reason }.into()
    }

    pub(crate) fn config(reason: impl Into<Cow<'static, str>>) -> Self {
        ConfigError::new(reason).into()
    }
}

/// All possible error kind from `pgsession` library.
pub enum ErrorKind {
    Config(ConfigError),
    Protocol(ProtocolError),
    Io(io::Error),
    Database(DatabaseError),
    AbortedTransaction(AbortedTransaction),
    UnsupportedType(UnsupportedType),
    UnsupportedAuth(UnsupportedAuth),
    Auth(AuthError),
    Codec(CodecError),
    Decode(DecodeError),
    RowNotFound(RowNotFound),
    Timeout(Timeout),
    Cancelled(Cancelled),
    Conflict(ConflictError),
    TxClosed(TxClosed),
    Closed(Closed),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ConfigError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<DatabaseError>e => ErrorKind::Database(e));
from!(<AbortedTransaction>e => ErrorKind::AbortedTransaction(e));
from!(<UnsupportedType>e => ErrorKind::UnsupportedType(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<AuthError>e => ErrorKind::Auth(e));
from!(<RowNotFound>e => ErrorKind::RowNotFound(e));
from!(<Timeout>e => ErrorKind::Timeout(e));
from!(<Cancelled>e => ErrorKind::Cancelled(e));
from!(<ConflictError>e => ErrorKind::Conflict(e));
from!(<TxClosed>e => ErrorKind::TxClosed(e));
from!(<Closed>e => ErrorKind::Closed(e));

from!(<CodecError>e => match e {
    CodecError::Unsupported(e) => ErrorKind::UnsupportedType(e),
    e => ErrorKind::Codec(e),
});
from!(<DecodeError>e => match e {
    DecodeError::Codec(CodecError::Unsupported(e)) => ErrorKind::UnsupportedType(e),
    e => ErrorKind::Decode(e),
});

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::AbortedTransaction(e) => e.fmt(f),
            Self::UnsupportedType(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Codec(e) => e.fmt(f),
            Self::Decode(e) => e.fmt(f),
            Self::RowNotFound(e) => e.fmt(f),
            Self::Timeout(e) => e.fmt(f),
            Self::Cancelled(e) => e.fmt(f),
            Self::Conflict(e) => e.fmt(f),
            Self::TxClosed(e) => e.fmt(f),
            Self::Closed(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

unit_error! {
    /// Waiting exceeded the requested duration.
    pub struct Timeout("operation timed out");
}

unit_error! {
    /// Operation did not run, either an earlier pipeline job failed or the caller cancelled it.
    pub struct Cancelled("operation cancelled");
}

unit_error! {
    /// Session is broken or already closed.
    pub struct Closed("session closed");
}

/// An operation was started while the session is busy with another one.
pub struct ConflictError {
    reason: &'static str,
}

impl std::error::Error for ConflictError { }

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session busy: {}", self.reason)
    }
}

impl fmt::Debug for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fatal_classification() {
        let io: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(io.is_fatal());
        assert!(!Error::cancelled().is_fatal());
        assert!(Error::cancelled().is_cancelled());
        assert!(Error::closed().is_fatal());
    }

    #[test]
    fn context_prefix() {
        let err = Error::conflict("copy in progress").with_context("query");
        assert!(err.to_string().starts_with("query: session busy: copy in progress"));
    }
}

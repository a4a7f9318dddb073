//! Protocol error
use std::fmt;

use super::BackendMessage;

/// An error when translating buffer from postgres.
///
/// Protocol errors are fatal, the session cannot be trusted afterwards. The exception is
/// [`ProtocolError::TooLarge`], which is raised before anything is written.
pub enum ProtocolError {
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    UnknownAuth {
        auth: u32,
    },
    /// Frame length outside of the valid range.
    InvalidLength {
        msgtype: u8,
        len: i32,
    },
    /// Message body does not match its declared layout.
    Malformed {
        reason: &'static str,
    },
    /// Server replied something other than `S` or `N` to `SSLRequest`.
    SslResponse {
        found: u8,
    },
    /// Outgoing message exceeds the protocol limits.
    TooLarge {
        what: &'static str,
        len: usize,
    },
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => {
                        write!(
                            f,
                            "Expected message `{}` found `{found}`",
                            BackendMessage::message_name(m),
                        )?
                    },
                    None => write!(f, "Unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownAuth { auth } => write!(f, "Unknown authentication request: {auth}"),
            ProtocolError::InvalidLength { msgtype, len } => write!(
                f,
                "Invalid length {len} for message `{}`",
                BackendMessage::message_name(msgtype),
            ),
            ProtocolError::Malformed { reason } => write!(f, "Malformed message: {reason}"),
            ProtocolError::SslResponse { found } => write!(f, "Invalid SSLRequest response: {found:#x}"),
            ProtocolError::TooLarge { what, len } => write!(f, "{what} too large for the protocol: {len}"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn malformed(reason: &'static str) -> ProtocolError {
        Self::Malformed { reason }
    }

    pub(crate) fn too_large(what: &'static str, len: usize) -> ProtocolError {
        Self::TooLarge { what, len }
    }

    /// Returns `false` only for a message rejected before it was written.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TooLarge { .. })
    }
}

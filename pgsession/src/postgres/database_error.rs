//! Server reported error.
use bytes::Bytes;
use std::fmt;

use super::ProtocolError;
use crate::ext::BytesExt;

/// Well known SQLSTATE codes.
///
/// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
pub mod sqlstate {
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
    pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";
    pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";
    pub const SYNTAX_ERROR: &str = "42601";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const QUERY_CANCELED: &str = "57014";
    pub const ADMIN_SHUTDOWN: &str = "57P01";
    pub const INVALID_PASSWORD: &str = "28P01";
}

/// Severity of a server error or notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
    Panic,
    Warning,
    Notice,
    Debug,
    Info,
    Log,
}

impl Severity {
    fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "ERROR" => Self::Error,
            "FATAL" => Self::Fatal,
            "PANIC" => Self::Panic,
            "WARNING" => Self::Warning,
            "NOTICE" => Self::Notice,
            "DEBUG" => Self::Debug,
            "INFO" => Self::Info,
            "LOG" => Self::Log,
            _ => return None,
        })
    }

    /// Returns `true` when the server terminates the session after reporting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal | Self::Panic)
    }
}

/// Error or notice reported by the server.
///
/// <https://www.postgresql.org/docs/current/protocol-error-fields.html>
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DatabaseError {
    severity: Option<Severity>,
    code: String,
    message: String,
    detail: Option<String>,
    hint: Option<String>,
    position: Option<u32>,
    where_: Option<String>,
    schema: Option<String>,
    table: Option<String>,
    column: Option<String>,
    datatype: Option<String>,
    constraint: Option<String>,
}

impl DatabaseError {
    /// Parse `ErrorResponse` or `NoticeResponse` body.
    pub fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut me = DatabaseError::default();
        loop {
            let field = body.try_u8()?;
            if field == b'\0' {
                break;
            }
            let value = body.get_nul_string()?;
            match field {
                // `V` is never localized, prefer it over `S`
                b'V' => me.severity = Severity::parse(&value),
                b'S' if me.severity.is_none() => me.severity = Severity::parse(&value),
                b'C' => me.code = value,
                b'M' => me.message = value,
                b'D' => me.detail = Some(value),
                b'H' => me.hint = Some(value),
                b'P' => me.position = value.parse().ok(),
                b'W' => me.where_ = Some(value),
                b's' => me.schema = Some(value),
                b't' => me.table = Some(value),
                b'c' => me.column = Some(value),
                b'd' => me.datatype = Some(value),
                b'n' => me.constraint = Some(value),
                _ => {}
            }
        }
        Ok(me)
    }

    /// Returns the severity, [`None`] if server sent an unknown one.
    pub fn severity(&self) -> Option<Severity> {
        self.severity
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// An optional secondary error message carrying more detail about the problem.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// An optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Error cursor position as an index into the original query string, starts at 1.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    /// Context in which the error occurred.
    pub fn where_(&self) -> Option<&str> {
        self.where_.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn datatype(&self) -> Option<&str> {
        self.datatype.as_deref()
    }

    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    /// Returns `true` when the server will close the session.
    pub fn is_fatal(&self) -> bool {
        self.severity.is_some_and(|e| e.is_fatal())
    }

    /// Returns `true` if the error means a cached statement no longer matches the server.
    ///
    /// This is either the statement was deallocated behind our back, or the underlying
    /// schema change invalidated its result shape.
    pub fn is_stale_statement(&self) -> bool {
        match self.code.as_str() {
            sqlstate::INVALID_SQL_STATEMENT_NAME => true,
            sqlstate::FEATURE_NOT_SUPPORTED => self.message.contains("cached plan must not change result type"),
            _ => false,
        }
    }
}

impl std::error::Error for DatabaseError { }

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Some(Severity::Fatal) => "FATAL",
            Some(Severity::Panic) => "PANIC",
            Some(Severity::Warning) => "WARNING",
            Some(Severity::Notice) => "NOTICE",
            Some(Severity::Debug) => "DEBUG",
            Some(Severity::Info) => "INFO",
            Some(Severity::Log) => "LOG",
            Some(Severity::Error) | None => "ERROR",
        };
        write!(f, "{severity}: {} ({})", self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, ", {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, ", hint: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_error_fields() {
        let body = Bytes::from_static(
            b"SERROR\0VERROR\0C42601\0Msyntax error at or near \"selec\"\0P1\0Fscan.l\0\0",
        );
        let err = DatabaseError::parse(body).unwrap();
        assert_eq!(err.severity(), Some(Severity::Error));
        assert_eq!(err.code(), sqlstate::SYNTAX_ERROR);
        assert_eq!(err.message(), "syntax error at or near \"selec\"");
        assert_eq!(err.position(), Some(1));
        assert!(!err.is_fatal());
        assert!(!err.is_stale_statement());
    }

    #[test]
    fn stale_statement_codes() {
        let body = Bytes::from_static(b"SERROR\0C26000\0Mprepared statement \"q1\" does not exist\0\0");
        assert!(DatabaseError::parse(body).unwrap().is_stale_statement());

        let body = Bytes::from_static(b"SERROR\0C0A000\0Mcached plan must not change result type\0\0");
        assert!(DatabaseError::parse(body).unwrap().is_stale_statement());
    }

    #[test]
    fn missing_terminator() {
        assert!(DatabaseError::parse(Bytes::from_static(b"SERROR")).is_err());
    }
}

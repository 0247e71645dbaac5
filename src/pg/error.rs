//! Error types for the PostgreSQL protocol implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;

/// Result type for PostgreSQL wire-level operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur while speaking the wire protocol.
#[derive(Debug)]
pub enum PgError {
    /// I/O error during communication.
    Io(io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    Protocol(String),

    /// Authentication failed on the client side.
    Auth(String),

    /// SSL negotiation or TLS session failure.
    Tls(String),

    /// Server returned an error.
    Server(Box<Diagnostics>),

    /// Type conversion error.
    Type(String),

    /// Connection handle is closed.
    ConnectionClosed,

    /// The server closed the socket while a response was expected.
    UnexpectedEof,

    /// Statement not found in cache.
    StatementNotFound(String),

    /// Timeout waiting for response.
    Timeout,
}

impl PgError {
    /// SQLSTATE of a server-reported error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            PgError::Server(diag) => diag.sqlstate.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PgError::Tls(msg) => write!(f, "SSL error: {}", msg),
            PgError::Server(diag) => diag.fmt(f),
            PgError::Type(msg) => write!(f, "Type error: {}", msg),
            PgError::ConnectionClosed => write!(f, "connection already closed"),
            PgError::UnexpectedEof => write!(f, "server closed the connection unexpectedly"),
            PgError::StatementNotFound(name) => {
                write!(f, "Prepared statement not found: {}", name)
            }
            PgError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}

/// Fields of an ErrorResponse or NoticeResponse.
///
/// Field names follow the server's error field identifiers; every field is
/// optional because servers may omit any of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub severity: Option<String>,
    pub severity_nonlocalized: Option<String>,
    pub sqlstate: Option<String>,
    pub message_primary: Option<String>,
    pub message_detail: Option<String>,
    pub message_hint: Option<String>,
    pub statement_position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub context: Option<String>,
    pub schema_name: Option<String>,
    pub table_name: Option<String>,
    pub column_name: Option<String>,
    pub datatype_name: Option<String>,
    pub constraint_name: Option<String>,
    pub source_file: Option<String>,
    pub source_line: Option<String>,
    pub source_function: Option<String>,
}

impl Diagnostics {
    /// Build from the raw `(field code, value)` map of an error/notice body.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        let get = |code: u8| fields.get(&code).cloned();
        Self {
            severity: get(b'S'),
            severity_nonlocalized: get(b'V'),
            sqlstate: get(b'C'),
            message_primary: get(b'M'),
            message_detail: get(b'D'),
            message_hint: get(b'H'),
            statement_position: get(b'P'),
            internal_position: get(b'p'),
            internal_query: get(b'q'),
            context: get(b'W'),
            schema_name: get(b's'),
            table_name: get(b't'),
            column_name: get(b'c'),
            datatype_name: get(b'd'),
            constraint_name: get(b'n'),
            source_file: get(b'F'),
            source_line: get(b'L'),
            source_function: get(b'R'),
        }
    }

    /// Primary message, or an empty string when the server sent none.
    pub fn message(&self) -> &str {
        self.message_primary.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}:  ", severity)?;
        }
        f.write_str(self.message())?;
        if let Some(d) = &self.message_detail {
            write!(f, "\nDETAIL:  {}", d)?;
        }
        if let Some(h) = &self.message_hint {
            write!(f, "\nHINT:  {}", h)?;
        }
        Ok(())
    }
}

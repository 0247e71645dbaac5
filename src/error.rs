//! Error taxonomy exposed to applications.
//!
//! Wire-level failures (`PgError`) are classified here; server errors are
//! sorted by the class (first two characters) of their SQLSTATE.

use std::fmt;

use thiserror::Error;

use crate::pg::{Diagnostics, Oid, PgError};

/// SQLSTATE reported for a statement canceled by request.
pub const QUERY_CANCELED: &str = "57014";

/// A server-reported (or client-synthesized) database error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub message: String,
    pub sqlstate: Option<String>,
    pub diag: Option<Box<Diagnostics>>,
    /// The column value that failed to convert, for typecast errors.
    pub typecast: Option<Box<TypecastError>>,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sqlstate: None,
            diag: None,
            typecast: None,
        }
    }

    pub fn with_sqlstate(message: impl Into<String>, sqlstate: &str) -> Self {
        Self {
            message: message.into(),
            sqlstate: Some(sqlstate.to_string()),
            diag: None,
            typecast: None,
        }
    }

    fn from_diagnostics(diag: Box<Diagnostics>) -> Self {
        Self {
            message: diag.to_string(),
            sqlstate: diag.sqlstate.clone(),
            diag: Some(diag),
            typecast: None,
        }
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<String> for DbError {
    fn from(message: String) -> Self {
        DbError::new(message)
    }
}

impl From<&str> for DbError {
    fn from(message: &str) -> Self {
        DbError::new(message)
    }
}

/// A column value the registry could not convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypecastError {
    pub column: Option<String>,
    pub oid: Oid,
    pub raw: Vec<u8>,
    pub message: String,
}

impl fmt::Display for TypecastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(col) => write!(
                f,
                "cannot convert column \"{}\" (type {}): {}",
                col, self.oid, self.message
            ),
            None => write!(f, "cannot convert value of type {}: {}", self.oid, self.message),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Misuse of the adapter itself: closed handles, wrong state.
    #[error("{0}")]
    Interface(String),

    #[error("{0}")]
    Operational(DbError),

    #[error("{0}")]
    Programming(DbError),

    #[error("{0}")]
    Integrity(DbError),

    /// Bad data reported by the server, or a column value no typecaster
    /// accepted.
    #[error("{0}")]
    Data(DbError),

    #[error("{0}")]
    NotSupported(DbError),

    #[error("{0}")]
    Internal(DbError),

    /// Server error whose SQLSTATE class has no more specific mapping.
    #[error("{0}")]
    Database(DbError),

    /// A host value has no adapter, or its adapter failed.
    #[error("can't adapt: {0}")]
    Adaptation(String),
}

impl Error {
    pub fn interface(message: impl Into<String>) -> Self {
        Error::Interface(message.into())
    }

    pub fn programming(message: impl Into<String>) -> Self {
        Error::Programming(DbError::new(message))
    }

    pub fn operational(message: impl Into<String>) -> Self {
        Error::Operational(DbError::new(message))
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Error::NotSupported(DbError::new(message))
    }

    pub fn data(message: impl Into<String>) -> Self {
        Error::Data(DbError::new(message))
    }

    /// Classify a server error by its SQLSTATE.
    pub fn from_server(diag: Box<Diagnostics>) -> Self {
        let err = DbError::from_diagnostics(diag);
        let class = err
            .sqlstate
            .as_deref()
            .and_then(|s| s.get(..2))
            .unwrap_or_default();
        match class {
            "0A" => Error::NotSupported(err),
            "20" | "21" | "3D" | "3F" | "42" | "44" => Error::Programming(err),
            "22" => Error::Data(err),
            "23" => Error::Integrity(err),
            "24" | "25" | "2B" | "2D" | "2F" | "38" | "39" | "3B" | "F0" | "P0" | "XX" => {
                Error::Internal(err)
            }
            "26" | "27" | "28" | "34" | "40" | "53" | "54" | "55" | "57" | "58" | "HV" => {
                Error::Operational(err)
            }
            _ => Error::Database(err),
        }
    }

    fn db_error(&self) -> Option<&DbError> {
        match self {
            Error::Operational(e)
            | Error::Programming(e)
            | Error::Integrity(e)
            | Error::Data(e)
            | Error::NotSupported(e)
            | Error::Internal(e)
            | Error::Database(e) => Some(e),
            _ => None,
        }
    }

    /// SQLSTATE code, verbatim from the server.
    pub fn sqlstate(&self) -> Option<&str> {
        self.db_error().and_then(|e| e.sqlstate.as_deref())
    }

    /// Server diagnostics attached to the error.
    pub fn diag(&self) -> Option<&Diagnostics> {
        self.db_error().and_then(|e| e.diag.as_deref())
    }

    /// The failed conversion behind a typecast error.
    pub fn typecast(&self) -> Option<&TypecastError> {
        match self {
            Error::Data(e) => e.typecast.as_deref(),
            _ => None,
        }
    }

    /// The statement was canceled by `Connection::cancel`.
    pub fn is_query_canceled(&self) -> bool {
        self.sqlstate() == Some(QUERY_CANCELED)
    }
}

impl From<PgError> for Error {
    fn from(err: PgError) -> Self {
        match err {
            PgError::Server(diag) => Error::from_server(diag),
            PgError::Type(msg) => Error::data(msg),
            PgError::ConnectionClosed => Error::interface("connection already closed"),
            PgError::StatementNotFound(_) => Error::programming(err.to_string()),
            PgError::Io(_)
            | PgError::Protocol(_)
            | PgError::Auth(_)
            | PgError::Tls(_)
            | PgError::UnexpectedEof
            | PgError::Timeout => Error::operational(err.to_string()),
        }
    }
}

impl From<TypecastError> for Error {
    fn from(err: TypecastError) -> Self {
        Error::Data(DbError {
            message: err.to_string(),
            sqlstate: None,
            diag: None,
            typecast: Some(Box::new(err)),
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

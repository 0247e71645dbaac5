//! PostgreSQL wire protocol implementation.
//!
//! Everything in this module is free of connection state:
//! - `protocol`: frontend message encoding and resumable backend parsing
//! - `types`: PostgreSQL value model with text and binary codecs
//! - `statement`: prepared statement cache
//! - `scram`: SCRAM-SHA-256 client
//! - `transport`: non-blocking byte transports
//! - `tls`: rustls transport (feature `tls`)
//! - `replication`: replication CopyData messages and LSNs

pub mod error;
pub mod protocol;
pub mod replication;
pub mod scram;
pub mod statement;
#[cfg(feature = "tls")]
pub mod tls;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

pub use error::{Diagnostics, PgError, PgResult};
pub use protocol::{BackendMessage, FieldDescription, Format, TransactionStatus};
pub use replication::Lsn;
pub use statement::{PreparedStatement, SharedColumns};
pub use transport::{Interest, ShutdownHandle, Transport};
pub use types::{Interval, Numeric, Oid, PgValue};

//! pgbridge: a poll-driven PostgreSQL adapter.
//!
//! The crate speaks the PostgreSQL v3 protocol through a sans-IO state
//! machine. Connections run either in sync mode, where every call blocks
//! until the server answers, or in async mode, where the caller drives
//! [`Connection::poll`] from its own event loop (or lets
//! [`AsyncConnection`] do it on tokio).
//!
//! Values cross the boundary through a process-wide [`Registry`]:
//! adapters turn application values into SQL literals or bound parameters,
//! typecasters turn column data back into [`PgValue`]s.
//!
//! ```no_run
//! use pgbridge::{connect, params};
//!
//! # fn main() -> pgbridge::Result<()> {
//! let conn = connect("postgresql://app@localhost/app")?;
//! let mut cur = conn.cursor();
//! cur.execute("SELECT id, name FROM users WHERE id = %s", params![42])?;
//! for row in cur.fetchall()? {
//!     let name: String = row.get(1)?;
//!     println!("{}", name);
//! }
//! conn.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod lobject;
pub mod pg;
pub mod registry;
pub mod replication;
#[cfg(feature = "tokio")]
pub mod runtime;
pub mod sql;

#[cfg(test)]
pub(crate) mod mock;

pub use config::{Config, ReplicationMode, SslMode};
pub use connection::{
    CancelToken, Connection, IsolationLevel, Notify, PollResult, SessionOptions, Status,
};
pub use cursor::{Column, CopyFile, CopyOptions, Cursor, Row, ScrollMode};
pub use error::{DbError, Error, Result, TypecastError};
pub use lobject::{LargeObject, LoMode, Whence};
pub use pg::{Diagnostics, Lsn, Oid, PgValue, TransactionStatus};
pub use registry::{Adaptable, FromValue, Registry, SharedRegistry};
pub use replication::{ReplicationCursor, ReplicationMessage, ReplicationSlot};
#[cfg(feature = "tokio")]
pub use runtime::AsyncConnection;
pub use sql::{quote_ident, quote_literal, Params};

/// Connect in sync mode using a URL or `key=value` connection string.
pub fn connect(dsn: &str) -> Result<Connection> {
    Connection::connect(Config::parse(dsn)?)
}

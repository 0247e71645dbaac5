//! Connections: a poll-driven state machine behind a shareable handle.
//!
//! A [`Connection`] runs in one of two modes:
//! - sync: every call drives the machine until the command finishes,
//!   blocking on the socket between polls
//! - async: calls only queue work; the caller drives [`Connection::poll`]
//!   from its own event loop and waits on [`Connection::fileno`]
//!
//! Outside autocommit mode the first command after a transaction ends is
//! preceded by `BEGIN`, sent as its own request.

mod cancel;
mod machine;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::Config;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::pg::protocol::{Format, TransactionStatus};
use crate::pg::transport::{ShutdownHandle, SocketTransport, Transport};
use crate::pg::types::{Oid, PgValue};
use crate::pg::{Diagnostics, PgResult};
use crate::registry::{self, CasterMap, SharedRegistry};
use crate::sql::Quoting;

pub use cancel::CancelToken;
pub use machine::{BackendKey, Notify, PollResult, QueryResult, Status, MAX_NOTICES};
pub(crate) use machine::{CommandMode, CopyState, Machine, Outcome, Step};

/// Transaction isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', " ").as_str() {
            "read uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(Error::programming(format!("bad isolation level: '{}'", other))),
        }
    }
}

/// Session characteristics for [`Connection::set_session`]; `None` leaves a
/// setting unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub readonly: Option<bool>,
    pub deferrable: Option<bool>,
    pub autocommit: Option<bool>,
}

pub(crate) struct ConnInner {
    pub(crate) machine: Machine,
    pub(crate) casters: Arc<CasterMap>,
    pub(crate) registry: SharedRegistry,
    autocommit: bool,
    isolation_level: Option<IsolationLevel>,
    readonly: Option<bool>,
    deferrable: Option<bool>,
    async_mode: bool,
    /// Large-object function OIDs, looked up on first use.
    pub(crate) lo_functions: Option<HashMap<String, Oid>>,
}

impl ConnInner {
    fn new(machine: Machine, async_mode: bool) -> Self {
        let autocommit = async_mode || machine.config().replication.is_some();
        Self {
            machine,
            casters: Arc::new(CasterMap::new()),
            registry: registry::global(),
            autocommit,
            isolation_level: None,
            readonly: None,
            deferrable: None,
            async_mode,
            lo_functions: None,
        }
    }

    pub(crate) fn is_async(&self) -> bool {
        self.async_mode
    }

    pub(crate) fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.machine.status() {
            Status::Closed => Err(Error::interface("connection already closed")),
            Status::Error => Err(Error::interface("connection is broken; close or reset it")),
            _ => Ok(()),
        }
    }

    /// Fail for operations that only exist in sync mode.
    pub(crate) fn ensure_sync(&self, operation: &str) -> Result<()> {
        self.ensure_open()?;
        if self.async_mode {
            return Err(Error::programming(format!(
                "{} cannot be used in asynchronous mode",
                operation
            )));
        }
        Ok(())
    }

    pub(crate) fn quoting(&self) -> Quoting {
        Quoting {
            standard_conforming_strings: self.machine.parameter("standard_conforming_strings")
                == Some("on"),
        }
    }

    fn begin_sql(&self) -> String {
        let mut sql = String::from("BEGIN");
        if let Some(level) = self.isolation_level {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        match self.readonly {
            Some(true) => sql.push_str(" READ ONLY"),
            Some(false) => sql.push_str(" READ WRITE"),
            None => {}
        }
        match self.deferrable {
            Some(true) => sql.push_str(" DEFERRABLE"),
            Some(false) => sql.push_str(" NOT DEFERRABLE"),
            None => {}
        }
        sql
    }

    /// Steps running `step`, opening a transaction first when needed.
    pub(crate) fn with_begin(&self, step: Step) -> Vec<Step> {
        let mut steps = Vec::with_capacity(2);
        if !self.autocommit && self.machine.transaction_status() == TransactionStatus::Idle {
            steps.push(Step::query(self.begin_sql().as_bytes()));
        }
        steps.push(step);
        steps
    }

    /// Run a command to completion.
    pub(crate) fn run(&mut self, steps: Vec<Step>) -> Result<Outcome> {
        let id = self.machine.begin_command(steps, CommandMode::Normal)?;
        self.finish(id)
    }

    /// Drive the command `id` until it finishes.
    pub(crate) fn finish(&mut self, id: u64) -> Result<Outcome> {
        while self.machine.drive(None)? != PollResult::Done {}
        self.machine
            .take_outcome(id)
            .ok_or_else(|| Error::interface("the command's result was lost"))
    }

    /// Run a simple query, inside the current transaction if one is needed.
    pub(crate) fn simple_query(&mut self, sql: &str) -> Result<Outcome> {
        let steps = self.with_begin(Step::query(sql.as_bytes()));
        self.run(steps)?.into_result()
    }

    /// Run `sql` outside of any implicit transaction handling.
    fn raw_query(&mut self, sql: &str) -> Result<Outcome> {
        self.run(vec![Step::query(sql.as_bytes())])?.into_result()
    }

    /// Decode one value with the connection's casters over the registry's.
    pub(crate) fn typecast(&self, oid: Oid, raw: &[u8], format: Format) -> PgResult<PgValue> {
        let registry = self.registry.read();
        registry::Casters::new(Some(&self.casters), &registry).cast(oid, raw, format)
    }
}

/// Whether to send SSLRequest for this configuration.
fn request_ssl(config: &Config) -> Result<bool> {
    if config.is_unix_socket() {
        return Ok(false);
    }
    #[cfg(feature = "tls")]
    {
        Ok(config.sslmode.requests_ssl())
    }
    #[cfg(not(feature = "tls"))]
    {
        if config.sslmode.requires_ssl() {
            return Err(Error::not_supported(format!(
                "sslmode={} requires the `tls` feature",
                config.sslmode.as_str()
            )));
        }
        Ok(false)
    }
}

/// Open a socket to the configured server. TCP connects block, bounded by
/// the connect timeout.
fn open_transport(config: &Config) -> Result<Box<dyn Transport>> {
    let transport = if config.is_unix_socket() {
        #[cfg(unix)]
        {
            SocketTransport::connect_unix(&config.host, config.port)
        }
        #[cfg(not(unix))]
        {
            Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
        }
    } else {
        SocketTransport::connect_tcp(&config.host, config.port, config.connect_timeout)
    };
    transport
        .map(|t| Box::new(t) as Box<dyn Transport>)
        .map_err(|e| {
            Error::operational(format!(
                "could not connect to server at \"{}\", port {}: {}",
                config.host, config.port, e
            ))
        })
}

/// Drive a fresh machine through the handshake.
fn handshake(machine: &mut Machine) -> Result<()> {
    let deadline = machine
        .config()
        .connect_timeout
        .map(|timeout| Instant::now() + timeout);
    while machine.drive(deadline)? != PollResult::Done {}
    Ok(())
}

/// Parse `server_version` into the `MMmmpp` integer form (`150004` for
/// 15.4, `90603` for 9.6.3).
pub(crate) fn parse_server_version(version: &str) -> i32 {
    let numeric: String = version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let parts: Vec<i32> = numeric
        .split('.')
        .filter(|p| !p.is_empty())
        .map(|p| p.parse().unwrap_or(0))
        .collect();
    match parts.as_slice() {
        [] => 0,
        [major] => major * 10000,
        [major, minor, ..] if *major >= 10 => major * 10000 + minor,
        [major, minor] => major * 10000 + minor * 100,
        [major, minor, patch, ..] => major * 10000 + minor * 100 + patch,
    }
}

/// A handle to one server connection.
///
/// Clones share the connection; commands are serialized by its lock. The
/// cancel token and a socket shutdown handle live outside that lock so a
/// blocked command can be canceled or aborted from another thread.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Mutex<ConnInner>>,
    cancel: Arc<Mutex<Option<CancelToken>>>,
    socket: Arc<Mutex<Option<ShutdownHandle>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f
                .debug_struct("Connection")
                .field("dsn", &inner.machine.config().dsn())
                .field("status", &inner.machine.status())
                .finish(),
            None => f.debug_struct("Connection").finish_non_exhaustive(),
        }
    }
}

impl Connection {
    /// Connect in sync mode.
    pub fn connect(config: Config) -> Result<Self> {
        info!(host = %config.host, port = config.port, database = config.database(), "connecting");
        let transport = open_transport(&config)?;
        Self::connect_with_transport(transport, config)
    }

    /// Connect in sync mode over an already open transport.
    pub fn connect_with_transport(transport: Box<dyn Transport>, config: Config) -> Result<Self> {
        let conn = Self::start(transport, config, false)?;
        {
            let mut inner = conn.lock();
            if let Err(err) = handshake(&mut inner.machine) {
                inner.machine.abort();
                return Err(err);
            }
        }
        conn.refresh_cancel_token();
        Ok(conn)
    }

    /// Start connecting in async mode; drive [`poll`](Self::poll) until it
    /// returns `Done`.
    ///
    /// Async connections are always in autocommit mode.
    pub fn connect_async(config: Config) -> Result<Self> {
        let transport = open_transport(&config)?;
        Self::start_with_transport(transport, config)
    }

    /// Start connecting in async mode over an already open transport.
    pub fn start_with_transport(transport: Box<dyn Transport>, config: Config) -> Result<Self> {
        Self::start(transport, config, true)
    }

    fn start(transport: Box<dyn Transport>, config: Config, async_mode: bool) -> Result<Self> {
        let ssl = request_ssl(&config)?;
        let socket = transport.shutdown_handle();
        let machine = Machine::start(transport, config, ssl);
        Ok(Self {
            inner: Arc::new(Mutex::new(ConnInner::new(machine, async_mode))),
            cancel: Arc::new(Mutex::new(None)),
            socket: Arc::new(Mutex::new(socket)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock()
    }

    fn refresh_cancel_token(&self) {
        let token = {
            let inner = self.lock();
            inner
                .machine
                .backend_key()
                .map(|key| CancelToken::new(inner.machine.config(), key))
        };
        *self.cancel.lock() = token;
    }

    /// Make progress on the handshake or the command in flight without
    /// blocking.
    pub fn poll(&self) -> Result<PollResult> {
        let (result, connected) = {
            let mut inner = self.lock();
            let was_connecting = inner.machine.status() == Status::Connecting;
            let result = inner.machine.poll()?;
            (result, was_connecting && inner.machine.is_idle())
        };
        if connected {
            self.refresh_cancel_token();
        }
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------------

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.clone(), None)
    }

    /// A server-side cursor, declared on its first `execute`.
    pub fn named_cursor(&self, name: impl Into<String>) -> Cursor {
        Cursor::new(self.clone(), Some(name.into()))
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    pub fn commit(&self) -> Result<()> {
        self.end_transaction("COMMIT")
    }

    pub fn rollback(&self) -> Result<()> {
        self.end_transaction("ROLLBACK")
    }

    fn end_transaction(&self, sql: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_sync(&sql.to_ascii_lowercase())?;
        if inner.machine.transaction_status() == TransactionStatus::Idle {
            return Ok(());
        }
        debug!(command = sql, "ending transaction");
        inner.raw_query(sql)?;
        Ok(())
    }

    pub fn autocommit(&self) -> bool {
        self.lock().autocommit
    }

    pub fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        self.set_session(SessionOptions {
            autocommit: Some(autocommit),
            ..SessionOptions::default()
        })
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.lock().isolation_level
    }

    /// Change the characteristics of the transactions that follow.
    pub fn set_session(&self, options: SessionOptions) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_sync("set_session")?;
        if inner.machine.transaction_status() != TransactionStatus::Idle {
            return Err(Error::programming(
                "set_session cannot be used inside a transaction",
            ));
        }
        if options.autocommit == Some(false) && inner.machine.config().replication.is_some() {
            return Err(Error::programming(
                "replication connections are always in autocommit mode",
            ));
        }

        if let Some(level) = options.isolation_level {
            inner.isolation_level = Some(level);
        }
        if let Some(readonly) = options.readonly {
            inner.readonly = Some(readonly);
        }
        if let Some(deferrable) = options.deferrable {
            inner.deferrable = Some(deferrable);
        }
        if let Some(autocommit) = options.autocommit {
            inner.autocommit = autocommit;
        }

        // In autocommit mode there is no BEGIN to carry the characteristics.
        let has_characteristics = options.isolation_level.is_some()
            || options.readonly.is_some()
            || options.deferrable.is_some();
        if inner.autocommit && has_characteristics {
            let characteristics = inner.begin_sql();
            let sql = format!(
                "SET SESSION CHARACTERISTICS AS TRANSACTION{}",
                characteristics.trim_start_matches("BEGIN")
            );
            inner.raw_query(&sql)?;
        }
        debug!(?options, "session characteristics changed");
        Ok(())
    }

    /// Return the session to the state it had right after connecting; a
    /// broken connection is re-established.
    pub fn reset(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.async_mode {
                return Err(Error::programming(
                    "reset cannot be used in asynchronous mode",
                ));
            }
            match inner.machine.status() {
                Status::Closed => return Err(Error::interface("connection already closed")),
                Status::Error => {
                    info!("re-establishing broken connection");
                    let config = inner.machine.config().clone();
                    let ssl = request_ssl(&config)?;
                    let transport = open_transport(&config)?;
                    let socket = transport.shutdown_handle();
                    let mut machine = Machine::start(transport, config, ssl);
                    handshake(&mut machine)?;
                    inner.machine = machine;
                    *self.socket.lock() = socket;
                }
                _ => {
                    if inner.machine.transaction_status() != TransactionStatus::Idle {
                        inner.raw_query("ABORT")?;
                    }
                    if inner.machine.config().replication.is_none() {
                        inner.raw_query("RESET ALL; SET SESSION AUTHORIZATION DEFAULT")?;
                    }
                }
            }
            inner.autocommit = inner.machine.config().replication.is_some();
            inner.isolation_level = None;
            inner.readonly = None;
            inner.deferrable = None;
            inner.lo_functions = None;
        }
        self.refresh_cancel_token();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Session information
    // ------------------------------------------------------------------------

    pub fn status(&self) -> Status {
        self.lock().machine.status()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.lock().machine.transaction_status()
    }

    pub fn is_async(&self) -> bool {
        self.lock().async_mode
    }

    pub fn is_busy(&self) -> bool {
        self.status() == Status::Busy
    }

    pub fn closed(&self) -> bool {
        self.status() == Status::Closed
    }

    /// A run-time parameter reported by the server, like `server_version`.
    pub fn get_parameter_status(&self, name: &str) -> Option<String> {
        self.lock().machine.parameter(name).map(str::to_string)
    }

    /// Server version as an integer: `150004` for 15.4.
    pub fn server_version(&self) -> i32 {
        self.lock()
            .machine
            .parameter("server_version")
            .map(parse_server_version)
            .unwrap_or(0)
    }

    /// Frontend/backend protocol major version.
    pub fn protocol_version(&self) -> i32 {
        3
    }

    pub fn encoding(&self) -> String {
        self.get_parameter_status("client_encoding")
            .unwrap_or_else(|| "UTF8".to_string())
    }

    /// Connection string with the password masked.
    pub fn dsn(&self) -> String {
        self.lock().machine.config().dsn()
    }

    pub fn config(&self) -> Config {
        self.lock().machine.config().clone()
    }

    pub fn get_backend_pid(&self) -> Option<i32> {
        self.lock().machine.backend_key().map(|key| key.process_id)
    }

    /// OS handle of the socket, for registration with an event loop.
    pub fn fileno(&self) -> Option<i64> {
        self.lock().machine.raw_fd()
    }

    /// Notices received so far, oldest first.
    pub fn notices(&self) -> Vec<Diagnostics> {
        self.lock().machine.notices().cloned().collect()
    }

    /// Remove and return the queued notices.
    pub fn take_notices(&self) -> Vec<Diagnostics> {
        self.lock().machine.take_notices()
    }

    /// Remove and return the queued notifications.
    pub fn notifies(&self) -> Vec<Notify> {
        self.lock().machine.take_notifies()
    }

    /// Block until notifications arrive or `timeout` expires; an empty result
    /// means the timeout expired.
    pub fn wait_notifies(&self, timeout: Option<Duration>) -> Result<Vec<Notify>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        inner.ensure_sync("wait_notifies")?;
        loop {
            if inner.machine.poll()? != PollResult::Done {
                return Err(Error::programming(
                    "wait_notifies cannot be used while a command is in progress",
                ));
            }
            let notifies = inner.machine.take_notifies();
            if !notifies.is_empty() {
                return Ok(notifies);
            }
            if let Err(err) = inner.machine.wait(PollResult::NeedRead, deadline) {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Typecasters
    // ------------------------------------------------------------------------

    /// Install a caster used by this connection only, shadowing the global
    /// registry.
    pub fn register_typecaster(
        &self,
        oid: Oid,
        caster: impl Fn(&[u8], Format) -> PgResult<PgValue> + Send + Sync + 'static,
    ) {
        debug!(%oid, "registering connection typecaster");
        let mut inner = self.lock();
        Arc::make_mut(&mut inner.casters).insert(oid, Arc::new(caster));
    }

    /// Use `registry` instead of the process-wide one.
    pub fn set_registry(&self, registry: SharedRegistry) {
        self.lock().registry = registry;
    }

    // ------------------------------------------------------------------------
    // Cancel and close
    // ------------------------------------------------------------------------

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel.lock().clone()
    }

    /// Ask the server to cancel the command in flight. Best effort.
    pub fn cancel(&self) -> Result<()> {
        let token = self
            .cancel_token()
            .ok_or_else(|| Error::interface("no cancel key available for this connection"))?;
        token.cancel()
    }

    /// Send Terminate and close the socket. Closing twice is harmless.
    pub fn close(&self) {
        self.lock().machine.close();
        *self.cancel.lock() = None;
        *self.socket.lock() = None;
    }

    /// Drop the socket without Terminate, e.g. after a deadline passed.
    ///
    /// Safe to call from another thread while a sync command is blocked:
    /// the socket is shut down first, which fails the command and releases
    /// the connection.
    pub fn abort(&self) {
        if let Some(socket) = self.socket.lock().take() {
            if let Err(e) = socket.shutdown() {
                debug!(error = %e, "socket shutdown failed");
            }
        }
        self.lock().machine.abort();
        *self.cancel.lock() = None;
    }
}

//! Sans-IO connection state machine.
//!
//! The machine owns the transport plus the read and write buffers. Each call
//! to [`Machine::poll`] makes as much progress as it can without blocking and
//! reports what it needs next. Sync callers wait on the transport between
//! polls; async callers register the socket with their own reactor.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pg::protocol::{
    parse_response, BackendMessage, BindMessage, CloseMessage, CopyDataMessage, CopyDoneMessage,
    CopyFailMessage, DescribeMessage, ExecuteMessage, Format, FrontendMessage,
    FunctionCallMessage, ParseMessage, PasswordMessage, QueryMessage, RawRow,
    SaslInitialResponseMessage, SaslResponseMessage, SslRequestMessage, SyncMessage,
    TerminateMessage, TransactionStatus,
};
use crate::pg::scram::{ScramClient, SCRAM_SHA_256};
use crate::pg::statement::{PreparedStatement, SharedColumns, StatementCache, StatementKey};
use crate::pg::transport::{Detached, Interest, Transport};
use crate::pg::types::{Oid, PgValue};
use crate::pg::{Diagnostics, PgError};

/// Notices kept per connection; older ones are dropped first.
pub const MAX_NOTICES: usize = 50;

const READ_CHUNK: usize = 8192;

/// How long `close` waits to hand the Terminate message to the socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// What a poll achieved, or what it needs before it can continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Wait until the socket is writable, then poll again.
    NeedWrite,
    /// Wait until the socket is readable, then poll again.
    NeedRead,
    /// An intermediate event is available (copy data, a replication
    /// message); poll again to continue.
    Ready,
    /// The current operation finished.
    Done,
}

/// Connection status as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    /// Connected, no transaction open.
    Idle,
    /// Inside a transaction block, possibly a failed one.
    InTransaction,
    /// A command is in flight.
    Busy,
    /// The connection broke; only `close` and `reset` are allowed.
    Error,
    Closed,
}

/// An asynchronous notification raised by `NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub pid: i32,
    pub channel: String,
    pub payload: String,
}

/// Process id and secret key the server handed out for cancel requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// One completed statement result.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Option<SharedColumns>,
    pub rows: Vec<RawRow>,
    /// Command tag, such as `INSERT 0 1`.
    pub tag: Option<String>,
}

/// How a command treats the COPY sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandMode {
    /// Plain statements; COPY is refused.
    Normal,
    /// COPY FROM STDIN / TO STDOUT through the copy methods.
    Copy,
    /// Replication stream over CopyBoth.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyState {
    None,
    In,
    Out,
    Both,
}

/// One request terminated by ReadyForQuery.
pub(crate) struct Step {
    bytes: BytesMut,
    prepared: Option<(StatementKey, PreparedStatement)>,
    /// Extended-protocol steps carry Close for evicted statements.
    extended: bool,
}

impl Step {
    /// A simple-protocol Query.
    pub(crate) fn query(sql: &[u8]) -> Self {
        Self {
            bytes: QueryMessage {
                query: sql.to_vec(),
            }
            .encode(),
            prepared: None,
            extended: false,
        }
    }

    /// A fastpath function call.
    pub(crate) fn function_call(function: Oid, args: Vec<Option<Vec<u8>>>) -> Self {
        Self {
            bytes: FunctionCallMessage { function, args }.encode(),
            prepared: None,
            extended: false,
        }
    }
}

/// What a finished command produced.
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    pub id: u64,
    /// The last statement result; earlier ones of a multi-statement query
    /// are discarded.
    pub result: Option<QueryResult>,
    pub error: Option<Error>,
    pub function_result: Option<Option<Bytes>>,
}

impl Outcome {
    pub(crate) fn into_result(self) -> Result<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

struct Command {
    id: u64,
    mode: CommandMode,
    steps: VecDeque<Step>,
    current_prepared: Option<(StatementKey, PreparedStatement)>,
    partial: QueryResult,
    result: Option<QueryResult>,
    error: Option<Box<Diagnostics>>,
    misuse: Option<&'static str>,
    function_result: Option<Option<Bytes>>,
    copy: CopyState,
    copy_done_sent: bool,
    copy_data: VecDeque<Bytes>,
}

impl Command {
    fn into_outcome(self) -> Outcome {
        // A misuse is reported over the server error it provoked.
        let error = match (self.error, self.misuse) {
            (_, Some(message)) => Some(Error::programming(message)),
            (Some(diag), None) => Some(Error::from_server(diag)),
            (None, None) => None,
        };
        Outcome {
            id: self.id,
            result: self.result,
            error,
            function_result: self.function_result,
        }
    }
}

enum Auth {
    Pending,
    Scram(ScramClient),
    Done,
}

enum Phase {
    /// Waiting for the single-byte answer to SSLRequest.
    SslResponse,
    Authenticating(Auth),
    Idle,
    Busy(Box<Command>),
    Broken,
    Closed,
}

fn encode_into(buf: &mut BytesMut, message: &impl FrontendMessage) {
    buf.extend_from_slice(&message.encode());
}

/// Queue a step's bytes, closing evicted statements ahead of an extended step.
fn queue_step(wbuf: &mut BytesMut, pending_close: &mut Vec<String>, step: &Step) {
    if step.extended {
        for name in pending_close.drain(..) {
            trace!(statement = %name, "closing evicted statement");
            encode_into(wbuf, &CloseMessage { kind: b'S', name });
        }
    }
    wbuf.extend_from_slice(&step.bytes);
}

fn unexpected(message: &BackendMessage, during: &str) -> Error {
    PgError::Protocol(format!("unexpected {} {}", message.name(), during)).into()
}

/// MD5 password hash: "md5" + md5(md5(password + user) + salt), hex encoded.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}

pub struct Machine {
    transport: Box<dyn Transport>,
    config: Config,
    phase: Phase,
    rbuf: BytesMut,
    wbuf: BytesMut,
    parameters: HashMap<String, String>,
    backend_key: Option<BackendKey>,
    tx_status: TransactionStatus,
    /// Bumped every time a transaction block ends.
    tx_epoch: u64,
    notices: VecDeque<Diagnostics>,
    notifies: VecDeque<Notify>,
    statements: StatementCache,
    pending_close: Vec<String>,
    next_id: u64,
    outcome: Option<Outcome>,
}

impl Machine {
    /// Start the handshake over a freshly opened transport.
    pub(crate) fn start(transport: Box<dyn Transport>, config: Config, request_ssl: bool) -> Self {
        let statements = StatementCache::new(config.statement_cache_capacity.max(1));
        let mut machine = Self {
            transport,
            config,
            phase: Phase::SslResponse,
            rbuf: BytesMut::with_capacity(READ_CHUNK),
            wbuf: BytesMut::new(),
            parameters: HashMap::new(),
            backend_key: None,
            tx_status: TransactionStatus::Idle,
            tx_epoch: 0,
            notices: VecDeque::new(),
            notifies: VecDeque::new(),
            statements,
            pending_close: Vec::new(),
            next_id: 0,
            outcome: None,
        };
        if request_ssl {
            debug!(sslmode = machine.config.sslmode.as_str(), "requesting SSL");
            encode_into(&mut machine.wbuf, &SslRequestMessage);
        } else {
            machine.send_startup();
        }
        machine
    }

    fn send_startup(&mut self) {
        debug!(user = %self.config.user, database = self.config.database(), "sending startup message");
        let startup = self.config.startup_message();
        encode_into(&mut self.wbuf, &startup);
        self.phase = Phase::Authenticating(Auth::Pending);
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn status(&self) -> Status {
        match self.phase {
            Phase::SslResponse | Phase::Authenticating(_) => Status::Connecting,
            Phase::Busy(_) => Status::Busy,
            Phase::Broken => Status::Error,
            Phase::Closed => Status::Closed,
            Phase::Idle => match self.tx_status {
                TransactionStatus::Idle => Status::Idle,
                TransactionStatus::InTransaction | TransactionStatus::Failed => {
                    Status::InTransaction
                }
            },
        }
    }

    /// Transaction status from the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    pub(crate) fn tx_epoch(&self) -> u64 {
        self.tx_epoch
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    pub fn raw_fd(&self) -> Option<i64> {
        self.transport.raw_fd()
    }

    pub(crate) fn notices(&self) -> impl Iterator<Item = &Diagnostics> {
        self.notices.iter()
    }

    pub(crate) fn take_notices(&mut self) -> Vec<Diagnostics> {
        self.notices.drain(..).collect()
    }

    pub(crate) fn take_notifies(&mut self) -> Vec<Notify> {
        self.notifies.drain(..).collect()
    }

    pub(crate) fn clear_statement_cache(&mut self) {
        self.statements.clear();
        self.pending_close.clear();
    }

    pub(crate) fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    pub(crate) fn copy_state(&self) -> CopyState {
        match &self.phase {
            Phase::Busy(cmd) => cmd.copy,
            _ => CopyState::None,
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.phase {
            Phase::Closed => Err(Error::interface("connection already closed")),
            Phase::Broken => Err(Error::interface(
                "connection is broken; close or reset it",
            )),
            _ => Ok(()),
        }
    }

    fn mark_broken(&mut self, err: &Error) {
        if matches!(self.phase, Phase::Closed | Phase::Broken) {
            return;
        }
        warn!(error = %err, "connection broken");
        self.wbuf.clear();
        self.phase = Phase::Broken;
    }

    fn set_tx_status(&mut self, status: TransactionStatus) {
        if status != self.tx_status {
            debug!(from = ?self.tx_status, to = ?status, "transaction status changed");
            if status == TransactionStatus::Idle {
                self.tx_epoch += 1;
            }
            self.tx_status = status;
        }
    }

    fn push_notice(&mut self, notice: Diagnostics) {
        debug!(message = notice.message(), "server notice");
        if self.notices.len() >= MAX_NOTICES {
            warn!(limit = MAX_NOTICES, "notice queue full, dropping the oldest notice");
            self.notices.pop_front();
        }
        self.notices.push_back(notice);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    /// Queue a command. Only one command may be in flight.
    pub(crate) fn begin_command(&mut self, steps: Vec<Step>, mode: CommandMode) -> Result<u64> {
        self.check_open()?;
        match self.phase {
            Phase::Idle => {}
            Phase::Busy(_) => {
                return Err(Error::programming("another command is already in progress"))
            }
            _ => return Err(Error::interface("connection is not ready")),
        }
        let mut steps: VecDeque<Step> = steps.into();
        let first = steps
            .pop_front()
            .ok_or_else(|| Error::interface("nothing to execute"))?;
        queue_step(&mut self.wbuf, &mut self.pending_close, &first);
        self.next_id += 1;
        self.outcome = None;
        trace!(id = self.next_id, steps = steps.len() + 1, ?mode, "command started");
        self.phase = Phase::Busy(Box::new(Command {
            id: self.next_id,
            mode,
            steps,
            current_prepared: first.prepared,
            partial: QueryResult::default(),
            result: None,
            error: None,
            misuse: None,
            function_result: None,
            copy: CopyState::None,
            copy_done_sent: false,
            copy_data: VecDeque::new(),
        }));
        Ok(self.next_id)
    }

    /// Outcome of the command `id`, once it finished.
    pub(crate) fn take_outcome(&mut self, id: u64) -> Option<Outcome> {
        match &self.outcome {
            Some(outcome) if outcome.id == id => self.outcome.take(),
            _ => None,
        }
    }

    /// A Parse/Bind/Describe/Execute/Sync step with binary parameters and
    /// results, reusing a cached prepared statement when possible.
    pub(crate) fn extended_step(&mut self, sql: &str, params: &[PgValue]) -> Result<Step> {
        let mut param_types = Vec::with_capacity(params.len());
        let mut param_formats = Vec::with_capacity(params.len());
        let mut values = Vec::with_capacity(params.len());
        for param in params {
            match param {
                PgValue::Null => {
                    param_types.push(Oid::UNSPECIFIED);
                    param_formats.push(Format::Binary);
                    values.push(None);
                }
                // Untyped text lets the server infer the parameter type.
                PgValue::Text(s) => {
                    param_types.push(Oid::UNSPECIFIED);
                    param_formats.push(Format::Text);
                    values.push(Some(s.as_bytes().to_vec()));
                }
                other => {
                    param_types.push(other.type_oid());
                    param_formats.push(Format::Binary);
                    values.push(Some(other.encode_binary()?));
                }
            }
        }

        let mut bytes = BytesMut::new();

        let key = StatementKey::new(sql, param_types.clone());
        let (statement, prepared) = match self.statements.get(&key) {
            Some(stmt) => (stmt.name.clone(), None),
            None => {
                let name = self.statements.next_statement_name();
                encode_into(
                    &mut bytes,
                    &ParseMessage {
                        name: name.clone(),
                        query: sql.to_string(),
                        param_types: param_types.clone(),
                    },
                );
                let stmt = PreparedStatement {
                    name: name.clone(),
                    query: sql.to_string(),
                    param_types,
                };
                (name, Some((key, stmt)))
            }
        };

        encode_into(
            &mut bytes,
            &BindMessage {
                portal: String::new(),
                statement,
                param_formats,
                params: values,
                result_formats: vec![Format::Binary],
            },
        );
        encode_into(
            &mut bytes,
            &DescribeMessage {
                kind: b'P',
                name: String::new(),
            },
        );
        encode_into(
            &mut bytes,
            &ExecuteMessage {
                portal: String::new(),
                max_rows: 0,
            },
        );
        encode_into(&mut bytes, &SyncMessage);
        Ok(Step {
            bytes,
            prepared,
            extended: true,
        })
    }

    // ------------------------------------------------------------------------
    // COPY
    // ------------------------------------------------------------------------

    /// Queue one CopyData message during COPY FROM STDIN or streaming.
    pub(crate) fn put_copy_data(&mut self, data: &[u8]) -> Result<()> {
        match &self.phase {
            Phase::Busy(cmd) if matches!(cmd.copy, CopyState::In | CopyState::Both) => {
                encode_into(&mut self.wbuf, &CopyDataMessage { data });
                Ok(())
            }
            _ => Err(Error::programming("no COPY in progress")),
        }
    }

    /// Finish the client side of a COPY; `error` aborts a COPY FROM STDIN.
    pub(crate) fn end_copy(&mut self, error: Option<&str>) -> Result<()> {
        let Phase::Busy(cmd) = &mut self.phase else {
            return Err(Error::programming("no COPY in progress"));
        };
        match (cmd.copy, error) {
            (CopyState::In, None) => {
                encode_into(&mut self.wbuf, &CopyDoneMessage);
                cmd.copy = CopyState::None;
            }
            (CopyState::In, Some(message)) => {
                encode_into(
                    &mut self.wbuf,
                    &CopyFailMessage {
                        message: message.to_string(),
                    },
                );
                cmd.copy = CopyState::None;
            }
            (CopyState::Both, _) if !cmd.copy_done_sent => {
                encode_into(&mut self.wbuf, &CopyDoneMessage);
                cmd.copy_done_sent = true;
            }
            _ => {}
        }
        Ok(())
    }

    /// Next CopyData payload received from the server.
    pub(crate) fn take_copy_data(&mut self) -> Option<Bytes> {
        match &mut self.phase {
            Phase::Busy(cmd) => cmd.copy_data.pop_front(),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    /// Make progress without blocking.
    pub fn poll(&mut self) -> Result<PollResult> {
        self.check_open()?;
        let result = match self.poll_inner() {
            Err(err) if err.sqlstate().is_none() => {
                Err(self.last_server_error().unwrap_or(err))
            }
            other => other,
        };
        if let Err(err) = &result {
            self.mark_broken(err);
        }
        result
    }

    /// The error a server reported before the transport failed, if any.
    fn last_server_error(&mut self) -> Option<Error> {
        let mut chunk = [0u8; READ_CHUNK];
        while let Ok(n @ 1..) = self.transport.try_read(&mut chunk) {
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
        let mut diag = match &mut self.phase {
            Phase::Busy(cmd) => cmd.error.take(),
            _ => None,
        };
        while let Ok(Some(message)) = parse_response(&mut self.rbuf) {
            if let BackendMessage::ErrorResponse { fields } = message {
                diag.get_or_insert_with(|| Box::new(Diagnostics::from_fields(&fields)));
            }
        }
        diag.map(Error::from_server)
    }

    fn poll_inner(&mut self) -> Result<PollResult> {
        loop {
            if !self.flush()? {
                return Ok(PollResult::NeedWrite);
            }

            if matches!(self.phase, Phase::SslResponse) {
                if let Some(&answer) = self.rbuf.first() {
                    self.rbuf.advance(1);
                    self.handle_ssl_response(answer)?;
                    continue;
                }
            } else if let Some(message) = parse_response(&mut self.rbuf)? {
                trace!(message = message.name(), "received");
                if let Some(result) = self.handle(message)? {
                    return Ok(result);
                }
                continue;
            }

            if !self.read_some()? {
                if self.transport.has_pending_output() {
                    continue;
                }
                return Ok(match &self.phase {
                    Phase::Idle => PollResult::Done,
                    Phase::Busy(cmd) if cmd.copy == CopyState::In => PollResult::Ready,
                    _ => PollResult::NeedRead,
                });
            }
        }
    }

    /// Write out buffered bytes; `false` when the socket is full.
    fn flush(&mut self) -> Result<bool> {
        while !self.wbuf.is_empty() {
            match self.transport.try_write(&self.wbuf) {
                Ok(0) => return Err(PgError::Io(io::ErrorKind::WriteZero.into()).into()),
                Ok(n) => self.wbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(PgError::Io(e).into()),
            }
        }
        if self.transport.has_pending_output() {
            match self.transport.flush_output() {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(PgError::Io(e).into()),
            }
            if self.transport.has_pending_output() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Read what is available; `false` when nothing is.
    fn read_some(&mut self) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.transport.try_read(&mut chunk) {
                Ok(0) => return Err(PgError::UnexpectedEof.into()),
                Ok(n) => {
                    self.rbuf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(PgError::Io(e).into()),
            }
        }
    }

    /// Block on the transport for what `result` asks for.
    pub(crate) fn wait(&mut self, result: PollResult, deadline: Option<Instant>) -> Result<()> {
        let interest = match result {
            PollResult::NeedRead => Interest::Read,
            PollResult::NeedWrite => Interest::Write,
            PollResult::Ready | PollResult::Done => return Ok(()),
        };
        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::operational("timeout expired"));
                }
                Some(deadline - now)
            }
            None => None,
        };
        match self.transport.wait(interest, timeout) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                Err(Error::operational("timeout expired"))
            }
            Err(e) => {
                let err = Error::from(PgError::Io(e));
                self.mark_broken(&err);
                Err(err)
            }
        }
    }

    /// Poll and wait until the operation finishes or an event is ready.
    pub(crate) fn drive(&mut self, deadline: Option<Instant>) -> Result<PollResult> {
        loop {
            match self.poll()? {
                result @ (PollResult::Ready | PollResult::Done) => return Ok(result),
                wait_for => self.wait(wait_for, deadline)?,
            }
        }
    }

    /// Write out buffered bytes, blocking as needed.
    pub(crate) fn flush_blocking(&mut self) -> Result<()> {
        self.check_open()?;
        loop {
            match self.flush() {
                Ok(true) => return Ok(()),
                Ok(false) => self.wait(PollResult::NeedWrite, None)?,
                Err(err) => {
                    self.mark_broken(&err);
                    return Err(err);
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------------

    fn handle(&mut self, message: BackendMessage) -> Result<Option<PollResult>> {
        match message {
            BackendMessage::NoticeResponse { fields } => {
                self.push_notice(Diagnostics::from_fields(&fields));
                Ok(None)
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                debug!(%channel, pid = process_id, "notification");
                self.notifies.push_back(Notify {
                    pid: process_id,
                    channel,
                    payload,
                });
                Ok(None)
            }
            BackendMessage::ParameterStatus { name, value } => {
                debug!(%name, %value, "parameter status");
                self.parameters.insert(name, value);
                Ok(None)
            }
            other => match self.phase {
                Phase::Authenticating(_) => self.handle_startup(other),
                Phase::Busy(_) => self.handle_command(other),
                Phase::Idle => self.handle_idle(other),
                Phase::SslResponse | Phase::Broken | Phase::Closed => {
                    Err(unexpected(&other, "outside a session"))
                }
            },
        }
    }

    fn handle_ssl_response(&mut self, answer: u8) -> Result<()> {
        if !self.rbuf.is_empty() {
            return Err(PgError::Protocol(
                "received unencrypted data after SSL response".to_string(),
            )
            .into());
        }
        match answer {
            b'S' => self.upgrade_tls()?,
            b'N' if self.config.sslmode.requires_ssl() => {
                return Err(Error::operational(
                    "server does not support SSL, but SSL was required",
                ))
            }
            b'N' => debug!("server declined SSL, continuing unencrypted"),
            // An old server answering SSLRequest with an error message.
            b'E' => {
                return Err(PgError::Protocol("server rejected the SSL request".to_string()).into())
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "invalid response to SSL negotiation: {:?}",
                    other as char
                ))
                .into())
            }
        }
        self.send_startup();
        Ok(())
    }

    #[cfg(feature = "tls")]
    fn upgrade_tls(&mut self) -> Result<()> {
        let inner = mem::replace(&mut self.transport, Box::new(Detached));
        let tls = crate::pg::tls::TlsTransport::new(inner, &self.config.host, self.config.sslmode)?;
        self.transport = Box::new(tls);
        debug!("TLS session started");
        Ok(())
    }

    #[cfg(not(feature = "tls"))]
    fn upgrade_tls(&mut self) -> Result<()> {
        Err(Error::not_supported(
            "SSL support is not compiled in (enable the `tls` feature)",
        ))
    }

    fn password(&self) -> Result<String> {
        self.config
            .password
            .clone()
            .ok_or_else(|| PgError::Auth("no password supplied".to_string()).into())
    }

    fn handle_startup(&mut self, message: BackendMessage) -> Result<Option<PollResult>> {
        match message {
            BackendMessage::AuthenticationOk => {
                debug!("authenticated");
                self.phase = Phase::Authenticating(Auth::Done);
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = self.password()?;
                encode_into(&mut self.wbuf, &PasswordMessage { password });
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let password = md5_password(&self.config.user, &self.password()?, &salt);
                encode_into(&mut self.wbuf, &PasswordMessage { password });
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::Auth(format!(
                        "none of the server's SASL mechanisms are supported: {}",
                        mechanisms.join(", ")
                    ))
                    .into());
                }
                let client = ScramClient::new(&self.password()?);
                encode_into(
                    &mut self.wbuf,
                    &SaslInitialResponseMessage {
                        mechanism: SCRAM_SHA_256.to_string(),
                        data: client.client_first_message(),
                    },
                );
                self.phase = Phase::Authenticating(Auth::Scram(client));
            }
            BackendMessage::AuthenticationSASLContinue { ref data } => {
                let Phase::Authenticating(Auth::Scram(client)) = &mut self.phase else {
                    return Err(unexpected(&message, "without a SASL exchange"));
                };
                let response = client
                    .process_server_first(data)
                    .map_err(|e| PgError::Auth(e.to_string()))?;
                encode_into(&mut self.wbuf, &SaslResponseMessage { data: response });
            }
            BackendMessage::AuthenticationSASLFinal { ref data } => {
                let Phase::Authenticating(Auth::Scram(client)) = &self.phase else {
                    return Err(unexpected(&message, "without a SASL exchange"));
                };
                client
                    .verify_server_final(data)
                    .map_err(|e| PgError::Auth(e.to_string()))?;
            }
            BackendMessage::AuthenticationUnsupported { code } => {
                return Err(PgError::Auth(format!(
                    "authentication method {} is not supported",
                    code
                ))
                .into());
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend_key = Some(BackendKey {
                    process_id,
                    secret_key,
                });
            }
            BackendMessage::NegotiateProtocolVersion {
                newest_minor,
                unrecognized,
            } => {
                debug!(newest_minor, ?unrecognized, "server negotiated protocol version");
            }
            BackendMessage::ErrorResponse { fields } => {
                return Err(Error::from_server(Box::new(Diagnostics::from_fields(&fields))));
            }
            BackendMessage::ReadyForQuery { status } => {
                if !matches!(self.phase, Phase::Authenticating(Auth::Done)) {
                    return Err(unexpected(&message, "before authentication completed"));
                }
                self.tx_status = status;
                self.phase = Phase::Idle;
                debug!(
                    server_version = self.parameter("server_version").unwrap_or("unknown"),
                    "connection ready"
                );
                return Ok(Some(PollResult::Done));
            }
            other => return Err(unexpected(&other, "during startup")),
        }
        Ok(None)
    }

    fn handle_idle(&mut self, message: BackendMessage) -> Result<Option<PollResult>> {
        match message {
            BackendMessage::ErrorResponse { fields } => {
                let diag = Diagnostics::from_fields(&fields);
                match diag.severity_nonlocalized.as_deref().or(diag.severity.as_deref()) {
                    Some("FATAL") | Some("PANIC") => Err(Error::from_server(Box::new(diag))),
                    _ => {
                        warn!(message = diag.message(), "error reported outside a command");
                        self.push_notice(diag);
                        Ok(None)
                    }
                }
            }
            other => Err(unexpected(&other, "while idle")),
        }
    }

    fn handle_command(&mut self, message: BackendMessage) -> Result<Option<PollResult>> {
        let Phase::Busy(cmd) = &mut self.phase else {
            return Ok(None);
        };
        match message {
            BackendMessage::RowDescription { fields } => {
                cmd.partial = QueryResult {
                    columns: Some(Arc::new(fields)),
                    ..QueryResult::default()
                };
            }
            BackendMessage::DataRow { values } => cmd.partial.rows.push(values),
            BackendMessage::CommandComplete { tag } => {
                cmd.partial.tag = Some(tag);
                cmd.result = Some(mem::take(&mut cmd.partial));
            }
            BackendMessage::EmptyQueryResponse => {
                cmd.misuse.get_or_insert("can't execute an empty query");
                cmd.result = None;
            }
            BackendMessage::ErrorResponse { fields } => {
                if cmd.error.is_none() {
                    cmd.error = Some(Box::new(Diagnostics::from_fields(&fields)));
                }
                cmd.partial = QueryResult::default();
                cmd.copy = CopyState::None;
            }
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended
            | BackendMessage::ParameterDescription { .. } => {}
            BackendMessage::CopyInResponse { .. } => {
                if cmd.mode == CommandMode::Copy {
                    cmd.copy = CopyState::In;
                    return Ok(Some(PollResult::Ready));
                }
                cmd.misuse
                    .get_or_insert("can't execute COPY FROM: use the copy_from() method instead");
                encode_into(
                    &mut self.wbuf,
                    &CopyFailMessage {
                        message: "COPY FROM STDIN is not supported by execute".to_string(),
                    },
                );
            }
            BackendMessage::CopyOutResponse { .. } => {
                cmd.copy = CopyState::Out;
                if cmd.mode != CommandMode::Copy {
                    cmd.misuse
                        .get_or_insert("can't execute COPY TO: use the copy_to() method instead");
                }
            }
            BackendMessage::CopyBothResponse { .. } => {
                cmd.copy = CopyState::Both;
                if cmd.mode == CommandMode::Streaming {
                    return Ok(Some(PollResult::Ready));
                }
                cmd.misuse.get_or_insert(
                    "can't start replication with execute: use start_replication() instead",
                );
                encode_into(&mut self.wbuf, &CopyDoneMessage);
                cmd.copy_done_sent = true;
            }
            BackendMessage::CopyData { data } => {
                if cmd.mode != CommandMode::Normal && cmd.misuse.is_none() {
                    cmd.copy_data.push_back(data);
                    return Ok(Some(PollResult::Ready));
                }
            }
            BackendMessage::CopyDone => {
                if cmd.copy == CopyState::Both && !cmd.copy_done_sent {
                    encode_into(&mut self.wbuf, &CopyDoneMessage);
                    cmd.copy_done_sent = true;
                }
                cmd.copy = CopyState::None;
            }
            BackendMessage::FunctionCallResponse { result } => {
                cmd.function_result = Some(result);
            }
            BackendMessage::ReadyForQuery { status } => return self.step_finished(status),
            other => return Err(unexpected(&other, "during a command")),
        }
        Ok(None)
    }

    fn step_finished(&mut self, status: TransactionStatus) -> Result<Option<PollResult>> {
        self.set_tx_status(status);
        let Phase::Busy(cmd) = &mut self.phase else {
            return Ok(None);
        };

        if let Some((key, stmt)) = cmd.current_prepared.take() {
            if cmd.error.is_none() {
                if let Some(evicted) = self.statements.insert(key, stmt) {
                    self.pending_close.push(evicted);
                }
            }
        }

        if cmd.error.is_none() && cmd.misuse.is_none() {
            if let Some(mut step) = cmd.steps.pop_front() {
                cmd.current_prepared = step.prepared.take();
                cmd.copy = CopyState::None;
                cmd.copy_done_sent = false;
                queue_step(&mut self.wbuf, &mut self.pending_close, &step);
                return Ok(None);
            }
        }

        if let Phase::Busy(cmd) = mem::replace(&mut self.phase, Phase::Idle) {
            trace!(id = cmd.id, failed = cmd.error.is_some(), "command finished");
            self.outcome = Some(cmd.into_outcome());
        }
        Ok(Some(PollResult::Done))
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Send Terminate and close the socket.
    pub(crate) fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        if !matches!(self.phase, Phase::Broken) {
            self.wbuf.clear();
            encode_into(&mut self.wbuf, &TerminateMessage);
            let deadline = Instant::now() + CLOSE_TIMEOUT;
            loop {
                match self.flush() {
                    Ok(false) if self.wait(PollResult::NeedWrite, Some(deadline)).is_ok() => {}
                    _ => break,
                }
            }
        }
        self.shutdown();
        debug!("connection closed");
    }

    /// Close the socket without saying goodbye.
    pub(crate) fn abort(&mut self) {
        if !self.is_closed() {
            self.shutdown();
            debug!("connection aborted");
        }
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.transport.shutdown() {
            debug!(error = %e, "socket shutdown failed");
        }
        self.transport = Box::new(Detached);
        self.wbuf.clear();
        self.rbuf.clear();
        self.phase = Phase::Closed;
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.close();
    }
}

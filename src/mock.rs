//! Scripted in-memory backend used by the state machine tests.
//!
//! `MockServer` speaks the server side of the protocol well enough for the
//! client: startup and authentication, simple and extended queries, COPY,
//! server-side cursors, fastpath large object calls and a replication
//! stream. Statement results come from prefix rules registered by the test.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::connection::Connection;
use crate::lobject::INV_WRITE;
use crate::pg::protocol::CANCEL_REQUEST_CODE;
use crate::pg::scram::{hi, hmac_sha256, server_signature_for};
use crate::pg::transport::{Interest, Transport};
use crate::pg::types::Oid;

pub(crate) const MOCK_PID: i32 = 4242;
pub(crate) const MOCK_SECRET: i32 = 777;

const SCRAM_SALT: &[u8] = b"pgbridge-salt";
const SCRAM_ITERATIONS: u32 = 4096;
const SERVER_NONCE: &str = "c2VydmVyLW5vbmNl";

pub(crate) const LO_OPEN: u32 = 952;
pub(crate) const LO_CLOSE: u32 = 953;
pub(crate) const LOREAD: u32 = 954;
pub(crate) const LOWRITE: u32 = 955;
pub(crate) const LO_CREAT: u32 = 957;
pub(crate) const LO_UNLINK: u32 = 964;
pub(crate) const LO_CREATE: u32 = 715;
pub(crate) const LO_LSEEK64: u32 = 3170;
pub(crate) const LO_TELL64: u32 = 3171;
pub(crate) const LO_TRUNCATE64: u32 = 3172;

const LO_PROCS: &[(&str, u32)] = &[
    ("lo_open", LO_OPEN),
    ("lo_close", LO_CLOSE),
    ("loread", LOREAD),
    ("lowrite", LOWRITE),
    ("lo_creat", LO_CREAT),
    ("lo_unlink", LO_UNLINK),
    ("lo_create", LO_CREATE),
    ("lo_lseek64", LO_LSEEK64),
    ("lo_tell64", LO_TELL64),
    ("lo_truncate64", LO_TRUNCATE64),
];

#[derive(Debug, Clone)]
pub(crate) enum MockAuth {
    Trust,
    Cleartext(String),
    Md5(String),
    Scram(String),
}

/// One piece of a statement's response.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Text-format rows; `tag` defaults to `SELECT n`.
    Rows {
        columns: Vec<(String, Oid)>,
        rows: Vec<Vec<Option<String>>>,
        tag: Option<String>,
    },
    Command(String),
    Error { code: String, message: String },
    Notice(String),
    Notify { channel: String, payload: String },
    CopyOut(Vec<Vec<u8>>),
    CopyIn,
    Replication(Vec<Bytes>),
    Empty,
    /// Run until a cancel request arrives.
    Sleep,
}

impl Reply {
    pub(crate) fn rows(columns: &[(&str, Oid)], rows: &[&[Option<&str>]]) -> Self {
        Reply::Rows {
            columns: columns.iter().map(|(n, o)| (n.to_string(), *o)).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
            tag: None,
        }
    }

    pub(crate) fn error(code: &str, message: &str) -> Self {
        Reply::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn command(tag: &str) -> Self {
        Reply::Command(tag.to_string())
    }
}

enum State {
    Startup,
    Password,
    SaslInitial,
    SaslResponse {
        client_first_bare: String,
        server_first: String,
    },
    Ready,
    CopyIn,
    Streaming,
    Closed,
}

enum Flow {
    Continue,
    Stop,
    Pause,
}

struct Portal {
    sql: String,
    params: Vec<(u32, i16, Option<Vec<u8>>)>,
}

struct ServerCursor {
    columns: Vec<(String, Oid)>,
    rows: Vec<Vec<Option<String>>>,
    pos: usize,
    hold: bool,
}

#[derive(Default)]
struct LargeObjects {
    objects: HashMap<u32, Vec<u8>>,
    fds: HashMap<i32, (u32, usize, i32)>,
    next_oid: u32,
    next_fd: i32,
}

pub(crate) struct MockServer {
    auth: MockAuth,
    state: State,
    inbox: BytesMut,
    outbox: BytesMut,
    rules: Vec<(String, Vec<Reply>)>,
    tx: u8,
    skip_until_sync: bool,
    statements: HashMap<String, (String, Vec<u32>)>,
    portal: Option<Portal>,
    cursors: HashMap<String, ServerCursor>,
    lo: LargeObjects,
    copy_buffer: Vec<u8>,
    stream_ended: bool,
    sleeping: bool,
    user: String,
    /// Every simple query received.
    pub(crate) queries: Vec<String>,
    /// SQL of every Parse received.
    pub(crate) parses: Vec<String>,
    /// Statement names closed by the client.
    pub(crate) closes: Vec<String>,
    /// Standby status updates received while streaming.
    pub(crate) feedback: Vec<Bytes>,
    /// Data of the last completed COPY FROM STDIN.
    pub(crate) copy_data: Vec<u8>,
    pub(crate) startup_params: HashMap<String, String>,
    pub(crate) ssl_requests: usize,
    pub(crate) terminated: bool,
}

impl MockServer {
    pub(crate) fn new(auth: MockAuth) -> Self {
        Self {
            auth,
            state: State::Startup,
            inbox: BytesMut::new(),
            outbox: BytesMut::new(),
            rules: Vec::new(),
            tx: b'I',
            skip_until_sync: false,
            statements: HashMap::new(),
            portal: None,
            cursors: HashMap::new(),
            lo: LargeObjects {
                next_oid: 16400,
                ..LargeObjects::default()
            },
            copy_buffer: Vec::new(),
            stream_ended: false,
            sleeping: false,
            user: String::new(),
            queries: Vec::new(),
            parses: Vec::new(),
            closes: Vec::new(),
            feedback: Vec::new(),
            copy_data: Vec::new(),
            startup_params: HashMap::new(),
            ssl_requests: 0,
            terminated: false,
        }
    }

    /// Answer statements starting with `prefix` with `replies`.
    pub(crate) fn rule(mut self, prefix: &str, replies: Vec<Reply>) -> Self {
        self.rules.push((prefix.to_string(), replies));
        self
    }

    pub(crate) fn add_rule(&mut self, prefix: &str, replies: Vec<Reply>) {
        self.rules.insert(0, (prefix.to_string(), replies));
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub(crate) fn take_output(&mut self) -> BytesMut {
        self.outbox.split()
    }

    // ------------------------------------------------------------------------
    // Server-initiated messages
    // ------------------------------------------------------------------------

    pub(crate) fn push_notification(&mut self, channel: &str, payload: &str) {
        let mut body = BytesMut::new();
        body.put_i32(MOCK_PID);
        cstr(&mut body, channel);
        cstr(&mut body, payload);
        self.msg(b'A', &body);
    }

    pub(crate) fn push_notice(&mut self, message: &str) {
        self.notice("NOTICE", "00000", message);
    }

    pub(crate) fn push_copy_data(&mut self, data: &[u8]) {
        self.msg(b'd', data);
    }

    /// End a replication stream from the server side.
    pub(crate) fn end_stream(&mut self) {
        self.stream_ended = true;
        self.msg(b'c', &[]);
    }

    /// Cancel the sleeping statement; `false` when nothing is running yet.
    pub(crate) fn cancel_request(&mut self) -> bool {
        if !self.sleeping {
            return false;
        }
        self.sleeping = false;
        self.error("57014", "canceling statement due to user request");
        self.ready();
        true
    }

    /// Report a fatal error and hang up.
    pub(crate) fn push_fatal(&mut self, code: &str, message: &str) {
        self.error_fields("FATAL", code, message);
        self.state = State::Closed;
    }

    // ------------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------------

    fn msg(&mut self, tag: u8, body: &[u8]) {
        self.outbox.put_u8(tag);
        self.outbox.put_i32(body.len() as i32 + 4);
        self.outbox.put_slice(body);
    }

    fn auth(&mut self, code: i32, extra: &[u8]) {
        let mut body = BytesMut::new();
        body.put_i32(code);
        body.put_slice(extra);
        self.msg(b'R', &body);
    }

    fn parameter(&mut self, name: &str, value: &str) {
        let mut body = BytesMut::new();
        cstr(&mut body, name);
        cstr(&mut body, value);
        self.msg(b'S', &body);
    }

    fn ready(&mut self) {
        let tx = self.tx;
        self.msg(b'Z', &[tx]);
    }

    fn complete(&mut self, tag: &str) {
        let mut body = BytesMut::new();
        cstr(&mut body, tag);
        self.msg(b'C', &body);
    }

    fn error_fields(&mut self, severity: &str, code: &str, message: &str) {
        let body = diagnostic_body(severity, code, message);
        self.msg(b'E', &body);
    }

    fn error(&mut self, code: &str, message: &str) {
        self.error_fields("ERROR", code, message);
        if self.tx == b'T' {
            self.tx = b'E';
        }
    }

    fn notice(&mut self, severity: &str, code: &str, message: &str) {
        let body = diagnostic_body(severity, code, message);
        self.msg(b'N', &body);
    }

    fn row_description(&mut self, columns: &[(String, Oid, i16)]) {
        let mut body = BytesMut::new();
        body.put_i16(columns.len() as i16);
        for (name, oid, format) in columns {
            cstr(&mut body, name);
            body.put_u32(0);
            body.put_i16(0);
            body.put_u32(oid.0);
            body.put_i16(-1);
            body.put_i32(-1);
            body.put_i16(*format);
        }
        self.msg(b'T', &body);
    }

    fn data_row(&mut self, values: &[Option<&[u8]>]) {
        let mut body = BytesMut::new();
        body.put_i16(values.len() as i16);
        for value in values {
            match value {
                Some(bytes) => {
                    body.put_i32(bytes.len() as i32);
                    body.put_slice(bytes);
                }
                None => body.put_i32(-1),
            }
        }
        self.msg(b'D', &body);
    }

    fn text_rows(&mut self, columns: &[(String, Oid)], rows: &[Vec<Option<String>>]) {
        let described: Vec<_> = columns.iter().map(|(n, o)| (n.clone(), *o, 0)).collect();
        self.row_description(&described);
        for row in rows {
            let values: Vec<Option<&[u8]>> =
                row.iter().map(|v| v.as_deref().map(str::as_bytes)).collect();
            self.data_row(&values);
        }
    }

    fn copy_response(&mut self, tag: u8) {
        let mut body = BytesMut::new();
        body.put_i8(0);
        body.put_i16(0);
        self.msg(tag, &body);
    }

    // ------------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------------

    /// Consume bytes written by the client.
    pub(crate) fn receive(&mut self, data: &[u8]) {
        self.inbox.extend_from_slice(data);
        loop {
            if self.is_closed() {
                self.inbox.clear();
                return;
            }
            if matches!(self.state, State::Startup) {
                if self.inbox.len() < 4 {
                    return;
                }
                let len = i32::from_be_bytes([self.inbox[0], self.inbox[1], self.inbox[2], self.inbox[3]]) as usize;
                if self.inbox.len() < len {
                    return;
                }
                let mut body = self.inbox.split_to(len).freeze();
                body.advance(4);
                self.startup(body);
                continue;
            }
            if self.inbox.len() < 5 {
                return;
            }
            let len = i32::from_be_bytes([self.inbox[1], self.inbox[2], self.inbox[3], self.inbox[4]]) as usize;
            if self.inbox.len() < len + 1 {
                return;
            }
            let mut message = self.inbox.split_to(len + 1).freeze();
            let tag = message.get_u8();
            message.advance(4);
            self.dispatch(tag, message);
        }
    }

    fn startup(&mut self, mut body: Bytes) {
        let code = body.get_i32();
        match code {
            80877103 => {
                self.ssl_requests += 1;
                self.outbox.put_u8(b'N');
            }
            196608 => {
                while body.has_remaining() {
                    let name = get_cstr(&mut body);
                    if name.is_empty() {
                        break;
                    }
                    let value = get_cstr(&mut body);
                    self.startup_params.insert(name, value);
                }
                self.user = self.startup_params.get("user").cloned().unwrap_or_default();
                match self.auth.clone() {
                    MockAuth::Trust => self.finish_auth(),
                    MockAuth::Cleartext(_) => {
                        self.auth(3, &[]);
                        self.state = State::Password;
                    }
                    MockAuth::Md5(_) => {
                        self.auth(5, &[1, 2, 3, 4]);
                        self.state = State::Password;
                    }
                    MockAuth::Scram(_) => {
                        self.auth(10, b"SCRAM-SHA-256\0\0");
                        self.state = State::SaslInitial;
                    }
                }
            }
            other => {
                self.push_fatal("08P01", &format!("unsupported frontend protocol {}", other));
            }
        }
    }

    fn finish_auth(&mut self) {
        self.auth(0, &[]);
        self.parameter("server_version", "15.4");
        self.parameter("server_encoding", "UTF8");
        self.parameter("client_encoding", "UTF8");
        self.parameter("standard_conforming_strings", "on");
        self.parameter("DateStyle", "ISO, MDY");
        self.parameter("integer_datetimes", "on");
        let application_name = self
            .startup_params
            .get("application_name")
            .cloned()
            .unwrap_or_default();
        self.parameter("application_name", &application_name);
        let mut key = BytesMut::new();
        key.put_i32(MOCK_PID);
        key.put_i32(MOCK_SECRET);
        self.msg(b'K', &key);
        self.state = State::Ready;
        self.ready();
    }

    fn auth_failed(&mut self) {
        let message = format!("password authentication failed for user \"{}\"", self.user);
        self.push_fatal("28P01", &message);
    }

    fn dispatch(&mut self, tag: u8, mut body: Bytes) {
        if tag == b'X' {
            self.terminated = true;
            self.state = State::Closed;
            return;
        }
        match std::mem::replace(&mut self.state, State::Ready) {
            State::Password => {
                let password = get_cstr(&mut body);
                let expected = match &self.auth {
                    MockAuth::Cleartext(p) => p.clone(),
                    MockAuth::Md5(p) => {
                        let inner = format!("{:x}", md5::compute(format!("{}{}", p, self.user)));
                        let mut outer = inner.into_bytes();
                        outer.extend_from_slice(&[1, 2, 3, 4]);
                        format!("md5{:x}", md5::compute(&outer))
                    }
                    _ => String::new(),
                };
                if password == expected {
                    self.finish_auth();
                } else {
                    self.auth_failed();
                }
            }
            State::SaslInitial => {
                let _mechanism = get_cstr(&mut body);
                let len = body.get_i32() as usize;
                let client_first = String::from_utf8_lossy(&body[..len]).into_owned();
                let client_first_bare = client_first
                    .strip_prefix("n,,")
                    .unwrap_or(&client_first)
                    .to_string();
                let client_nonce = client_first_bare
                    .split(',')
                    .find_map(|part| part.strip_prefix("r="))
                    .unwrap_or_default();
                let server_first = format!(
                    "r={}{},s={},i={}",
                    client_nonce,
                    SERVER_NONCE,
                    BASE64.encode(SCRAM_SALT),
                    SCRAM_ITERATIONS
                );
                self.auth(11, server_first.as_bytes());
                self.state = State::SaslResponse {
                    client_first_bare,
                    server_first,
                };
            }
            State::SaslResponse {
                client_first_bare,
                server_first,
            } => {
                let client_final = String::from_utf8_lossy(&body).into_owned();
                let password = match &self.auth {
                    MockAuth::Scram(p) => p.clone(),
                    _ => String::new(),
                };
                match verify_scram(&password, &client_first_bare, &server_first, &client_final) {
                    Some(signature) => {
                        self.auth(12, format!("v={}", BASE64.encode(signature)).as_bytes());
                        self.finish_auth();
                    }
                    None => self.auth_failed(),
                }
            }
            State::CopyIn => self.copy_in(tag, body),
            State::Streaming => self.streaming(tag, body),
            State::Ready => self.ready_message(tag, body),
            state @ (State::Startup | State::Closed) => self.state = state,
        }
    }

    fn copy_in(&mut self, tag: u8, mut body: Bytes) {
        match tag {
            b'd' => {
                self.copy_buffer.extend_from_slice(&body);
                self.state = State::CopyIn;
            }
            b'c' => {
                self.copy_data = std::mem::take(&mut self.copy_buffer);
                let lines = self.copy_data.iter().filter(|&&b| b == b'\n').count();
                self.complete(&format!("COPY {}", lines));
                self.ready();
            }
            b'f' => {
                let reason = get_cstr(&mut body);
                self.copy_buffer.clear();
                self.error("57014", &format!("COPY from stdin failed: {}", reason));
                self.ready();
            }
            _ => self.state = State::CopyIn,
        }
    }

    fn streaming(&mut self, tag: u8, body: Bytes) {
        match tag {
            b'd' => {
                self.feedback.push(body);
                self.state = State::Streaming;
            }
            b'c' => {
                if !std::mem::take(&mut self.stream_ended) {
                    self.msg(b'c', &[]);
                }
                self.complete("START_REPLICATION");
                self.ready();
            }
            _ => self.state = State::Streaming,
        }
    }

    fn ready_message(&mut self, tag: u8, mut body: Bytes) {
        match tag {
            b'Q' => {
                let sql = get_cstr(&mut body);
                self.queries.push(sql.clone());
                self.simple_query(&sql);
            }
            b'P' if !self.skip_until_sync => {
                let name = get_cstr(&mut body);
                let sql = get_cstr(&mut body);
                let count = body.get_i16();
                let types = (0..count).map(|_| body.get_u32()).collect();
                self.parses.push(sql.clone());
                self.statements.insert(name, (sql, types));
                self.msg(b'1', &[]);
            }
            b'B' if !self.skip_until_sync => self.bind(body),
            b'D' if !self.skip_until_sync => self.describe_portal(),
            b'E' if !self.skip_until_sync => self.execute_portal(),
            b'C' => {
                let _kind = body.get_u8();
                let name = get_cstr(&mut body);
                self.statements.remove(&name);
                self.closes.push(name);
                if !self.skip_until_sync {
                    self.msg(b'3', &[]);
                }
            }
            b'S' => {
                self.skip_until_sync = false;
                self.portal = None;
                self.ready();
            }
            b'F' => {
                self.function_call(body);
                self.ready();
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------------
    // Simple query
    // ------------------------------------------------------------------------

    fn simple_query(&mut self, sql: &str) {
        if sql.trim().is_empty() {
            self.msg(b'I', &[]);
            self.ready();
            return;
        }
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            match self.statement(statement) {
                Flow::Continue => {}
                Flow::Stop => break,
                Flow::Pause => return,
            }
        }
        self.ready();
    }

    fn replies_for(&self, sql: &str) -> Option<Vec<Reply>> {
        self.rules
            .iter()
            .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
            .map(|(_, replies)| replies.clone())
    }

    fn end_transaction(&mut self) {
        self.tx = b'I';
        self.lo.fds.clear();
        self.cursors.retain(|_, cursor| cursor.hold);
    }

    fn statement(&mut self, sql: &str) -> Flow {
        let first = sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        let ends_transaction = matches!(first.as_str(), "COMMIT" | "END" | "ROLLBACK" | "ABORT");
        if self.tx == b'E' && !ends_transaction {
            self.error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            );
            return Flow::Stop;
        }

        match first.as_str() {
            "BEGIN" | "START" => {
                if self.tx == b'T' {
                    self.notice("WARNING", "25001", "there is already a transaction in progress");
                }
                self.tx = b'T';
                self.complete("BEGIN");
                return Flow::Continue;
            }
            "COMMIT" | "END" => {
                let tag = if self.tx == b'E' { "ROLLBACK" } else { "COMMIT" };
                self.end_transaction();
                self.complete(tag);
                return Flow::Continue;
            }
            "ROLLBACK" | "ABORT" => {
                self.end_transaction();
                self.complete("ROLLBACK");
                return Flow::Continue;
            }
            "DECLARE" => return self.declare(sql),
            "FETCH" => return self.fetch(sql),
            "MOVE" => return self.move_cursor(sql),
            "CLOSE" => {
                let name = unquote(sql.split_whitespace().nth(1).unwrap_or_default());
                if self.cursors.remove(&name).is_none() {
                    self.error("34000", &format!("cursor \"{}\" does not exist", name));
                    return Flow::Stop;
                }
                self.complete("CLOSE CURSOR");
                return Flow::Continue;
            }
            "NOTIFY" => {
                let rest = sql[6..].trim();
                let (channel, payload) = rest.split_once(',').unwrap_or((rest, ""));
                let payload = payload.trim().trim_matches('\'');
                self.push_notification(channel.trim(), payload);
                self.complete("NOTIFY");
                return Flow::Continue;
            }
            _ => {}
        }

        if sql.contains("pg_catalog.pg_proc") {
            let columns = vec![("proname".to_string(), Oid::NAME), ("oid".to_string(), Oid::OID)];
            let rows: Vec<Vec<Option<String>>> = LO_PROCS
                .iter()
                .map(|(name, oid)| vec![Some(name.to_string()), Some(oid.to_string())])
                .collect();
            self.text_rows(&columns, &rows);
            self.complete(&format!("SELECT {}", rows.len()));
            return Flow::Continue;
        }

        let replies = self
            .replies_for(sql)
            .unwrap_or_else(|| vec![Reply::Command(default_tag(&first))]);
        for reply in replies {
            match reply {
                Reply::Rows { columns, rows, tag } => {
                    self.text_rows(&columns, &rows);
                    let tag = tag.unwrap_or_else(|| format!("SELECT {}", rows.len()));
                    self.complete(&tag);
                }
                Reply::Command(tag) => self.complete(&tag),
                Reply::Error { code, message } => {
                    self.error(&code, &message);
                    return Flow::Stop;
                }
                Reply::Notice(message) => self.notice("NOTICE", "00000", &message),
                Reply::Notify { channel, payload } => self.push_notification(&channel, &payload),
                Reply::CopyOut(chunks) => {
                    self.copy_response(b'H');
                    for chunk in &chunks {
                        self.msg(b'd', chunk);
                    }
                    self.msg(b'c', &[]);
                    self.complete(&format!("COPY {}", chunks.len()));
                }
                Reply::CopyIn => {
                    self.copy_response(b'G');
                    self.copy_buffer.clear();
                    self.state = State::CopyIn;
                    return Flow::Pause;
                }
                Reply::Replication(messages) => {
                    self.copy_response(b'W');
                    for message in &messages {
                        self.msg(b'd', message);
                    }
                    self.state = State::Streaming;
                    return Flow::Pause;
                }
                Reply::Empty => self.msg(b'I', &[]),
                Reply::Sleep => {
                    self.sleeping = true;
                    return Flow::Pause;
                }
            }
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------------
    // Server-side cursors
    // ------------------------------------------------------------------------

    fn declare(&mut self, sql: &str) -> Flow {
        let name = unquote(sql.split_whitespace().nth(1).unwrap_or_default());
        let upper = sql.to_ascii_uppercase();
        let hold = upper.contains(" WITH HOLD ");
        if self.tx != b'T' && !hold {
            self.error(
                "25P01",
                "DECLARE CURSOR can only be used in transaction blocks",
            );
            return Flow::Stop;
        }
        let query = upper
            .find(" FOR ")
            .map(|at| sql[at + 5..].trim())
            .unwrap_or_default();
        let (columns, rows) = match self.replies_for(query) {
            Some(replies) => replies
                .into_iter()
                .find_map(|reply| match reply {
                    Reply::Rows { columns, rows, .. } => Some((columns, rows)),
                    _ => None,
                })
                .unwrap_or_default(),
            None => (Vec::new(), Vec::new()),
        };
        self.cursors.insert(
            name,
            ServerCursor {
                columns,
                rows,
                pos: 0,
                hold,
            },
        );
        self.complete("DECLARE CURSOR");
        Flow::Continue
    }

    fn fetch(&mut self, sql: &str) -> Flow {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let name = unquote(words.last().copied().unwrap_or_default());
        let amount = words.get(2).copied().unwrap_or("1");
        let Some(cursor) = self.cursors.get_mut(&name) else {
            self.error("34000", &format!("cursor \"{}\" does not exist", name));
            return Flow::Stop;
        };
        let available = cursor.rows.len().saturating_sub(cursor.pos);
        let count = if amount.eq_ignore_ascii_case("ALL") {
            available
        } else {
            amount.parse::<usize>().unwrap_or(1).min(available)
        };
        let rows = cursor.rows[cursor.pos..cursor.pos + count].to_vec();
        cursor.pos += count;
        let columns = cursor.columns.clone();
        self.text_rows(&columns, &rows);
        self.complete(&format!("FETCH {}", count));
        Flow::Continue
    }

    fn move_cursor(&mut self, sql: &str) -> Flow {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let name = unquote(words.last().copied().unwrap_or_default());
        let absolute = words.get(1).is_some_and(|w| w.eq_ignore_ascii_case("ABSOLUTE"));
        let amount: i64 = words
            .get(if absolute { 2 } else { 1 })
            .and_then(|w| w.parse().ok())
            .unwrap_or(0);
        let Some(cursor) = self.cursors.get_mut(&name) else {
            self.error("34000", &format!("cursor \"{}\" does not exist", name));
            return Flow::Stop;
        };
        let target = if absolute { amount } else { cursor.pos as i64 + amount };
        let target = target.clamp(0, cursor.rows.len() as i64) as usize;
        let moved = target.abs_diff(cursor.pos);
        cursor.pos = target;
        self.complete(&format!("MOVE {}", moved));
        Flow::Continue
    }

    // ------------------------------------------------------------------------
    // Extended query
    // ------------------------------------------------------------------------

    fn bind(&mut self, mut body: Bytes) {
        let _portal = get_cstr(&mut body);
        let statement = get_cstr(&mut body);
        let format_count = body.get_i16();
        let formats: Vec<i16> = (0..format_count).map(|_| body.get_i16()).collect();
        let param_count = body.get_i16() as usize;
        let mut values = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.split_to(len as usize).to_vec()));
            }
        }
        let Some((sql, types)) = self.statements.get(&statement).cloned() else {
            self.error(
                "26000",
                &format!("prepared statement \"{}\" does not exist", statement),
            );
            self.skip_until_sync = true;
            return;
        };
        if self.tx == b'E' {
            self.error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            );
            self.skip_until_sync = true;
            return;
        }
        let params = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                let oid = types.get(i).copied().unwrap_or(0);
                let format = match formats.len() {
                    0 => 0,
                    1 => formats[0],
                    _ => formats.get(i).copied().unwrap_or(0),
                };
                (oid, format, value)
            })
            .collect();
        self.portal = Some(Portal { sql, params });
        self.msg(b'2', &[]);
    }

    fn describe_portal(&mut self) {
        let Some(portal) = self.portal.take() else {
            self.msg(b'n', &[]);
            return;
        };
        if portal.sql.starts_with("SELECT $") {
            let columns: Vec<_> = portal
                .params
                .iter()
                .map(|(oid, format, _)| {
                    let oid = if *oid == 0 { Oid::TEXT } else { Oid(*oid) };
                    ("?column?".to_string(), oid, *format)
                })
                .collect();
            self.row_description(&columns);
        } else if let Some(Reply::Rows { columns, .. }) = self
            .replies_for(&portal.sql)
            .and_then(|replies| replies.into_iter().find(|r| matches!(r, Reply::Rows { .. })))
        {
            let described: Vec<_> = columns.into_iter().map(|(n, o)| (n, o, 0)).collect();
            self.row_description(&described);
        } else {
            self.msg(b'n', &[]);
        }
        self.portal = Some(portal);
    }

    fn execute_portal(&mut self) {
        let Some(portal) = self.portal.take() else {
            return;
        };
        if portal.sql.starts_with("SELECT $") {
            let values: Vec<Option<&[u8]>> =
                portal.params.iter().map(|(_, _, v)| v.as_deref()).collect();
            self.data_row(&values);
            self.complete("SELECT 1");
            return;
        }
        let first = portal
            .sql
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        let replies = self
            .replies_for(&portal.sql)
            .unwrap_or_else(|| vec![Reply::Command(default_tag(&first))]);
        for reply in replies {
            match reply {
                Reply::Rows { rows, tag, .. } => {
                    for row in &rows {
                        let values: Vec<Option<&[u8]>> =
                            row.iter().map(|v| v.as_deref().map(str::as_bytes)).collect();
                        self.data_row(&values);
                    }
                    let tag = tag.unwrap_or_else(|| format!("SELECT {}", rows.len()));
                    self.complete(&tag);
                }
                Reply::Command(tag) => self.complete(&tag),
                Reply::Error { code, message } => {
                    self.error(&code, &message);
                    self.skip_until_sync = true;
                    return;
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Fastpath large objects
    // ------------------------------------------------------------------------

    fn function_call(&mut self, mut body: Bytes) {
        let function = body.get_u32();
        let format_count = body.get_i16();
        for _ in 0..format_count {
            body.get_i16();
        }
        let arg_count = body.get_i16();
        let mut args: Vec<Bytes> = Vec::new();
        for _ in 0..arg_count {
            let len = body.get_i32();
            args.push(if len < 0 {
                Bytes::new()
            } else {
                body.split_to(len as usize)
            });
        }
        if self.tx == b'E' {
            self.error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            );
            return;
        }

        match self.large_object_call(function, &mut args) {
            Ok(result) => {
                let mut out = BytesMut::new();
                out.put_i32(result.len() as i32);
                out.put_slice(&result);
                self.msg(b'V', &out);
            }
            Err((code, message)) => self.error(code, &message),
        }
        // Outside a transaction block every call is its own transaction.
        if self.tx == b'I' {
            self.lo.fds.clear();
        }
    }

    fn large_object_call(
        &mut self,
        function: u32,
        args: &mut [Bytes],
    ) -> Result<Vec<u8>, (&'static str, String)> {
        let int4 = |arg: &Bytes| -> i32 { arg.clone().get_i32() };
        let int8 = |arg: &Bytes| -> i64 { arg.clone().get_i64() };
        let lo = &mut self.lo;
        let bad_fd = |fd: i32| ("42704", format!("invalid large-object descriptor: {}", fd));

        match function {
            LO_CREAT => {
                let oid = lo.next_oid;
                lo.next_oid += 1;
                lo.objects.insert(oid, Vec::new());
                Ok(oid.to_be_bytes().to_vec())
            }
            LO_CREATE => {
                let mut oid = args[0].clone().get_u32();
                if oid == 0 {
                    oid = lo.next_oid;
                    lo.next_oid += 1;
                }
                if lo.objects.contains_key(&oid) {
                    return Err(("42710", format!("large object {} already exists", oid)));
                }
                lo.objects.insert(oid, Vec::new());
                Ok(oid.to_be_bytes().to_vec())
            }
            LO_OPEN => {
                let oid = args[0].clone().get_u32();
                let mode = int4(&args[1]);
                if !lo.objects.contains_key(&oid) {
                    return Err(("42704", format!("large object {} does not exist", oid)));
                }
                let fd = lo.next_fd;
                lo.next_fd += 1;
                lo.fds.insert(fd, (oid, 0, mode));
                Ok(fd.to_be_bytes().to_vec())
            }
            LO_CLOSE => {
                let fd = int4(&args[0]);
                lo.fds.remove(&fd).ok_or_else(|| bad_fd(fd))?;
                Ok(0i32.to_be_bytes().to_vec())
            }
            LOREAD => {
                let fd = int4(&args[0]);
                let len = int4(&args[1]).max(0) as usize;
                let (oid, pos, _) = lo.fds.get_mut(&fd).ok_or_else(|| bad_fd(fd))?;
                let data = lo.objects.get(oid).cloned().unwrap_or_default();
                let start = (*pos).min(data.len());
                let end = (start + len).min(data.len());
                *pos = end;
                Ok(data[start..end].to_vec())
            }
            LOWRITE => {
                let fd = int4(&args[0]);
                let chunk = args[1].to_vec();
                let (oid, pos, mode) = lo.fds.get_mut(&fd).ok_or_else(|| bad_fd(fd))?;
                if *mode & INV_WRITE == 0 {
                    return Err((
                        "55000",
                        format!("large object descriptor {} was not opened for writing", fd),
                    ));
                }
                let data = lo.objects.entry(*oid).or_default();
                if data.len() < *pos {
                    data.resize(*pos, 0);
                }
                let overlap = (data.len() - *pos).min(chunk.len());
                data[*pos..*pos + overlap].copy_from_slice(&chunk[..overlap]);
                data.extend_from_slice(&chunk[overlap..]);
                *pos += chunk.len();
                Ok((chunk.len() as i32).to_be_bytes().to_vec())
            }
            LO_LSEEK64 => {
                let fd = int4(&args[0]);
                let offset = int8(&args[1]);
                let whence = int4(&args[2]);
                let (oid, pos, _) = lo.fds.get_mut(&fd).ok_or_else(|| bad_fd(fd))?;
                let size = lo.objects.get(oid).map_or(0, Vec::len) as i64;
                let base = match whence {
                    1 => *pos as i64,
                    2 => size,
                    _ => 0,
                };
                let target = base + offset;
                if target < 0 {
                    return Err(("22023", format!("invalid seek offset: {}", target)));
                }
                *pos = target as usize;
                Ok(target.to_be_bytes().to_vec())
            }
            LO_TELL64 => {
                let fd = int4(&args[0]);
                let (_, pos, _) = lo.fds.get(&fd).ok_or_else(|| bad_fd(fd))?;
                Ok((*pos as i64).to_be_bytes().to_vec())
            }
            LO_TRUNCATE64 => {
                let fd = int4(&args[0]);
                let len = int8(&args[1]).max(0) as usize;
                let (oid, _, _) = lo.fds.get(&fd).ok_or_else(|| bad_fd(fd))?;
                if let Some(data) = lo.objects.get_mut(oid) {
                    data.resize(len, 0);
                }
                Ok(0i32.to_be_bytes().to_vec())
            }
            LO_UNLINK => {
                let oid = args[0].clone().get_u32();
                if lo.objects.remove(&oid).is_none() {
                    return Err(("42704", format!("large object {} does not exist", oid)));
                }
                Ok(1i32.to_be_bytes().to_vec())
            }
            other => Err(("42883", format!("function with OID {} does not exist", other))),
        }
    }

    /// Contents of a large object, for assertions.
    pub(crate) fn large_object(&self, oid: u32) -> Option<&[u8]> {
        self.lo.objects.get(&oid).map(Vec::as_slice)
    }
}

fn cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn get_cstr(buf: &mut Bytes) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance((end + 1).min(buf.len()));
    s
}

fn diagnostic_body(severity: &str, code: &str, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    cstr(&mut body, severity);
    body.put_u8(b'V');
    cstr(&mut body, severity);
    body.put_u8(b'C');
    cstr(&mut body, code);
    body.put_u8(b'M');
    cstr(&mut body, message);
    body.put_u8(0);
    body
}

fn unquote(name: &str) -> String {
    name.trim_matches('"').replace("\"\"", "\"")
}

fn default_tag(first: &str) -> String {
    match first {
        "INSERT" => "INSERT 0 1".to_string(),
        "UPDATE" => "UPDATE 1".to_string(),
        "DELETE" => "DELETE 1".to_string(),
        "SELECT" => "SELECT 0".to_string(),
        "CREATE" => "CREATE TABLE".to_string(),
        "DROP" => "DROP TABLE".to_string(),
        other => other.to_string(),
    }
}

/// Check a SCRAM client-final message; the server signature on success.
fn verify_scram(
    password: &str,
    client_first_bare: &str,
    server_first: &str,
    client_final: &str,
) -> Option<[u8; 32]> {
    let (without_proof, proof) = client_final.rsplit_once(",p=")?;
    let proof = BASE64.decode(proof).ok()?;
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let salted = hi(password, SCRAM_SALT, SCRAM_ITERATIONS).ok()?;
    let client_key = hmac_sha256(&salted, b"Client Key").ok()?;
    let stored_key = Sha256::digest(client_key);
    let signature = hmac_sha256(&stored_key, auth_message.as_bytes()).ok()?;
    let expected: Vec<u8> = client_key
        .iter()
        .zip(signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();
    if proof != expected {
        return None;
    }
    server_signature_for(&salted, &auth_message).ok()
}

// ============================================================================
// Transports
// ============================================================================

/// In-memory transport whose peer is a `MockServer`.
pub(crate) struct MockTransport {
    server: Arc<Mutex<MockServer>>,
    read_chunk: usize,
}

impl MockTransport {
    pub(crate) fn new(server: Arc<Mutex<MockServer>>) -> Self {
        Self {
            server,
            read_chunk: usize::MAX,
        }
    }

    /// Hand out at most `read_chunk` bytes per read.
    pub(crate) fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }
}

impl Transport for MockTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut server = self.server.lock();
        if server.outbox.is_empty() {
            if server.is_closed() {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.read_chunk).min(server.outbox.len());
        buf[..n].copy_from_slice(&server.outbox[..n]);
        server.outbox.advance(n);
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut server = self.server.lock();
        if server.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        server.receive(buf);
        Ok(buf.len())
    }

    fn wait(&mut self, interest: Interest, _timeout: Option<Duration>) -> io::Result<()> {
        let server = self.server.lock();
        match interest {
            Interest::Write => Ok(()),
            Interest::Read if !server.outbox.is_empty() || server.is_closed() => Ok(()),
            Interest::Read => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn mock_config() -> Config {
    Config::new()
        .user("alice")
        .password("secret")
        .dbname("test")
        .application_name("pgbridge-tests")
}

/// Sync connection to `server`.
pub(crate) fn connect(server: MockServer) -> (Connection, Arc<Mutex<MockServer>>) {
    connect_with(server, mock_config(), usize::MAX)
}

pub(crate) fn connect_with(
    server: MockServer,
    config: Config,
    read_chunk: usize,
) -> (Connection, Arc<Mutex<MockServer>>) {
    let server = Arc::new(Mutex::new(server));
    let transport = MockTransport::new(Arc::clone(&server)).with_read_chunk(read_chunk);
    let conn = Connection::connect_with_transport(Box::new(transport), config)
        .expect("mock handshake failed");
    (conn, server)
}

/// Serve one client over TCP from a background thread. Later connections
/// to the same port are read as cancel requests.
pub(crate) fn serve_tcp(mut server: MockServer) -> io::Result<(u16, JoinHandle<MockServer>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let handle = thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return server;
        };
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                for request in listener.incoming().flatten() {
                    if read_cancel_request(request) == Some((MOCK_PID, MOCK_SECRET)) {
                        cancel.store(true, Ordering::SeqCst);
                    }
                }
            });
        }
        if stream.set_read_timeout(Some(Duration::from_millis(10))).is_err() {
            return server;
        }
        let mut buf = [0u8; 8192];
        loop {
            if cancel.load(Ordering::SeqCst) && server.cancel_request() {
                cancel.store(false, Ordering::SeqCst);
            }
            match stream.read(&mut buf) {
                Ok(0) => return server,
                Ok(n) => server.receive(&buf[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(_) => return server,
            }
            let out = server.take_output();
            if !out.is_empty() && stream.write_all(&out).is_err() {
                return server;
            }
            if server.is_closed() {
                return server;
            }
        }
    });
    Ok((port, handle))
}

fn read_cancel_request(mut stream: TcpStream) -> Option<(i32, i32)> {
    let mut packet = [0u8; 16];
    stream.read_exact(&mut packet).ok()?;
    let mut packet = &packet[..];
    if packet.get_i32() != 16 || packet.get_i32() != CANCEL_REQUEST_CODE {
        return None;
    }
    Some((packet.get_i32(), packet.get_i32()))
}

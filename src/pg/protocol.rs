//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic version number of an SSLRequest.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic version number of a CancelRequest.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Upper bound on a single backend message, to reject garbage lengths early.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_code(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgError::Protocol(format!("invalid format code {}", other))),
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!(
                "invalid transaction status {:?}",
                other as char
            ))),
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Frame a tagged message: tag, length (including itself), body.
fn tagged(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        // Placeholder for length (will be filled in at the end)
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstring(&mut buf, "user");
        put_cstring(&mut buf, &self.user);

        if let Some(ref db) = self.database {
            put_cstring(&mut buf, "database");
            put_cstring(&mut buf, db);
        }

        for (key, value) in &self.options {
            put_cstring(&mut buf, key);
            put_cstring(&mut buf, value);
        }

        // Terminator
        buf.put_u8(0);

        // Fill in length (includes length field itself)
        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        buf
    }
}

/// SSLRequest, sent before the startup message to ask for TLS.
#[derive(Debug, Clone, Copy)]
pub struct SslRequestMessage;

impl FrontendMessage for SslRequestMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
        buf
    }
}

/// CancelRequest, sent on a fresh connection to interrupt a running query.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
        buf
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.password);
        tagged(b'p', &body)
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: Vec<u8>,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(self.query.len() + 1);
        body.put_slice(&self.query);
        body.put_u8(0);
        tagged(b'Q', &body)
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.name);
        put_cstring(&mut body, &self.query);

        body.put_i16(self.param_types.len() as i16);
        for oid in &self.param_types {
            body.put_u32(oid.0);
        }

        tagged(b'P', &body)
    }
}

/// Bind message ('B') - Binds already encoded parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    /// Encoded parameter values; `None` is NULL.
    pub params: Vec<Option<Vec<u8>>>,
    pub result_formats: Vec<Format>,
}

impl FrontendMessage for BindMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.portal);
        put_cstring(&mut body, &self.statement);

        body.put_i16(self.param_formats.len() as i16);
        for fmt in &self.param_formats {
            body.put_i16(*fmt as i16);
        }

        body.put_i16(self.params.len() as i16);
        for param in &self.params {
            match param {
                None => body.put_i32(-1),
                Some(encoded) => {
                    body.put_i32(encoded.len() as i32);
                    body.put_slice(encoded);
                }
            }
        }

        body.put_i16(self.result_formats.len() as i16);
        for fmt in &self.result_formats {
            body.put_i16(*fmt as i16);
        }

        tagged(b'B', &body)
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.portal);
        // Max rows (0 = no limit)
        body.put_i32(self.max_rows);
        tagged(b'E', &body)
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(self.kind);
        put_cstring(&mut body, &self.name);
        tagged(b'D', &body)
    }
}

/// Close message ('C') - Release a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(self.kind);
        put_cstring(&mut body, &self.name);
        tagged(b'C', &body)
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'S', &[])
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'H', &[])
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'X', &[])
    }
}

/// CopyData message ('d'), used both for COPY FROM STDIN and replication feedback
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self) -> BytesMut {
        tagged(b'd', self.data)
    }
}

/// CopyDone message ('c')
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'c', &[])
    }
}

/// CopyFail message ('f') - Abort a COPY FROM STDIN with an error message
#[derive(Debug, Clone)]
pub struct CopyFailMessage {
    pub message: String,
}

impl FrontendMessage for CopyFailMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.message);
        tagged(b'f', &body)
    }
}

/// FunctionCall message ('F') - Fastpath call of a server function by OID.
///
/// Arguments and the result all use the binary format.
#[derive(Debug, Clone)]
pub struct FunctionCallMessage {
    pub function: Oid,
    pub args: Vec<Option<Vec<u8>>>,
}

impl FrontendMessage for FunctionCallMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u32(self.function.0);

        body.put_i16(1);
        body.put_i16(Format::Binary as i16);

        body.put_i16(self.args.len() as i16);
        for arg in &self.args {
            match arg {
                None => body.put_i32(-1),
                Some(data) => {
                    body.put_i32(data.len() as i32);
                    body.put_slice(data);
                }
            }
        }

        body.put_i16(Format::Binary as i16);
        tagged(b'F', &body)
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.mechanism);
        body.put_i32(self.data.len() as i32);
        body.put_slice(&self.data);
        tagged(b'p', &body)
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    /// SASL response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        tagged(b'p', &self.data)
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Raw column values of one DataRow; `None` is NULL.
pub type RawRow = SmallVec<[Option<Bytes>; 8]>;

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },
    /// Kerberos, GSS, SSPI and other methods this client does not speak.
    AuthenticationUnsupported {
        code: i32,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: RawRow,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription {
        type_oids: Vec<Oid>,
    },

    // COPY sub-protocol
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyBothResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Fastpath
    FunctionCallResponse {
        result: Option<Bytes>,
    },

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    NegotiateProtocolVersion {
        newest_minor: i32,
        unrecognized: Vec<String>,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Asynchronous notification
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

/// Take one complete backend message off the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only part of a message; nothing is
/// consumed in that case, so the call can simply be repeated after more
/// bytes arrive.
pub fn parse_response(buf: &mut BytesMut) -> PgResult<Option<BackendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(PgError::Protocol(format!(
            "invalid message length {} for message type {:?}",
            len, buf[0] as char
        )));
    }
    let total = 1 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let mut frame = buf.split_to(total).freeze();
    BackendMessage::decode(&mut frame).map(Some)
}

impl BackendMessage {
    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte and hold the
    /// whole message.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 || buf.remaining() < len as usize - 4 {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let mut body = buf.split_to(len as usize - 4);

        let msg = match msg_type {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(get_u8(&mut body)?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: get_i32(&mut body)?,
                secret_key: get_i32(&mut body)?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let count = get_i16(&mut body)?;
                let mut type_oids = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    type_oids.push(Oid(get_u32(&mut body)?));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'G' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                }
            }
            b'H' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                }
            }
            b'W' => {
                let (format, column_formats) = Self::decode_copy_response(&mut body)?;
                BackendMessage::CopyBothResponse {
                    format,
                    column_formats,
                }
            }
            b'd' => BackendMessage::CopyData {
                data: body.split_to(body.len()),
            },
            b'c' => BackendMessage::CopyDone,
            b'V' => {
                let len = get_i32(&mut body)?;
                let result = if len < 0 {
                    None
                } else {
                    Some(take(&mut body, len as usize)?)
                };
                BackendMessage::FunctionCallResponse { result }
            }
            b'v' => {
                let newest_minor = get_i32(&mut body)?;
                let count = get_i32(&mut body)?;
                let mut unrecognized = Vec::with_capacity(count.max(0) as usize);
                for _ in 0..count {
                    unrecognized.push(read_cstring(&mut body)?);
                }
                BackendMessage::NegotiateProtocolVersion {
                    newest_minor,
                    unrecognized,
                }
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: get_i32(&mut body)?,
                channel: read_cstring(&mut body)?,
                payload: read_cstring(&mut body)?,
            },
            _ => {
                return Err(PgError::Protocol(format!(
                    "Unknown message type: {:?}",
                    msg_type as char
                )))
            }
        };

        if body.has_remaining() {
            return Err(PgError::Protocol(format!(
                "{} trailing bytes in message {:?}",
                body.remaining(),
                msg_type as char
            )));
        }
        Ok(msg)
    }

    fn decode_auth(body: &mut Bytes) -> PgResult<Self> {
        let auth_type = get_i32(body)?;

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&take(body, 4)?);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                loop {
                    let mech = read_cstring(body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue {
                data: body.split_to(body.len()),
            }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal {
                data: body.split_to(body.len()),
            }),
            code => {
                body.advance(body.remaining());
                Ok(BackendMessage::AuthenticationUnsupported { code })
            }
        }
    }

    fn decode_row_description(body: &mut Bytes) -> PgResult<Self> {
        let num_fields = get_i16(body)?;
        let mut fields = Vec::with_capacity(num_fields.max(0) as usize);

        for _ in 0..num_fields {
            let name = read_cstring(body)?;
            let table_oid = get_u32(body)?;
            let column_attr = get_i16(body)?;
            let type_oid = Oid(get_u32(body)?);
            let type_size = get_i16(body)?;
            let type_modifier = get_i32(body)?;
            let format = Format::from_code(get_i16(body)?)?;

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Bytes) -> PgResult<Self> {
        let num_cols = get_i16(body)?;
        let mut values = RawRow::with_capacity(num_cols.max(0) as usize);

        for _ in 0..num_cols {
            let len = get_i32(body)?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(take(body, len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_copy_response(body: &mut Bytes) -> PgResult<(Format, Vec<Format>)> {
        let format = Format::from_code(get_u8(body)? as i16)?;
        let count = get_i16(body)?;
        let mut column_formats = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            column_formats.push(Format::from_code(get_i16(body)?)?);
        }
        Ok((format, column_formats))
    }

    /// Short name for trace logging.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::AuthenticationSASL { .. } => "AuthenticationSASL",
            BackendMessage::AuthenticationSASLContinue { .. } => "AuthenticationSASLContinue",
            BackendMessage::AuthenticationSASLFinal { .. } => "AuthenticationSASLFinal",
            BackendMessage::AuthenticationUnsupported { .. } => "AuthenticationUnsupported",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::CopyInResponse { .. } => "CopyInResponse",
            BackendMessage::CopyOutResponse { .. } => "CopyOutResponse",
            BackendMessage::CopyBothResponse { .. } => "CopyBothResponse",
            BackendMessage::CopyData { .. } => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::FunctionCallResponse { .. } => "FunctionCallResponse",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::NegotiateProtocolVersion { .. } => "NegotiateProtocolVersion",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn truncated() -> PgError {
    PgError::Protocol("message body truncated".to_string())
}

fn get_u8(buf: &mut Bytes) -> PgResult<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_i16(buf: &mut Bytes) -> PgResult<i16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> PgResult<i32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_i32())
}

fn get_u32(buf: &mut Bytes) -> PgResult<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn take(buf: &mut Bytes, len: usize) -> PgResult<Bytes> {
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.split_to(len))
}

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(body: &mut Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    loop {
        let field_type = get_u8(body)?;
        if field_type == 0 {
            break;
        }
        let value = read_cstring(body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

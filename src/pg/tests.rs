//! Wire-level tests: frontend encoding, backend decoding and the resumable
//! parser fed byte by byte.

use super::protocol::*;
use super::types::*;
use bytes::{BufMut, Bytes, BytesMut};

/// Frame a backend message the way the server does.
fn backend(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

fn decode_one(tag: u8, body: &[u8]) -> BackendMessage {
    let mut buf = backend(tag, body);
    let msg = parse_response(&mut buf).unwrap().expect("complete message");
    assert!(buf.is_empty());
    msg
}

// ============================================================================
// Frontend Messages
// ============================================================================

mod message_encoding {
    use super::*;

    #[test]
    fn test_parse_message_encoding() {
        let msg = ParseMessage {
            name: "__pgb_1".to_string(),
            query: "SELECT $1".to_string(),
            param_types: vec![Oid::INT4],
        };
        let encoded = msg.encode();

        assert_eq!(encoded[0], b'P');
        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1);
        assert_eq!(&encoded[5..13], b"__pgb_1\0");
        assert_eq!(&encoded[13..23], b"SELECT $1\0");
        assert_eq!(&encoded[23..25], &1i16.to_be_bytes());
        assert_eq!(&encoded[25..29], &23u32.to_be_bytes());
    }

    #[test]
    fn test_bind_message_encoding() {
        let msg = BindMessage {
            portal: String::new(),
            statement: "s".to_string(),
            param_formats: vec![Format::Binary, Format::Text],
            params: vec![Some(vec![0, 0, 0, 7]), None],
            result_formats: vec![Format::Binary],
        };
        let encoded = msg.encode();

        let mut expected = BytesMut::new();
        expected.put_slice(b"\0s\0");
        expected.put_i16(2);
        expected.put_i16(1);
        expected.put_i16(0);
        expected.put_i16(2);
        expected.put_i32(4);
        expected.put_slice(&[0, 0, 0, 7]);
        expected.put_i32(-1);
        expected.put_i16(1);
        expected.put_i16(1);

        assert_eq!(encoded[0], b'B');
        assert_eq!(&encoded[5..], &expected[..]);
    }

    #[test]
    fn test_function_call_encoding() {
        let msg = FunctionCallMessage {
            function: Oid(954),
            args: vec![Some(3i32.to_be_bytes().to_vec()), None],
        };
        let encoded = msg.encode();

        let mut expected = BytesMut::new();
        expected.put_u32(954);
        expected.put_i16(1);
        expected.put_i16(1);
        expected.put_i16(2);
        expected.put_i32(4);
        expected.put_i32(3);
        expected.put_i32(-1);
        expected.put_i16(1);

        assert_eq!(encoded[0], b'F');
        assert_eq!(&encoded[5..], &expected[..]);
    }

    #[test]
    fn test_copy_messages() {
        assert_eq!(&CopyDataMessage { data: b"1\tx\n" }.encode()[..], b"d\0\0\0\x081\tx\n");
        assert_eq!(&CopyDoneMessage.encode()[..], b"c\0\0\0\x04");
        let fail = CopyFailMessage {
            message: "nope".to_string(),
        }
        .encode();
        assert_eq!(&fail[..], b"f\0\0\0\x09nope\0");
    }

    #[test]
    fn test_sasl_messages() {
        let initial = SaslInitialResponseMessage {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: b"n,,n=,r=abc".to_vec(),
        }
        .encode();
        assert_eq!(initial[0], b'p');
        assert_eq!(&initial[5..19], b"SCRAM-SHA-256\0");
        assert_eq!(&initial[19..23], &11i32.to_be_bytes());
        assert_eq!(&initial[23..], b"n,,n=,r=abc");

        let response = SaslResponseMessage {
            data: b"c=biws".to_vec(),
        }
        .encode();
        assert_eq!(&response[..], b"p\0\0\0\x0ac=biws");
    }

    #[test]
    fn test_close_describe_execute() {
        let close = CloseMessage {
            kind: b'S',
            name: "__pgb_3".to_string(),
        }
        .encode();
        assert_eq!(&close[..], b"C\0\0\0\x0dS__pgb_3\0");

        let describe = DescribeMessage {
            kind: b'P',
            name: String::new(),
        }
        .encode();
        assert_eq!(&describe[..], b"D\0\0\0\x06P\0");

        let execute = ExecuteMessage {
            portal: String::new(),
            max_rows: 0,
        }
        .encode();
        assert_eq!(&execute[..], b"E\0\0\0\x09\0\0\0\0\0");
        assert_eq!(&SyncMessage.encode()[..], b"S\0\0\0\x04");
        assert_eq!(&TerminateMessage.encode()[..], b"X\0\0\0\x04");
    }
}

// ============================================================================
// Backend Messages
// ============================================================================

mod message_decoding {
    use super::*;

    #[test]
    fn test_authentication_requests() {
        assert!(matches!(
            decode_one(b'R', &0i32.to_be_bytes()),
            BackendMessage::AuthenticationOk
        ));
        assert!(matches!(
            decode_one(b'R', &3i32.to_be_bytes()),
            BackendMessage::AuthenticationCleartextPassword
        ));

        match decode_one(b'R', &[0, 0, 0, 5, 9, 8, 7, 6]) {
            BackendMessage::AuthenticationMD5Password { salt } => assert_eq!(salt, [9, 8, 7, 6]),
            other => panic!("unexpected {:?}", other),
        }

        let mut sasl = BytesMut::new();
        sasl.put_i32(10);
        sasl.put_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        match decode_one(b'R', &sasl) {
            BackendMessage::AuthenticationSASL { mechanisms } => {
                assert_eq!(mechanisms, vec!["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        match decode_one(b'R', &7i32.to_be_bytes()) {
            BackendMessage::AuthenticationUnsupported { code } => assert_eq!(code, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_row_description() {
        let mut body = BytesMut::new();
        body.put_i16(2);
        body.put_slice(b"id\0");
        body.put_u32(16384);
        body.put_i16(1);
        body.put_u32(23);
        body.put_i16(4);
        body.put_i32(-1);
        body.put_i16(1);
        body.put_slice(b"price\0");
        body.put_u32(16384);
        body.put_i16(2);
        body.put_u32(1700);
        body.put_i16(-1);
        body.put_i32(((10 << 16) | 2) + 4);
        body.put_i16(0);

        match decode_one(b'T', &body) {
            BackendMessage::RowDescription { fields } => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].type_oid, Oid::INT4);
                assert_eq!(fields[0].format, Format::Binary);
                assert_eq!(fields[1].table_oid, 16384);
                assert_eq!(fields[1].column_attr, 2);
                assert_eq!(fields[1].type_modifier, (10 << 16) + 6);
                assert_eq!(fields[1].format, Format::Text);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_row_with_nulls_and_empty_values() {
        let mut body = BytesMut::new();
        body.put_i16(3);
        body.put_i32(2);
        body.put_slice(b"42");
        body.put_i32(-1);
        body.put_i32(0);

        match decode_one(b'D', &body) {
            BackendMessage::DataRow { values } => {
                assert_eq!(values.len(), 3);
                assert_eq!(values[0].as_deref(), Some(&b"42"[..]));
                assert!(values[1].is_none());
                assert_eq!(values[2].as_deref(), Some(&b""[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_fields() {
        let body = b"SERROR\0VERROR\0C23505\0Mduplicate key value\0DKey (id)=(1) already exists.\0nusers_pkey\0\0";
        match decode_one(b'E', body) {
            BackendMessage::ErrorResponse { fields } => {
                let diag = super::super::Diagnostics::from_fields(&fields);
                assert_eq!(diag.sqlstate.as_deref(), Some("23505"));
                assert_eq!(diag.message(), "duplicate key value");
                assert_eq!(diag.message_detail.as_deref(), Some("Key (id)=(1) already exists."));
                assert_eq!(diag.constraint_name.as_deref(), Some("users_pkey"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_notification_and_status_messages() {
        let mut body = BytesMut::new();
        body.put_i32(77);
        body.put_slice(b"jobs\0ready\0");
        match decode_one(b'A', &body) {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                assert_eq!(process_id, 77);
                assert_eq!(channel, "jobs");
                assert_eq!(payload, "ready");
            }
            other => panic!("unexpected {:?}", other),
        }

        match decode_one(b'S', b"client_encoding\0UTF8\0") {
            BackendMessage::ParameterStatus { name, value } => {
                assert_eq!((name.as_str(), value.as_str()), ("client_encoding", "UTF8"));
            }
            other => panic!("unexpected {:?}", other),
        }

        match decode_one(b'Z', b"E") {
            BackendMessage::ReadyForQuery { status } => {
                assert_eq!(status, TransactionStatus::Failed)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_copy_responses() {
        let mut body = BytesMut::new();
        body.put_u8(0);
        body.put_i16(2);
        body.put_i16(0);
        body.put_i16(0);
        match decode_one(b'G', &body) {
            BackendMessage::CopyInResponse {
                format,
                column_formats,
            } => {
                assert_eq!(format, Format::Text);
                assert_eq!(column_formats.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        let both = decode_one(b'W', &[0, 0, 0]);
        assert!(matches!(both, BackendMessage::CopyBothResponse { .. }));

        match decode_one(b'd', b"abc") {
            BackendMessage::CopyData { data } => assert_eq!(data, Bytes::from_static(b"abc")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_function_call_response() {
        match decode_one(b'V', &[0, 0, 0, 4, 0, 0, 0, 9]) {
            BackendMessage::FunctionCallResponse { result } => {
                assert_eq!(result.as_deref(), Some(&[0, 0, 0, 9][..]));
            }
            other => panic!("unexpected {:?}", other),
        }
        match decode_one(b'V', &(-1i32).to_be_bytes()) {
            BackendMessage::FunctionCallResponse { result } => assert!(result.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_negotiate_protocol_version() {
        let mut body = BytesMut::new();
        body.put_i32(0);
        body.put_i32(1);
        body.put_slice(b"_pq_.compression\0");
        match decode_one(b'v', &body) {
            BackendMessage::NegotiateProtocolVersion {
                newest_minor,
                unrecognized,
            } => {
                assert_eq!(newest_minor, 0);
                assert_eq!(unrecognized, vec!["_pq_.compression"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_trailing_bytes_rejected() {
        let mut unknown = backend(b'?', b"");
        assert!(parse_response(&mut unknown).is_err());

        let mut trailing = backend(b'Z', b"IX");
        assert!(parse_response(&mut trailing).is_err());
    }
}

// ============================================================================
// Resumable Parsing
// ============================================================================

mod resumable_parsing {
    use super::*;

    /// The reply to `SELECT 1 AS n` plus a notice and a notification.
    fn query_stream() -> BytesMut {
        let mut row_description = BytesMut::new();
        row_description.put_i16(1);
        row_description.put_slice(b"n\0");
        row_description.put_u32(0);
        row_description.put_i16(0);
        row_description.put_u32(23);
        row_description.put_i16(4);
        row_description.put_i32(-1);
        row_description.put_i16(0);

        let mut data_row = BytesMut::new();
        data_row.put_i16(1);
        data_row.put_i32(1);
        data_row.put_slice(b"1");

        let mut notify = BytesMut::new();
        notify.put_i32(5);
        notify.put_slice(b"ch\0\0");

        let mut stream = BytesMut::new();
        stream.extend_from_slice(&backend(b'N', b"SNOTICE\0C00000\0Mhello\0\0"));
        stream.extend_from_slice(&backend(b'T', &row_description));
        stream.extend_from_slice(&backend(b'D', &data_row));
        stream.extend_from_slice(&backend(b'C', b"SELECT 1\0"));
        stream.extend_from_slice(&backend(b'A', &notify));
        stream.extend_from_slice(&backend(b'Z', b"I"));
        stream
    }

    fn names(messages: &[BackendMessage]) -> Vec<&'static str> {
        messages.iter().map(BackendMessage::name).collect()
    }

    fn parse_all(buf: &mut BytesMut, out: &mut Vec<BackendMessage>) {
        while let Some(msg) = parse_response(buf).unwrap() {
            out.push(msg);
        }
    }

    #[test]
    fn test_every_split_point_yields_the_same_messages() {
        let stream = query_stream();
        let mut whole = stream.clone();
        let mut expected = Vec::new();
        parse_all(&mut whole, &mut expected);
        assert_eq!(expected.len(), 6);

        for split in 0..=stream.len() {
            let mut buf = BytesMut::new();
            let mut got = Vec::new();
            buf.extend_from_slice(&stream[..split]);
            parse_all(&mut buf, &mut got);
            buf.extend_from_slice(&stream[split..]);
            parse_all(&mut buf, &mut got);
            assert!(buf.is_empty(), "leftover bytes at split {}", split);
            assert_eq!(names(&got), names(&expected), "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let stream = query_stream();
        let mut buf = BytesMut::new();
        let mut got = Vec::new();
        for byte in stream.iter() {
            buf.put_u8(*byte);
            parse_all(&mut buf, &mut got);
        }
        assert_eq!(got.len(), 6);
        match &got[2] {
            BackendMessage::DataRow { values } => {
                let raw = values[0].as_deref().unwrap();
                assert_eq!(PgValue::decode(Oid::INT4, raw, Format::Text).unwrap(), PgValue::Int4(1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

// ============================================================================
// Live Server
// ============================================================================

/// Run with `--features postgres-integration-tests` against the server in
/// `PGBRIDGE_TEST_DSN` (default `postgresql://postgres@localhost/postgres`).
#[cfg(feature = "postgres-integration-tests")]
mod integration {
    use crate::{connect, params, Connection, PgValue, TransactionStatus};

    fn dsn() -> String {
        std::env::var("PGBRIDGE_TEST_DSN")
            .unwrap_or_else(|_| "postgresql://postgres@localhost/postgres".to_string())
    }

    fn conn() -> Connection {
        connect(&dsn()).expect("connect to test server")
    }

    #[test]
    fn test_connect_and_simple_query() {
        let conn = conn();
        let mut cur = conn.cursor();
        cur.execute("SELECT 1 + %s", params![41]).unwrap();
        let row = cur.fetchone().unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 42);
        assert!(conn.server_version() >= 90600);
    }

    #[test]
    fn test_transaction_status_tracks_server() {
        let conn = conn();
        let mut cur = conn.cursor();
        cur.execute("CREATE TEMP TABLE t (id int)", ()).unwrap();
        assert_eq!(conn.transaction_status(), TransactionStatus::InTransaction);
        cur.execute("INSERT INTO t VALUES (1), (2)", ()).unwrap();
        assert_eq!(cur.rowcount(), 2);
        conn.commit().unwrap();
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    }

    #[test]
    fn test_binary_execution_and_statement_reuse() {
        let conn = conn();
        let mut cur = conn.cursor();
        for i in 0..3i32 {
            cur.execute_binary("SELECT %s::int4 * 2", params![i]).unwrap();
            let row = cur.fetchone().unwrap().unwrap();
            assert_eq!(row[0], PgValue::Int4(i * 2));
        }
    }

    #[test]
    fn test_large_object_roundtrip() {
        let conn = conn();
        let mut lo = conn.lobject(None, "wb").unwrap();
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(lo.write(&payload).unwrap(), payload.len());
        lo.seek(0, crate::Whence::Set).unwrap();
        assert_eq!(lo.read_all().unwrap(), payload);
        lo.unlink().unwrap();
        conn.rollback().unwrap();
    }
}

//! Streaming replication sub-protocol carried inside CopyBoth data.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};

/// PostgreSQL epoch (2000-01-01) in microseconds since the Unix epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// A write-ahead log position, displayed as `XXX/XXX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn parse(s: &str) -> PgResult<Lsn> {
        let bad = || PgError::Type(format!("invalid LSN: {}", s));
        let (hi, lo) = s.trim().split_once('/').ok_or_else(bad)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| bad())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| bad())?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl FromStr for Lsn {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        Lsn::parse(s)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }
}

/// Messages the server streams inside CopyData during replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationCopyData {
    /// WAL payload (`w`).
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        /// Microseconds since 2000-01-01
        server_time: i64,
        data: Bytes,
    },
    /// Primary keepalive (`k`).
    KeepAlive {
        wal_end: Lsn,
        server_time: i64,
        reply_requested: bool,
    },
}

/// Parse the body of a replication CopyData message.
pub fn parse_copy_data(mut payload: Bytes) -> PgResult<ReplicationCopyData> {
    if !payload.has_remaining() {
        return Err(PgError::Protocol("empty replication message".into()));
    }
    match payload.get_u8() {
        b'w' => {
            if payload.remaining() < 24 {
                return Err(PgError::Protocol(format!(
                    "XLogData too short: {} bytes",
                    payload.remaining()
                )));
            }
            let wal_start = Lsn(payload.get_u64());
            let wal_end = Lsn(payload.get_u64());
            let server_time = payload.get_i64();
            Ok(ReplicationCopyData::XLogData {
                wal_start,
                wal_end,
                server_time,
                data: payload,
            })
        }
        b'k' => {
            if payload.remaining() != 17 {
                return Err(PgError::Protocol(format!(
                    "keepalive has {} bytes, expected 17",
                    payload.remaining()
                )));
            }
            Ok(ReplicationCopyData::KeepAlive {
                wal_end: Lsn(payload.get_u64()),
                server_time: payload.get_i64(),
                reply_requested: payload.get_u8() != 0,
            })
        }
        kind => Err(PgError::Protocol(format!(
            "unknown replication message kind: 0x{:02x}",
            kind
        ))),
    }
}

/// Standby status update (`r`), 34 bytes, sent as CopyData.
pub fn encode_standby_status_update(
    write: Lsn,
    flush: Lsn,
    apply: Lsn,
    client_time: i64,
    reply_requested: bool,
) -> Bytes {
    let mut out = BytesMut::with_capacity(34);
    out.put_u8(b'r');
    out.put_u64(write.0);
    out.put_u64(flush.0);
    out.put_u64(apply.0);
    out.put_i64(client_time);
    out.put_u8(reply_requested as u8);
    out.freeze()
}

/// Current time in microseconds since 2000-01-01.
pub fn pg_now() -> i64 {
    chrono::Utc::now().timestamp_micros() - PG_EPOCH_MICROS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_parse_and_display() {
        let lsn = Lsn::parse("16/B374D848").unwrap();
        assert_eq!(lsn.0, 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn::ZERO);
        assert!(Lsn::parse("16").is_err());
        assert!(Lsn::parse("G/1").is_err());
    }

    #[test]
    fn test_parse_xlogdata() {
        let mut v = vec![b'w'];
        v.extend_from_slice(&10u64.to_be_bytes());
        v.extend_from_slice(&20u64.to_be_bytes());
        v.extend_from_slice(&30i64.to_be_bytes());
        v.extend_from_slice(b"BEGIN 1");
        match parse_copy_data(Bytes::from(v)).unwrap() {
            ReplicationCopyData::XLogData {
                wal_start,
                wal_end,
                server_time,
                data,
            } => {
                assert_eq!(wal_start, Lsn(10));
                assert_eq!(wal_end, Lsn(20));
                assert_eq!(server_time, 30);
                assert_eq!(&data[..], b"BEGIN 1");
            }
            other => panic!("expected XLogData, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive() {
        let mut v = vec![b'k'];
        v.extend_from_slice(&99u64.to_be_bytes());
        v.extend_from_slice(&5i64.to_be_bytes());
        v.push(1);
        assert_eq!(
            parse_copy_data(Bytes::from(v)).unwrap(),
            ReplicationCopyData::KeepAlive {
                wal_end: Lsn(99),
                server_time: 5,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(parse_copy_data(Bytes::new()).is_err());
        assert!(parse_copy_data(Bytes::from_static(b"w\0\0")).is_err());
        assert!(parse_copy_data(Bytes::from_static(b"k")).is_err());
        assert!(parse_copy_data(Bytes::from_static(b"z")).is_err());
    }

    #[test]
    fn test_standby_status_update_layout() {
        let msg = encode_standby_status_update(Lsn(1), Lsn(2), Lsn(3), 4, true);
        assert_eq!(msg.len(), 34);
        assert_eq!(msg[0], b'r');
        assert_eq!(&msg[1..9], &1u64.to_be_bytes());
        assert_eq!(&msg[9..17], &2u64.to_be_bytes());
        assert_eq!(&msg[17..25], &3u64.to_be_bytes());
        assert_eq!(&msg[25..33], &4i64.to_be_bytes());
        assert_eq!(msg[33], 1);
    }
}

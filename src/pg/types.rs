//! PostgreSQL type encoding and decoding.
//!
//! Every built-in value has a text form (what the server prints and accepts
//! as literal input) and a binary form (the `send`/`recv` representation).
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{
    DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime,
    Timelike, Utc,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::error::{PgError, PgResult};
use super::protocol::Format;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from `pg_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub u32);

impl Oid {
    /// Parameter type left for the server to infer.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);
    pub const NUMERIC: Oid = Oid(1700);
    pub const RECORD: Oid = Oid(2249);
    pub const VOID: Oid = Oid(2278);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    // Array types
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const NAME_ARRAY: Oid = Oid(1003);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const OID_ARRAY: Oid = Oid(1028);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const INTERVAL_ARRAY: Oid = Oid(1187);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const TIMETZ_ARRAY: Oid = Oid(1270);
    pub const RECORD_ARRAY: Oid = Oid(2287);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// `(array type, element type)` pairs for every built-in array.
    const ARRAY_TYPES: &'static [(Oid, Oid)] = &[
        (Oid::JSON_ARRAY, Oid::JSON),
        (Oid::BOOL_ARRAY, Oid::BOOL),
        (Oid::BYTEA_ARRAY, Oid::BYTEA),
        (Oid::CHAR_ARRAY, Oid::CHAR),
        (Oid::NAME_ARRAY, Oid::NAME),
        (Oid::INT2_ARRAY, Oid::INT2),
        (Oid::INT4_ARRAY, Oid::INT4),
        (Oid::TEXT_ARRAY, Oid::TEXT),
        (Oid::BPCHAR_ARRAY, Oid::BPCHAR),
        (Oid::VARCHAR_ARRAY, Oid::VARCHAR),
        (Oid::INT8_ARRAY, Oid::INT8),
        (Oid::FLOAT4_ARRAY, Oid::FLOAT4),
        (Oid::FLOAT8_ARRAY, Oid::FLOAT8),
        (Oid::OID_ARRAY, Oid::OID),
        (Oid::TIMESTAMP_ARRAY, Oid::TIMESTAMP),
        (Oid::DATE_ARRAY, Oid::DATE),
        (Oid::TIME_ARRAY, Oid::TIME),
        (Oid::TIMESTAMPTZ_ARRAY, Oid::TIMESTAMPTZ),
        (Oid::INTERVAL_ARRAY, Oid::INTERVAL),
        (Oid::NUMERIC_ARRAY, Oid::NUMERIC),
        (Oid::TIMETZ_ARRAY, Oid::TIMETZ),
        (Oid::RECORD_ARRAY, Oid::RECORD),
        (Oid::UUID_ARRAY, Oid::UUID),
        (Oid::JSONB_ARRAY, Oid::JSONB),
    ];

    /// Element type of a built-in array type.
    pub fn array_element(self) -> Option<Oid> {
        Self::ARRAY_TYPES
            .iter()
            .find(|(array, _)| *array == self)
            .map(|(_, element)| *element)
    }

    /// Array type whose elements are `self`.
    pub fn array_of(self) -> Option<Oid> {
        Self::ARRAY_TYPES
            .iter()
            .find(|(_, element)| *element == self)
            .map(|(array, _)| *array)
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Numeric
// ============================================================================

/// Arbitrary precision NUMERIC, kept in its decimal string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Numeric(String);

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

impl Numeric {
    /// Decimal string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_nan(&self) -> bool {
        self.0 == "NaN"
    }

    fn is_special(&self) -> bool {
        matches!(self.0.as_str(), "NaN" | "Infinity" | "-Infinity")
    }

    pub fn is_negative(&self) -> bool {
        self.0.starts_with('-')
    }

    /// Parse as f64 (may lose precision for very large numbers)
    pub fn to_f64(&self) -> f64 {
        self.0.parse().unwrap_or(f64::NAN)
    }

    /// Decode the base-10000 `numeric_send` format.
    pub fn decode_binary(data: &[u8]) -> PgResult<Self> {
        let mut buf = data;
        if buf.remaining() < 8 {
            return Err(PgError::Type("NUMERIC too short".to_string()));
        }
        let ndigits = buf.get_u16() as usize;
        let weight = buf.get_i16() as i32;
        let sign = buf.get_u16();
        let dscale = buf.get_u16() as usize;

        if buf.remaining() != ndigits * 2 {
            return Err(PgError::Type("NUMERIC truncated".to_string()));
        }

        match sign {
            NUMERIC_NAN => return Ok(Numeric("NaN".to_string())),
            NUMERIC_PINF => return Ok(Numeric("Infinity".to_string())),
            NUMERIC_NINF => return Ok(Numeric("-Infinity".to_string())),
            NUMERIC_POS | NUMERIC_NEG => {}
            other => {
                return Err(PgError::Type(format!("invalid NUMERIC sign 0x{:04x}", other)));
            }
        }

        let mut digits = Vec::with_capacity(ndigits);
        for _ in 0..ndigits {
            let d = buf.get_u16();
            if d > 9999 {
                return Err(PgError::Type(format!("invalid NUMERIC digit {}", d)));
            }
            digits.push(d);
        }
        let digit_at = |i: i32| -> u16 {
            if i >= 0 && (i as usize) < digits.len() {
                digits[i as usize]
            } else {
                0
            }
        };

        let mut out = String::new();
        if sign == NUMERIC_NEG {
            out.push('-');
        }

        // Integer part: base-10000 positions weight..=0
        if weight < 0 {
            out.push('0');
        } else {
            for pos in (0..=weight).rev() {
                let d = digit_at(weight - pos);
                if pos == weight {
                    out.push_str(&d.to_string());
                } else {
                    out.push_str(&format!("{:04}", d));
                }
            }
        }

        if dscale > 0 {
            out.push('.');
            let mut frac = String::with_capacity(dscale + 4);
            let mut k = 1;
            while frac.len() < dscale {
                frac.push_str(&format!("{:04}", digit_at(weight + k)));
                k += 1;
            }
            frac.truncate(dscale);
            out.push_str(&frac);
        }

        Ok(Numeric(out))
    }

    /// Encode into the base-10000 `numeric_recv` format.
    pub fn encode_binary(&self, buf: &mut BytesMut) {
        let special = match self.0.as_str() {
            "NaN" => Some(NUMERIC_NAN),
            "Infinity" => Some(NUMERIC_PINF),
            "-Infinity" => Some(NUMERIC_NINF),
            _ => None,
        };
        if let Some(sign) = special {
            buf.put_u16(0);
            buf.put_i16(0);
            buf.put_u16(sign);
            buf.put_u16(0);
            return;
        }

        let (negative, unsigned) = match self.0.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, self.0.as_str()),
        };
        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let int_part = int_part.trim_start_matches('0');
        let dscale = frac_part.len();

        let int_pad = (4 - int_part.len() % 4) % 4;
        let frac_pad = (4 - frac_part.len() % 4) % 4;
        let padded: Vec<u8> = std::iter::repeat(b'0')
            .take(int_pad)
            .chain(int_part.bytes())
            .chain(frac_part.bytes())
            .chain(std::iter::repeat(b'0').take(frac_pad))
            .collect();

        let mut groups: Vec<u16> = padded
            .chunks(4)
            .map(|chunk| chunk.iter().fold(0u16, |acc, b| acc * 10 + (b - b'0') as u16))
            .collect();
        let mut weight = ((int_part.len() + int_pad) / 4) as i32 - 1;

        while groups.first() == Some(&0) {
            groups.remove(0);
            weight -= 1;
        }
        while groups.last() == Some(&0) {
            groups.pop();
        }
        if groups.is_empty() {
            weight = 0;
        }

        buf.put_u16(groups.len() as u16);
        buf.put_i16(weight as i16);
        buf.put_u16(if negative && !groups.is_empty() {
            NUMERIC_NEG
        } else {
            NUMERIC_POS
        });
        buf.put_u16(dscale as u16);
        for g in groups {
            buf.put_u16(g);
        }
    }
}

impl FromStr for Numeric {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "nan" => return Ok(Numeric("NaN".to_string())),
            "infinity" | "+infinity" | "inf" | "+inf" => {
                return Ok(Numeric("Infinity".to_string()))
            }
            "-infinity" | "-inf" => return Ok(Numeric("-Infinity".to_string())),
            _ => {}
        }
        let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let valid = !(int_part.is_empty() && frac_part.is_empty())
            && int_part.bytes().all(|b| b.is_ascii_digit())
            && frac_part.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(PgError::Type(format!("invalid NUMERIC literal: {:?}", s)));
        }
        let int_part = if int_part.is_empty() { "0" } else { int_part };
        let mut out = String::with_capacity(s.len() + 1);
        if s.starts_with('-') {
            out.push('-');
        }
        out.push_str(int_part);
        if !frac_part.is_empty() {
            out.push('.');
            out.push_str(frac_part);
        }
        Ok(Numeric(out))
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Numeric(v.to_string())
    }
}

// ============================================================================
// Interval
// ============================================================================

/// PostgreSQL INTERVAL: months, days and microseconds are kept apart because
/// their lengths are not fixed relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

const USECS_PER_SEC: i64 = 1_000_000;
const USECS_PER_MINUTE: i64 = 60 * USECS_PER_SEC;
const USECS_PER_HOUR: i64 = 60 * USECS_PER_MINUTE;

impl Interval {
    pub fn new(months: i32, days: i32, microseconds: i64) -> Self {
        Self {
            months,
            days,
            microseconds,
        }
    }

    /// Parse the `postgres` IntervalStyle output, e.g. `1 year 2 mons -3 days +04:05:06.5`.
    pub fn parse(s: &str) -> PgResult<Self> {
        let mut out = Interval::default();
        let mut tokens = s.split_whitespace().peekable();
        let bad = || PgError::Type(format!("invalid INTERVAL: {:?}", s));

        while let Some(token) = tokens.next() {
            if token == "@" || token == "ago" {
                continue;
            }
            if token.contains(':') {
                out.microseconds += parse_clock(token).ok_or_else(bad)?;
                continue;
            }
            let unit = tokens.next().ok_or_else(bad)?;
            let unit = unit.trim_end_matches(',').to_ascii_lowercase();
            let unit = unit.trim_end_matches('s');
            let value: f64 = token.parse().map_err(|_| bad())?;
            match unit {
                "year" | "yr" => out.months += (value * 12.0) as i32,
                "mon" | "month" => out.months += value as i32,
                "week" => out.days += (value * 7.0) as i32,
                "day" => out.days += value as i32,
                "hour" | "hr" => out.microseconds += (value * USECS_PER_HOUR as f64) as i64,
                "min" | "minute" => out.microseconds += (value * USECS_PER_MINUTE as f64) as i64,
                "sec" | "second" => out.microseconds += (value * USECS_PER_SEC as f64).round() as i64,
                "millisecond" | "m" => out.microseconds += (value * 1000.0) as i64,
                "microsecond" | "u" => out.microseconds += value as i64,
                _ => return Err(bad()),
            }
        }
        if s.split_whitespace().last() == Some("ago") {
            out = Interval::new(-out.months, -out.days, -out.microseconds);
        }
        Ok(out)
    }

    pub fn decode_binary(data: &[u8]) -> PgResult<Self> {
        let raw = fixed::<16>(data, "INTERVAL")?;
        let mut buf = &raw[..];
        let microseconds = buf.get_i64();
        let days = buf.get_i32();
        let months = buf.get_i32();
        Ok(Interval::new(months, days, microseconds))
    }

    pub fn encode_binary(&self, buf: &mut BytesMut) {
        buf.put_i64(self.microseconds);
        buf.put_i32(self.days);
        buf.put_i32(self.months);
    }
}

/// `[-+]HH:MM[:SS[.ffffff]]` to microseconds.
fn parse_clock(token: &str) -> Option<i64> {
    let (negative, rest) = match token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };
    let mut parts = rest.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds = match parts.next() {
        Some(sec) => {
            let (whole, frac) = sec.split_once('.').unwrap_or((sec, ""));
            let whole: i64 = whole.parse().ok()?;
            let mut frac = frac.to_string();
            if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            while frac.len() < 6 {
                frac.push('0');
            }
            whole * USECS_PER_SEC + frac.parse::<i64>().ok()?
        }
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    let total = hours * USECS_PER_HOUR + minutes * USECS_PER_MINUTE + seconds;
    Some(if negative { -total } else { total })
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let years = self.months / 12;
        let mons = self.months % 12;
        let mut parts: Vec<String> = Vec::new();
        let mut negative_before = false;

        for (value, unit) in [(years, "year"), (mons, "mon"), (self.days, "day")] {
            if value != 0 {
                let plural = if value == 1 { "" } else { "s" };
                parts.push(format!("{} {}{}", value, unit, plural));
                negative_before |= value < 0;
            }
        }

        if self.microseconds != 0 || parts.is_empty() {
            let sign = if self.microseconds < 0 {
                "-"
            } else if negative_before {
                "+"
            } else {
                ""
            };
            let total = self.microseconds.unsigned_abs();
            let hours = total / USECS_PER_HOUR as u64;
            let minutes = (total % USECS_PER_HOUR as u64) / USECS_PER_MINUTE as u64;
            let seconds = (total % USECS_PER_MINUTE as u64) / USECS_PER_SEC as u64;
            let micros = total % USECS_PER_SEC as u64;
            let mut clock = format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds);
            if micros != 0 {
                let frac = format!("{:06}", micros);
                clock.push('.');
                clock.push_str(frac.trim_end_matches('0'));
            }
            parts.push(clock);
        }

        f.write_str(&parts.join(" "))
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(u32),
    Float4(f32),
    Float8(f64),
    Numeric(Numeric),
    Text(String),
    Bytea(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    TimeTz(NaiveTime, FixedOffset),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Interval(Interval),
    Uuid(Uuid),
    Json(JsonValue),
    /// Possibly nested array; `element` is the scalar element type.
    Array {
        element: Oid,
        values: Vec<PgValue>,
    },
    /// Anonymous composite (row) value.
    Record(Vec<PgValue>),
    /// Verbatim SQL fragment, only meaningful when inlined into query text.
    Sql(String),
    /// Types without a dedicated decoder keep their raw bytes.
    Raw { oid: Oid, data: Vec<u8> },
}

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_hms_opt(0, 0, 0).unwrap_or_default()
}

fn fixed<const N: usize>(data: &[u8], name: &str) -> PgResult<[u8; N]> {
    data.try_into()
        .map_err(|_| PgError::Type(format!("Invalid {} length: {}", name, data.len())))
}

fn utf8(data: &[u8], name: &str) -> PgResult<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|e| PgError::Type(format!("Invalid UTF-8 in {}: {}", name, e)))
}

fn micros_to_time(micros: i64) -> PgResult<NaiveTime> {
    let secs = micros.div_euclid(USECS_PER_SEC);
    let nanos = micros.rem_euclid(USECS_PER_SEC) * 1000;
    NaiveTime::from_num_seconds_from_midnight_opt(secs as u32, nanos as u32)
        .ok_or_else(|| PgError::Type(format!("TIME out of range: {}us", micros)))
}

fn time_to_micros(t: &NaiveTime) -> i64 {
    t.num_seconds_from_midnight() as i64 * USECS_PER_SEC + (t.nanosecond() / 1000) as i64
}

fn micros_to_timestamp(micros: i64) -> PgResult<NaiveDateTime> {
    pg_epoch()
        .checked_add_signed(ChronoDuration::microseconds(micros))
        .ok_or_else(|| PgError::Type(format!("TIMESTAMP out of range: {}us", micros)))
}

fn timestamp_to_micros(ts: &NaiveDateTime) -> PgResult<i64> {
    (*ts - pg_epoch())
        .num_microseconds()
        .ok_or_else(|| PgError::Type(format!("TIMESTAMP out of range: {}", ts)))
}

fn format_offset(offset: &FixedOffset) -> String {
    let secs = offset.local_minus_utc();
    let sign = if secs < 0 { '-' } else { '+' };
    let secs = secs.abs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (m, s) {
        (0, 0) => format!("{}{:02}", sign, h),
        (_, 0) => format!("{}{:02}:{:02}", sign, h, m),
        _ => format!("{}{:02}:{:02}:{:02}", sign, h, m, s),
    }
}

/// `+HH[:MM[:SS]]` or `+HHMM` to a fixed offset.
fn parse_offset(s: &str) -> PgResult<FixedOffset> {
    let bad = || PgError::Type(format!("invalid UTC offset: {:?}", s));
    let sign = match s.as_bytes().first() {
        Some(b'+') => 1,
        Some(b'-') => -1,
        _ => return Err(bad()),
    };
    let body = &s[1..];
    let fields: Vec<&str> = if body.contains(':') {
        body.split(':').collect()
    } else if body.len() == 4 {
        vec![&body[..2], &body[2..]]
    } else {
        vec![body]
    };
    let mut secs = 0i32;
    for (field, scale) in fields.iter().zip([3600, 60, 1]) {
        secs += field.parse::<i32>().map_err(|_| bad())? * scale;
    }
    FixedOffset::east_opt(sign * secs).ok_or_else(bad)
}

/// Split `HH:MM:SS[.f]+HH[:MM]` at the offset sign.
fn split_offset(s: &str) -> Option<(&str, &str)> {
    let idx = s.rfind(['+', '-'])?;
    (idx > 0).then(|| (&s[..idx], &s[idx..]))
}

fn parse_date(s: &str) -> PgResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| PgError::Type(format!("invalid DATE {:?}: {}", s, e)))
}

fn parse_time(s: &str) -> PgResult<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .map_err(|e| PgError::Type(format!("invalid TIME {:?}: {}", s, e)))
}

fn parse_timestamp(s: &str) -> PgResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| PgError::Type(format!("invalid TIMESTAMP {:?}: {}", s, e)))
}

fn parse_timestamptz(s: &str) -> PgResult<DateTime<FixedOffset>> {
    let bad = || PgError::Type(format!("invalid TIMESTAMPTZ: {:?}", s));
    let (date, clock) = s.split_once([' ', 'T']).ok_or_else(bad)?;
    let (clock, offset) = split_offset(clock).ok_or_else(bad)?;
    let naive = parse_timestamp(&format!("{} {}", date, clock))?;
    let offset = parse_offset(offset)?;
    naive
        .and_local_timezone(offset)
        .single()
        .ok_or_else(bad)
}

/// Decode bytea text output in either `\x` hex or legacy escape format.
pub fn decode_bytea_text(data: &[u8]) -> PgResult<Vec<u8>> {
    if let Some(hex) = data.strip_prefix(b"\\x") {
        if hex.len() % 2 != 0 {
            return Err(PgError::Type("odd number of hex digits in bytea".to_string()));
        }
        return hex
            .chunks(2)
            .map(|pair| {
                let s = std::str::from_utf8(pair).unwrap_or("");
                u8::from_str_radix(s, 16)
                    .map_err(|_| PgError::Type(format!("invalid hex digit in bytea: {:?}", s)))
            })
            .collect();
    }

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != b'\\' {
            out.push(data[i]);
            i += 1;
        } else if data.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            let octal = data
                .get(i + 1..i + 4)
                .filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)))
                .ok_or_else(|| PgError::Type("invalid escape in bytea".to_string()))?;
            out.push(
                octal
                    .iter()
                    .fold(0u16, |acc, b| acc * 8 + (b - b'0') as u16) as u8,
            );
            i += 4;
        }
    }
    Ok(out)
}

/// Encode bytes as the `\x` hex form.
pub fn encode_bytea_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(2 + data.len() * 2);
    out.push_str("\\x");
    for b in data {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null | PgValue::Sql(_) => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Oid(_) => Oid::OID,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::TimeTz(..) => Oid::TIMETZ,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Interval(_) => Oid::INTERVAL,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Array { element, .. } => element.array_of().unwrap_or(Oid::TEXT_ARRAY),
            PgValue::Record(_) => Oid::RECORD,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Decode a value received in the given format.
    pub fn decode(oid: Oid, data: &[u8], format: Format) -> PgResult<Self> {
        match format {
            Format::Text => Self::decode_text(oid, data),
            Format::Binary => Self::decode_binary(oid, data),
        }
    }

    // ------------------------------------------------------------------------
    // Binary format
    // ------------------------------------------------------------------------

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> PgResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_binary_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    fn encode_binary_into(&self, buf: &mut BytesMut) -> PgResult<()> {
        match self {
            PgValue::Null => {
                return Err(PgError::Type("NULL has no binary representation".to_string()))
            }
            PgValue::Sql(_) => {
                return Err(PgError::Type(
                    "SQL fragments can only be inlined in query text".to_string(),
                ))
            }
            PgValue::Bool(v) => buf.put_u8(*v as u8),
            PgValue::Int2(v) => buf.put_i16(*v),
            PgValue::Int4(v) => buf.put_i32(*v),
            PgValue::Int8(v) => buf.put_i64(*v),
            PgValue::Oid(v) => buf.put_u32(*v),
            PgValue::Float4(v) => buf.put_f32(*v),
            PgValue::Float8(v) => buf.put_f64(*v),
            PgValue::Numeric(v) => v.encode_binary(buf),
            PgValue::Text(v) => buf.put_slice(v.as_bytes()),
            PgValue::Bytea(v) => buf.put_slice(v),
            PgValue::Date(d) => buf.put_i32((*d - pg_epoch_date()).num_days() as i32),
            PgValue::Time(t) => buf.put_i64(time_to_micros(t)),
            PgValue::TimeTz(t, offset) => {
                buf.put_i64(time_to_micros(t));
                // The wire offset counts seconds west of UTC.
                buf.put_i32(-offset.local_minus_utc());
            }
            PgValue::Timestamp(ts) => buf.put_i64(timestamp_to_micros(ts)?),
            PgValue::TimestampTz(ts) => buf.put_i64(timestamp_to_micros(&ts.naive_utc())?),
            PgValue::Interval(v) => v.encode_binary(buf),
            PgValue::Uuid(v) => buf.put_slice(v.as_bytes()),
            PgValue::Json(v) => {
                buf.put_u8(1);
                buf.put_slice(v.to_string().as_bytes());
            }
            PgValue::Array { element, values } => encode_binary_array(*element, values, buf)?,
            PgValue::Record(fields) => {
                buf.put_i32(fields.len() as i32);
                for field in fields {
                    buf.put_u32(field.type_oid().0);
                    put_binary_element(field, buf)?;
                }
            }
            PgValue::Raw { data, .. } => buf.put_slice(data),
        }
        Ok(())
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let value = match oid {
            Oid::BOOL => PgValue::Bool(fixed::<1>(data, "BOOL")?[0] != 0),
            Oid::INT2 => PgValue::Int2(i16::from_be_bytes(fixed(data, "INT2")?)),
            Oid::INT4 => PgValue::Int4(i32::from_be_bytes(fixed(data, "INT4")?)),
            Oid::INT8 => PgValue::Int8(i64::from_be_bytes(fixed(data, "INT8")?)),
            Oid::OID => PgValue::Oid(u32::from_be_bytes(fixed(data, "OID")?)),
            Oid::FLOAT4 => PgValue::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?)),
            Oid::FLOAT8 => PgValue::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?)),
            Oid::NUMERIC => PgValue::Numeric(Numeric::decode_binary(data)?),
            _ if oid.is_text_like() => PgValue::Text(utf8(data, "TEXT")?),
            Oid::BYTEA => PgValue::Bytea(data.to_vec()),
            Oid::DATE => {
                let days = i32::from_be_bytes(fixed(data, "DATE")?);
                PgValue::Date(
                    pg_epoch_date()
                        .checked_add_signed(ChronoDuration::days(days as i64))
                        .ok_or_else(|| PgError::Type(format!("DATE out of range: {}", days)))?,
                )
            }
            Oid::TIME => PgValue::Time(micros_to_time(i64::from_be_bytes(fixed(data, "TIME")?))?),
            Oid::TIMETZ => {
                let raw = fixed::<12>(data, "TIMETZ")?;
                let mut buf = &raw[..];
                let time = micros_to_time(buf.get_i64())?;
                let west = buf.get_i32();
                let offset = FixedOffset::east_opt(-west)
                    .ok_or_else(|| PgError::Type(format!("invalid TIMETZ offset {}", west)))?;
                PgValue::TimeTz(time, offset)
            }
            Oid::TIMESTAMP => {
                PgValue::Timestamp(micros_to_timestamp(i64::from_be_bytes(fixed(data, "TIMESTAMP")?))?)
            }
            Oid::TIMESTAMPTZ => {
                let naive = micros_to_timestamp(i64::from_be_bytes(fixed(data, "TIMESTAMPTZ")?))?;
                PgValue::TimestampTz(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).fixed_offset())
            }
            Oid::INTERVAL => PgValue::Interval(Interval::decode_binary(data)?),
            Oid::UUID => PgValue::Uuid(Uuid::from_bytes(fixed(data, "UUID")?)),
            Oid::JSON | Oid::JSONB => {
                // JSONB has a version byte prefix
                let json_data = if oid == Oid::JSONB {
                    match data.split_first() {
                        Some((1, rest)) => rest,
                        _ => return Err(PgError::Type("unsupported JSONB version".to_string())),
                    }
                } else {
                    data
                };
                PgValue::Json(
                    serde_json::from_slice(json_data)
                        .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))?,
                )
            }
            Oid::RECORD => {
                let fields = parse_binary_record(data)?
                    .into_iter()
                    .map(|(oid, raw)| match raw {
                        Some(raw) => PgValue::decode_binary(oid, raw),
                        None => Ok(PgValue::Null),
                    })
                    .collect::<PgResult<Vec<_>>>()?;
                PgValue::Record(fields)
            }
            _ if oid.array_element().is_some() => {
                let array = BinaryArray::parse(data)?;
                let element = array.element;
                array.build(&mut |raw| PgValue::decode_binary(element, raw))?
            }
            // For unknown types, store raw bytes
            _ => PgValue::Raw {
                oid,
                data: data.to_vec(),
            },
        };
        Ok(value)
    }

    // ------------------------------------------------------------------------
    // Text format
    // ------------------------------------------------------------------------

    /// Encode to the server's text input form (no SQL quoting applied).
    pub fn encode_text(&self) -> PgResult<String> {
        let text = match self {
            PgValue::Null => {
                return Err(PgError::Type("NULL has no text representation".to_string()))
            }
            PgValue::Sql(s) => s.clone(),
            PgValue::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Oid(v) => v.to_string(),
            PgValue::Float4(v) => format_float(*v as f64, v.to_string()),
            PgValue::Float8(v) => format_float(*v, v.to_string()),
            PgValue::Numeric(v) => v.to_string(),
            PgValue::Text(v) => v.clone(),
            PgValue::Bytea(v) => encode_bytea_hex(v),
            PgValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            PgValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            PgValue::TimeTz(t, offset) => {
                format!("{}{}", t.format("%H:%M:%S%.f"), format_offset(offset))
            }
            PgValue::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            PgValue::TimestampTz(ts) => format!(
                "{}{}",
                ts.format("%Y-%m-%d %H:%M:%S%.f"),
                format_offset(ts.offset())
            ),
            PgValue::Interval(v) => v.to_string(),
            PgValue::Uuid(v) => v.hyphenated().to_string(),
            PgValue::Json(v) => v.to_string(),
            PgValue::Array { values, .. } => {
                let mut out = String::new();
                write_text_array(values, &mut out)?;
                out
            }
            PgValue::Record(fields) => {
                let mut out = String::from("(");
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    if !field.is_null() {
                        out.push_str(&quote_record_field(&field.encode_text()?));
                    }
                }
                out.push(')');
                out
            }
            PgValue::Raw { data, .. } => utf8(data, "raw value")?,
        };
        Ok(text)
    }

    /// Decode from text format (the simple query protocol's only format)
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        if oid == Oid::BYTEA {
            return Ok(PgValue::Bytea(decode_bytea_text(data)?));
        }
        let text = utf8(data, "text value")?;
        let bad = |name: &str, e: &dyn fmt::Display| {
            PgError::Type(format!("Invalid {} {:?}: {}", name, text, e))
        };

        let value = match oid {
            Oid::BOOL => match text.as_str() {
                "t" | "true" => PgValue::Bool(true),
                "f" | "false" => PgValue::Bool(false),
                _ => return Err(bad("BOOL", &"expected t or f")),
            },
            Oid::INT2 => PgValue::Int2(text.parse().map_err(|e| bad("INT2", &e))?),
            Oid::INT4 => PgValue::Int4(text.parse().map_err(|e| bad("INT4", &e))?),
            Oid::INT8 => PgValue::Int8(text.parse().map_err(|e| bad("INT8", &e))?),
            Oid::OID => PgValue::Oid(text.parse().map_err(|e| bad("OID", &e))?),
            Oid::FLOAT4 => PgValue::Float4(text.parse().map_err(|e| bad("FLOAT4", &e))?),
            Oid::FLOAT8 => PgValue::Float8(text.parse().map_err(|e| bad("FLOAT8", &e))?),
            Oid::NUMERIC => PgValue::Numeric(text.parse()?),
            Oid::DATE => PgValue::Date(parse_date(&text)?),
            Oid::TIME => PgValue::Time(parse_time(&text)?),
            Oid::TIMETZ => {
                let (clock, offset) =
                    split_offset(&text).ok_or_else(|| bad("TIMETZ", &"missing offset"))?;
                PgValue::TimeTz(parse_time(clock)?, parse_offset(offset)?)
            }
            Oid::TIMESTAMP => PgValue::Timestamp(parse_timestamp(&text)?),
            Oid::TIMESTAMPTZ => PgValue::TimestampTz(parse_timestamptz(&text)?),
            Oid::INTERVAL => PgValue::Interval(Interval::parse(&text)?),
            Oid::UUID => PgValue::Uuid(Uuid::parse_str(&text).map_err(|e| bad("UUID", &e))?),
            Oid::JSON | Oid::JSONB => {
                PgValue::Json(serde_json::from_str(&text).map_err(|e| bad("JSON", &e))?)
            }
            Oid::RECORD => PgValue::Record(
                parse_text_record(&text)?
                    .into_iter()
                    .map(|field| field.map_or(PgValue::Null, PgValue::Text))
                    .collect(),
            ),
            _ if oid.array_element().is_some() => {
                let element = oid.array_element().unwrap_or(Oid::TEXT);
                parse_text_array(&text)?
                    .build(element, &mut |raw| PgValue::decode_text(element, raw.as_bytes()))?
            }
            // Text types, and the textual fallback for everything else
            _ => PgValue::Text(text),
        };
        Ok(value)
    }

    /// JSON rendering used when composite values are embedded in JSON documents.
    pub fn to_json(&self) -> PgResult<JsonValue> {
        let value = match self {
            PgValue::Null => JsonValue::Null,
            PgValue::Bool(v) => JsonValue::Bool(*v),
            PgValue::Int2(v) => JsonValue::from(*v),
            PgValue::Int4(v) => JsonValue::from(*v),
            PgValue::Int8(v) => JsonValue::from(*v),
            PgValue::Oid(v) => JsonValue::from(*v),
            PgValue::Float4(v) => JsonValue::from(*v as f64),
            PgValue::Float8(v) => JsonValue::from(*v),
            PgValue::Numeric(n) => serde_json::from_str::<serde_json::Number>(n.as_str())
                .map(JsonValue::Number)
                .unwrap_or_else(|_| JsonValue::String(n.to_string())),
            PgValue::Text(s) => JsonValue::String(s.clone()),
            PgValue::Json(v) => v.clone(),
            PgValue::Array { values, .. } | PgValue::Record(values) => JsonValue::Array(
                values
                    .iter()
                    .map(PgValue::to_json)
                    .collect::<PgResult<Vec<_>>>()?,
            ),
            PgValue::Sql(_) => {
                return Err(PgError::Type("SQL fragments cannot be embedded in JSON".to_string()))
            }
            other => JsonValue::String(other.encode_text()?),
        };
        Ok(value)
    }
}

fn format_float(v: f64, display: String) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        display
    }
}

// ============================================================================
// Arrays
// ============================================================================

/// A parsed text array before its leaves are typecast.
#[derive(Debug, Clone, PartialEq)]
pub enum TextArray {
    Leaf(Option<String>),
    Nested(Vec<TextArray>),
}

impl TextArray {
    /// Convert the leaves with `cast`, producing a (possibly nested) array value.
    pub fn build(
        self,
        element: Oid,
        cast: &mut dyn FnMut(&str) -> PgResult<PgValue>,
    ) -> PgResult<PgValue> {
        match self {
            TextArray::Leaf(None) => Ok(PgValue::Null),
            TextArray::Leaf(Some(raw)) => cast(&raw),
            TextArray::Nested(items) => Ok(PgValue::Array {
                element,
                values: items
                    .into_iter()
                    .map(|item| item.build(element, cast))
                    .collect::<PgResult<Vec<_>>>()?,
            }),
        }
    }
}

/// Parse `{1,2,"a b",NULL}` (optionally prefixed by `[1:3]=` bounds).
pub fn parse_text_array(s: &str) -> PgResult<TextArray> {
    let s = if s.starts_with('[') {
        s.split_once('=')
            .map(|(_, rest)| rest)
            .ok_or_else(|| PgError::Type(format!("malformed array bounds: {:?}", s)))?
    } else {
        s
    };
    let chars: Vec<char> = s.chars().collect();
    let mut pos = 0;
    let parsed = parse_array_level(&chars, &mut pos)?;
    if pos != chars.len() {
        return Err(PgError::Type(format!("junk after array literal: {:?}", s)));
    }
    Ok(parsed)
}

fn parse_array_level(chars: &[char], pos: &mut usize) -> PgResult<TextArray> {
    let malformed = || PgError::Type("malformed array literal".to_string());
    if chars.get(*pos) != Some(&'{') {
        return Err(malformed());
    }
    *pos += 1;
    let mut items = Vec::new();
    if chars.get(*pos) == Some(&'}') {
        *pos += 1;
        return Ok(TextArray::Nested(items));
    }
    loop {
        match chars.get(*pos) {
            Some('{') => items.push(parse_array_level(chars, pos)?),
            Some('"') => {
                *pos += 1;
                let mut item = String::new();
                loop {
                    match chars.get(*pos) {
                        Some('\\') => {
                            item.push(*chars.get(*pos + 1).ok_or_else(malformed)?);
                            *pos += 2;
                        }
                        Some('"') => {
                            *pos += 1;
                            break;
                        }
                        Some(c) => {
                            item.push(*c);
                            *pos += 1;
                        }
                        None => return Err(malformed()),
                    }
                }
                items.push(TextArray::Leaf(Some(item)));
            }
            Some(_) => {
                let mut item = String::new();
                while let Some(c) = chars.get(*pos) {
                    if *c == ',' || *c == '}' {
                        break;
                    }
                    if *c == '\\' {
                        item.push(*chars.get(*pos + 1).ok_or_else(malformed)?);
                        *pos += 2;
                    } else {
                        item.push(*c);
                        *pos += 1;
                    }
                }
                let item = item.trim().to_string();
                if item.eq_ignore_ascii_case("NULL") {
                    items.push(TextArray::Leaf(None));
                } else {
                    items.push(TextArray::Leaf(Some(item)));
                }
            }
            None => return Err(malformed()),
        }
        match chars.get(*pos) {
            Some(',') => *pos += 1,
            Some('}') => {
                *pos += 1;
                return Ok(TextArray::Nested(items));
            }
            _ => return Err(malformed()),
        }
    }
}

fn write_text_array(values: &[PgValue], out: &mut String) -> PgResult<()> {
    out.push('{');
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match value {
            PgValue::Null => out.push_str("NULL"),
            PgValue::Array { values, .. } => write_text_array(values, out)?,
            other => out.push_str(&quote_array_element(&other.encode_text()?)),
        }
    }
    out.push('}');
    Ok(())
}

fn quote_array_element(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || s.eq_ignore_ascii_case("NULL")
        || s
            .chars()
            .any(|c| matches!(c, '"' | '\\' | '{' | '}' | ',') || c.is_whitespace());
    if !needs_quotes {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Header and element slices of a binary array.
pub struct BinaryArray<'a> {
    pub element: Oid,
    pub dims: Vec<usize>,
    pub items: Vec<Option<&'a [u8]>>,
}

impl<'a> BinaryArray<'a> {
    pub fn parse(data: &'a [u8]) -> PgResult<Self> {
        let mut buf = data;
        let short = || PgError::Type("array data truncated".to_string());
        if buf.remaining() < 12 {
            return Err(short());
        }
        let ndim = buf.get_i32();
        let _has_null = buf.get_i32();
        let element = Oid(buf.get_u32());
        if !(0..=6).contains(&ndim) {
            return Err(PgError::Type(format!("invalid array dimension count {}", ndim)));
        }
        let mut dims = Vec::with_capacity(ndim as usize);
        for _ in 0..ndim {
            if buf.remaining() < 8 {
                return Err(short());
            }
            let len = buf.get_i32();
            let _lower = buf.get_i32();
            dims.push(usize::try_from(len).map_err(|_| short())?);
        }
        let total: usize = if dims.is_empty() { 0 } else { dims.iter().product() };
        let mut items = Vec::with_capacity(total);
        for _ in 0..total {
            if buf.remaining() < 4 {
                return Err(short());
            }
            let len = buf.get_i32();
            if len < 0 {
                items.push(None);
            } else {
                let len = len as usize;
                if buf.remaining() < len {
                    return Err(short());
                }
                items.push(Some(&buf[..len]));
                buf.advance(len);
            }
        }
        Ok(Self {
            element,
            dims,
            items,
        })
    }

    /// Rebuild the nested value, casting each non-NULL element with `cast`.
    pub fn build(self, cast: &mut dyn FnMut(&[u8]) -> PgResult<PgValue>) -> PgResult<PgValue> {
        let mut leaves = self
            .items
            .into_iter()
            .map(|raw| match raw {
                Some(raw) => cast(raw),
                None => Ok(PgValue::Null),
            })
            .collect::<PgResult<Vec<_>>>()?
            .into_iter();
        Ok(nest(self.element, &self.dims, &mut leaves))
    }
}

fn nest(element: Oid, dims: &[usize], leaves: &mut dyn Iterator<Item = PgValue>) -> PgValue {
    let values = match dims.split_first() {
        None => Vec::new(),
        Some((len, [])) => leaves.take(*len).collect(),
        Some((len, rest)) => (0..*len).map(|_| nest(element, rest, leaves)).collect(),
    };
    PgValue::Array { element, values }
}

fn encode_binary_array(element: Oid, values: &[PgValue], buf: &mut BytesMut) -> PgResult<()> {
    let mut dims = Vec::new();
    let mut level = values;
    loop {
        dims.push(level.len());
        match level.first() {
            Some(PgValue::Array { values, .. }) => level = values,
            _ => break,
        }
    }
    if values.is_empty() {
        dims.clear();
    }

    let mut leaves = Vec::new();
    flatten(values, &dims, &mut leaves)?;

    buf.put_i32(dims.len() as i32);
    buf.put_i32(leaves.iter().any(|v| v.is_null()) as i32);
    buf.put_u32(element.0);
    for len in &dims {
        buf.put_i32(*len as i32);
        buf.put_i32(1);
    }
    for leaf in leaves {
        put_binary_element(leaf, buf)?;
    }
    Ok(())
}

fn flatten<'a>(values: &'a [PgValue], dims: &[usize], out: &mut Vec<&'a PgValue>) -> PgResult<()> {
    let ragged =
        || PgError::Type("multidimensional arrays must have matching sub-array sizes".to_string());
    let Some((len, rest)) = dims.split_first() else {
        return Ok(());
    };
    if values.len() != *len {
        return Err(ragged());
    }
    for value in values {
        match (value, rest.is_empty()) {
            (PgValue::Array { values, .. }, false) => flatten(values, rest, out)?,
            (PgValue::Array { .. }, true) => return Err(ragged()),
            (_, false) => return Err(ragged()),
            (leaf, true) => out.push(leaf),
        }
    }
    Ok(())
}

fn put_binary_element(value: &PgValue, buf: &mut BytesMut) -> PgResult<()> {
    if value.is_null() {
        buf.put_i32(-1);
        return Ok(());
    }
    let len_at = buf.len();
    buf.put_i32(0);
    value.encode_binary_into(buf)?;
    let len = (buf.len() - len_at - 4) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

// ============================================================================
// Records
// ============================================================================

/// Parse `(1,"a b",)` into its raw fields; an empty unquoted field is NULL.
pub fn parse_text_record(s: &str) -> PgResult<Vec<Option<String>>> {
    let malformed = || PgError::Type(format!("malformed record literal: {:?}", s));
    let inner = s
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(malformed)?;
    let chars: Vec<char> = inner.chars().collect();
    let mut fields = Vec::new();
    let mut pos = 0;
    loop {
        let mut field = String::new();
        let mut quoted = false;
        while let Some(&c) = chars.get(pos) {
            match c {
                ',' => break,
                '"' => {
                    quoted = true;
                    pos += 1;
                    loop {
                        match chars.get(pos) {
                            Some('"') if chars.get(pos + 1) == Some(&'"') => {
                                field.push('"');
                                pos += 2;
                            }
                            Some('"') => {
                                pos += 1;
                                break;
                            }
                            Some('\\') => {
                                field.push(*chars.get(pos + 1).ok_or_else(malformed)?);
                                pos += 2;
                            }
                            Some(c) => {
                                field.push(*c);
                                pos += 1;
                            }
                            None => return Err(malformed()),
                        }
                    }
                }
                '\\' => {
                    field.push(*chars.get(pos + 1).ok_or_else(malformed)?);
                    pos += 2;
                }
                c => {
                    field.push(c);
                    pos += 1;
                }
            }
        }
        fields.push(if field.is_empty() && !quoted {
            None
        } else {
            Some(field)
        });
        if pos >= chars.len() {
            break;
        }
        pos += 1;
    }
    Ok(fields)
}

fn quote_record_field(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || s
            .chars()
            .any(|c| matches!(c, '"' | '\\' | '(' | ')' | ',') || c.is_whitespace());
    if !needs_quotes {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\"\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Field OIDs and raw bytes of a binary record.
pub fn parse_binary_record(data: &[u8]) -> PgResult<Vec<(Oid, Option<&[u8]>)>> {
    let mut buf = data;
    let short = || PgError::Type("record data truncated".to_string());
    if buf.remaining() < 4 {
        return Err(short());
    }
    let count = buf.get_i32();
    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if buf.remaining() < 8 {
            return Err(short());
        }
        let oid = Oid(buf.get_u32());
        let len = buf.get_i32();
        if len < 0 {
            fields.push((oid, None));
        } else {
            let len = len as usize;
            if buf.remaining() < len {
                return Err(short());
            }
            fields.push((oid, Some(&buf[..len])));
            buf.advance(len);
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip_binary(value: PgValue) {
        let encoded = value.encode_binary().unwrap();
        let decoded = PgValue::decode_binary(value.type_oid(), &encoded).unwrap();
        assert_eq!(decoded, value);
    }

    fn roundtrip_text(value: PgValue) {
        let encoded = value.encode_text().unwrap();
        let decoded = PgValue::decode_text(value.type_oid(), encoded.as_bytes()).unwrap();
        assert_eq!(decoded, value, "text form was {:?}", encoded);
    }

    fn numeric(s: &str) -> Numeric {
        s.parse().unwrap()
    }

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(!Oid::FLOAT8.is_integer());
        assert!(Oid::FLOAT4.is_float());

        assert_eq!(Oid::INT4_ARRAY.array_element(), Some(Oid::INT4));
        assert_eq!(Oid::UUID.array_of(), Some(Oid::UUID_ARRAY));
        assert_eq!(Oid::INT4.array_element(), None);
    }

    #[test]
    fn test_numeric_binary_roundtrip() {
        for s in [
            "0",
            "1",
            "-1",
            "12345.678",
            "0.0001",
            "0.00000001",
            "100000000",
            "-98765432109876543210.0123456789",
            "3.1400",
            "NaN",
            "Infinity",
            "-Infinity",
        ] {
            let mut buf = BytesMut::new();
            numeric(s).encode_binary(&mut buf);
            assert_eq!(Numeric::decode_binary(&buf).unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_numeric_known_encoding() {
        // 12345.678 = [1, 2345, 6780] with weight 1 and dscale 3
        let mut buf = BytesMut::new();
        numeric("12345.678").encode_binary(&mut buf);
        assert_eq!(
            &buf[..],
            &[0, 3, 0, 1, 0, 0, 0, 3, 0, 1, 0x09, 0x29, 0x1a, 0x7c]
        );
    }

    #[test]
    fn test_numeric_rejects_garbage() {
        assert!("1.2.3".parse::<Numeric>().is_err());
        assert!("1e5".parse::<Numeric>().is_err());
        assert!("".parse::<Numeric>().is_err());
        assert_eq!(numeric("+.5").as_str(), "0.5");
    }

    #[test]
    fn test_scalar_roundtrips() {
        let values = vec![
            PgValue::Bool(true),
            PgValue::Bool(false),
            PgValue::Int2(-32768),
            PgValue::Int4(12345),
            PgValue::Int8(i64::MAX),
            PgValue::Oid(4_000_000_000),
            PgValue::Float8(-0.1),
            PgValue::Float4(1.5),
            PgValue::Numeric(numeric("-12.3400")),
            PgValue::Text("it's a \"test\" with \\ and ünïcödé".to_string()),
            PgValue::Bytea(vec![0, 1, 2, 255, b'\\', b'\'']),
            PgValue::Date(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
            PgValue::Time(NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap()),
            PgValue::TimeTz(
                NaiveTime::from_hms_opt(1, 2, 3).unwrap(),
                FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap(),
            ),
            PgValue::Timestamp(
                NaiveDate::from_ymd_opt(2024, 2, 29)
                    .unwrap()
                    .and_hms_micro_opt(12, 0, 0, 500)
                    .unwrap(),
            ),
            PgValue::TimestampTz(
                DateTime::parse_from_rfc3339("2021-06-01T10:00:00.25-03:00").unwrap(),
            ),
            PgValue::Interval(Interval::new(14, -3, 4 * USECS_PER_HOUR + 500_000)),
            PgValue::Uuid(Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0)),
            PgValue::Json(serde_json::json!({"a": [1, 2, null], "b": "x"})),
        ];
        for value in values {
            roundtrip_text(value.clone());
            roundtrip_binary(value);
        }
    }

    #[test]
    fn test_timestamptz_binary_is_utc_instant() {
        let ts = DateTime::parse_from_rfc3339("2021-06-01T10:00:00-03:00").unwrap();
        let encoded = PgValue::TimestampTz(ts).encode_binary().unwrap();
        match PgValue::decode_binary(Oid::TIMESTAMPTZ, &encoded).unwrap() {
            PgValue::TimestampTz(decoded) => {
                assert_eq!(decoded, ts);
                assert_eq!(decoded.offset().local_minus_utc(), 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timestamptz_text_offsets() {
        let v = PgValue::decode_text(Oid::TIMESTAMPTZ, b"2024-01-02 03:04:05.123456+05:30").unwrap();
        assert_eq!(
            v,
            PgValue::TimestampTz(DateTime::parse_from_rfc3339("2024-01-02T03:04:05.123456+05:30").unwrap())
        );
        let v = PgValue::decode_text(Oid::TIMESTAMPTZ, b"2024-01-02 03:04:05-08").unwrap();
        assert_eq!(v.encode_text().unwrap(), "2024-01-02 03:04:05-08");
    }

    #[test]
    fn test_interval_text_forms() {
        assert_eq!(Interval::default().to_string(), "00:00:00");
        assert_eq!(
            Interval::new(14, 3, 4 * USECS_PER_HOUR + 5 * USECS_PER_MINUTE + 6_789_000).to_string(),
            "1 year 2 mons 3 days 04:05:06.789"
        );
        assert_eq!(
            Interval::new(0, -1, 2 * USECS_PER_HOUR + 3 * USECS_PER_MINUTE).to_string(),
            "-1 days +02:03:00"
        );
        assert_eq!(
            Interval::parse("-1 days +02:03:00").unwrap(),
            Interval::new(0, -1, 2 * USECS_PER_HOUR + 3 * USECS_PER_MINUTE)
        );
        assert_eq!(Interval::parse("1 day").unwrap(), Interval::new(0, 1, 0));
        assert_eq!(Interval::parse("-00:00:01").unwrap(), Interval::new(0, 0, -USECS_PER_SEC));
        assert!(Interval::parse("3 fortnights").is_err());
    }

    #[test]
    fn test_bytea_text_formats() {
        assert_eq!(decode_bytea_text(b"\\x00ff41").unwrap(), vec![0, 255, b'A']);
        assert_eq!(decode_bytea_text(b"a\\\\b\\000\\377").unwrap(), vec![b'a', b'\\', b'b', 0, 255]);
        assert!(decode_bytea_text(b"\\x0").is_err());
        assert_eq!(encode_bytea_hex(&[0xde, 0xad]), "\\xdead");
    }

    #[test]
    fn test_text_array_parsing() {
        let parsed = parse_text_array(r#"{1,NULL,"a,b","quote\"d","",{x}}"#).unwrap();
        assert_eq!(
            parsed,
            TextArray::Nested(vec![
                TextArray::Leaf(Some("1".into())),
                TextArray::Leaf(None),
                TextArray::Leaf(Some("a,b".into())),
                TextArray::Leaf(Some("quote\"d".into())),
                TextArray::Leaf(Some("".into())),
                TextArray::Nested(vec![TextArray::Leaf(Some("x".into()))]),
            ])
        );
        assert!(parse_text_array("{1,2").is_err());
        assert_eq!(
            PgValue::decode_text(Oid::INT4_ARRAY, b"[0:1]={7,8}").unwrap(),
            PgValue::Array {
                element: Oid::INT4,
                values: vec![PgValue::Int4(7), PgValue::Int4(8)]
            }
        );
    }

    #[test]
    fn test_array_roundtrips() {
        let text_array = PgValue::Array {
            element: Oid::TEXT,
            values: vec![
                PgValue::Text("plain".into()),
                PgValue::Text("with space".into()),
                PgValue::Text("NULL".into()),
                PgValue::Text("back\\slash \"q\"".into()),
                PgValue::Text(String::new()),
                PgValue::Null,
            ],
        };
        roundtrip_text(text_array.clone());
        roundtrip_binary(text_array);

        let nested = PgValue::Array {
            element: Oid::INT8,
            values: vec![
                PgValue::Array {
                    element: Oid::INT8,
                    values: vec![PgValue::Int8(1), PgValue::Int8(2)],
                },
                PgValue::Array {
                    element: Oid::INT8,
                    values: vec![PgValue::Int8(3), PgValue::Null],
                },
            ],
        };
        roundtrip_text(nested.clone());
        roundtrip_binary(nested);

        let empty = PgValue::Array {
            element: Oid::INT4,
            values: vec![],
        };
        assert_eq!(empty.encode_text().unwrap(), "{}");
        roundtrip_text(empty.clone());
        roundtrip_binary(empty);
    }

    #[test]
    fn test_ragged_array_rejected() {
        let ragged = PgValue::Array {
            element: Oid::INT4,
            values: vec![
                PgValue::Array {
                    element: Oid::INT4,
                    values: vec![PgValue::Int4(1)],
                },
                PgValue::Array {
                    element: Oid::INT4,
                    values: vec![],
                },
            ],
        };
        assert!(ragged.encode_binary().is_err());
    }

    #[test]
    fn test_record_forms() {
        assert_eq!(
            parse_text_record(r#"(1,"a b",,"say ""hi""","")"#).unwrap(),
            vec![
                Some("1".to_string()),
                Some("a b".to_string()),
                None,
                Some("say \"hi\"".to_string()),
                Some(String::new()),
            ]
        );

        let record = PgValue::Record(vec![PgValue::Int4(5), PgValue::Null, PgValue::Text("x y".into())]);
        assert_eq!(record.encode_text().unwrap(), r#"(5,,"x y")"#);
        roundtrip_binary(record);
    }

    #[test]
    fn test_malformed_binary_is_error() {
        assert!(PgValue::decode_binary(Oid::INT4, &[0, 1]).is_err());
        assert!(PgValue::decode_binary(Oid::INT4_ARRAY, &[0, 0, 0, 1]).is_err());
        assert!(PgValue::decode_binary(Oid::NUMERIC, &[0, 2, 0, 0, 0, 0, 0, 0, 0, 1]).is_err());
        assert!(PgValue::decode_text(Oid::BOOL, b"maybe").is_err());
    }

    #[test]
    fn test_unknown_oid_fallbacks() {
        assert_eq!(
            PgValue::decode_text(Oid(600), b"(1,2)").unwrap(),
            PgValue::Text("(1,2)".into())
        );
        assert_eq!(
            PgValue::decode_binary(Oid(600), &[1, 2]).unwrap(),
            PgValue::Raw {
                oid: Oid(600),
                data: vec![1, 2]
            }
        );
    }
}

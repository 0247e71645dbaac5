//! Conversions from decoded `PgValue`s back into host types.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::pg::types::{Interval, Numeric, PgValue};

/// A host type that can be read out of a column value.
pub trait FromValue: Sized {
    fn from_value(value: &PgValue) -> Result<Self>;
}

fn mismatch<T>(value: &PgValue) -> Error {
    if value.is_null() {
        Error::data(format!(
            "unexpected NULL for {}",
            std::any::type_name::<T>()
        ))
    } else {
        Error::data(format!(
            "cannot convert {} value to {}",
            value.type_oid(),
            std::any::type_name::<T>()
        ))
    }
}

fn out_of_range<T>(value: &PgValue) -> Error {
    Error::data(format!(
        "value {:?} out of range for {}",
        value,
        std::any::type_name::<T>()
    ))
}

impl FromValue for PgValue {
    fn from_value(value: &PgValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::Bool(v) => Ok(*v),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

fn as_i64(value: &PgValue) -> Option<i64> {
    match value {
        PgValue::Int2(v) => Some(*v as i64),
        PgValue::Int4(v) => Some(*v as i64),
        PgValue::Int8(v) => Some(*v),
        PgValue::Oid(v) => Some(*v as i64),
        _ => None,
    }
}

macro_rules! integer_from_value {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: &PgValue) -> Result<Self> {
                    let wide = as_i64(value).ok_or_else(|| mismatch::<Self>(value))?;
                    <$t>::try_from(wide).map_err(|_| out_of_range::<Self>(value))
                }
            }
        )*
    };
}

integer_from_value!(i16, i32, i64, u32);

impl FromValue for f64 {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::Float4(v) => Ok(*v as f64),
            PgValue::Float8(v) => Ok(*v),
            PgValue::Numeric(n) => Ok(n.to_f64()),
            other => as_i64(other)
                .map(|v| v as f64)
                .ok_or_else(|| mismatch::<Self>(other)),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::Float4(v) => Ok(*v),
            other => f64::from_value(other).map(|v| v as f32),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::Text(s) => Ok(s.clone()),
            PgValue::Json(JsonValue::String(s)) => Ok(s.clone()),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::Bytea(b) => Ok(b.clone()),
            PgValue::Raw { data, .. } => Ok(data.clone()),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

impl FromValue for Numeric {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::Numeric(n) => Ok(n.clone()),
            other => as_i64(other)
                .map(Numeric::from)
                .ok_or_else(|| mismatch::<Self>(other)),
        }
    }
}

macro_rules! simple_from_value {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl FromValue for $t {
                fn from_value(value: &PgValue) -> Result<Self> {
                    match value {
                        PgValue::$variant(v) => Ok(v.clone()),
                        other => Err(mismatch::<Self>(other)),
                    }
                }
            }
        )*
    };
}

simple_from_value!(
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
    Interval => Interval,
    Uuid => Uuid,
    JsonValue => Json,
);

impl FromValue for DateTime<Utc> {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::TimestampTz(ts) => Ok(ts.with_timezone(&Utc)),
            other => Err(mismatch::<Self>(other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &PgValue) -> Result<Self> {
        match value {
            PgValue::Array { values, .. } | PgValue::Record(values) => {
                values.iter().map(T::from_value).collect()
            }
            other => Err(mismatch::<Self>(other)),
        }
    }
}

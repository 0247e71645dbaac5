//! Typecasters: raw column bytes to `PgValue`, keyed by type OID.

use std::collections::HashMap;
use std::sync::Arc;

use super::Registry;
use crate::pg::protocol::Format;
use crate::pg::types::{parse_text_array, BinaryArray, Oid, PgValue};
use crate::pg::{PgError, PgResult};

/// Converts one non-NULL raw value.
pub type Typecaster = Arc<dyn Fn(&[u8], Format) -> PgResult<PgValue> + Send + Sync>;

/// Casters keyed by type OID.
pub type CasterMap = HashMap<Oid, Typecaster>;

/// Types decoded by the built-in codecs.
const BUILTIN_TYPES: &[Oid] = &[
    Oid::BOOL,
    Oid::INT2,
    Oid::INT4,
    Oid::INT8,
    Oid::OID,
    Oid::FLOAT4,
    Oid::FLOAT8,
    Oid::NUMERIC,
    Oid::TEXT,
    Oid::VARCHAR,
    Oid::BPCHAR,
    Oid::NAME,
    Oid::CHAR,
    Oid::UNKNOWN,
    Oid::BYTEA,
    Oid::DATE,
    Oid::TIME,
    Oid::TIMETZ,
    Oid::TIMESTAMP,
    Oid::TIMESTAMPTZ,
    Oid::INTERVAL,
    Oid::UUID,
    Oid::JSON,
    Oid::JSONB,
    Oid::RECORD,
];

pub(crate) fn install_defaults(casters: &mut CasterMap) {
    for &oid in BUILTIN_TYPES {
        casters.insert(oid, Arc::new(move |raw, format| PgValue::decode(oid, raw, format)));
    }
    casters.insert(Oid::VOID, Arc::new(|_, _| Ok(PgValue::Null)));
}

/// Caster lookup for one connection: its own casters shadow the registry's.
pub struct Casters<'a> {
    local: Option<&'a CasterMap>,
    global: &'a Registry,
}

impl<'a> Casters<'a> {
    pub fn new(local: Option<&'a CasterMap>, global: &'a Registry) -> Self {
        Self { local, global }
    }

    fn find(&self, oid: Oid) -> Option<&Typecaster> {
        self.local
            .and_then(|local| local.get(&oid))
            .or_else(|| self.global.casters.get(&oid))
    }

    /// Decode one non-NULL value of type `oid`.
    pub fn cast(&self, oid: Oid, raw: &[u8], format: Format) -> PgResult<PgValue> {
        if let Some(caster) = self.find(oid) {
            return caster(raw, format);
        }
        if let Some(element) = oid.array_element().filter(|e| self.find(*e).is_some()) {
            return self.cast_array(element, raw, format);
        }
        match format {
            Format::Text => std::str::from_utf8(raw)
                .map(|s| PgValue::Text(s.to_string()))
                .map_err(|e| PgError::Type(format!("invalid UTF-8 in value of type {}: {}", oid, e))),
            Format::Binary => Ok(PgValue::Raw {
                oid,
                data: raw.to_vec(),
            }),
        }
    }

    fn cast_array(&self, element: Oid, raw: &[u8], format: Format) -> PgResult<PgValue> {
        match format {
            Format::Text => {
                let text = std::str::from_utf8(raw)
                    .map_err(|e| PgError::Type(format!("invalid UTF-8 in array: {}", e)))?;
                parse_text_array(text)?
                    .build(element, &mut |item| self.cast(element, item.as_bytes(), Format::Text))
            }
            Format::Binary => {
                let array = BinaryArray::parse(raw)?;
                let element = if array.element == Oid::UNSPECIFIED {
                    element
                } else {
                    array.element
                };
                array.build(&mut |item| self.cast(element, item, Format::Binary))
            }
        }
    }
}

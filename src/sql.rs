//! Client-side query building.
//!
//! Queries use `%s` (positional) or `%(name)s` (named) placeholders, with
//! `%%` standing for a literal percent sign. Parameters are adapted through
//! the registry and inlined as SQL literals; this is the only place where
//! host values become query text.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::pg::types::{Numeric, PgValue};
use crate::registry::{Adaptable, Registry};

/// Query parameters.
#[derive(Default)]
pub enum Params<'a> {
    /// No parameters: the query is sent verbatim, `%` included.
    #[default]
    None,
    Positional(Vec<&'a dyn Adaptable>),
    Named(Vec<(&'a str, &'a dyn Adaptable)>),
}

impl Params<'_> {
    pub fn is_none(&self) -> bool {
        matches!(self, Params::None)
    }

    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(values) => values.len(),
            Params::Named(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<()> for Params<'_> {
    fn from(_: ()) -> Self {
        Params::None
    }
}

impl<'a, T: Adaptable + 'static> From<&'a [T]> for Params<'a> {
    fn from(values: &'a [T]) -> Self {
        Params::Positional(values.iter().map(|v| v as &dyn Adaptable).collect())
    }
}

impl<'a, T: Adaptable + 'static> From<&'a Vec<T>> for Params<'a> {
    fn from(values: &'a Vec<T>) -> Self {
        values.as_slice().into()
    }
}

impl<'a> From<Vec<&'a dyn Adaptable>> for Params<'a> {
    fn from(values: Vec<&'a dyn Adaptable>) -> Self {
        Params::Positional(values)
    }
}

/// Positional query parameters: `params![1, "two", None::<i32>]`.
#[macro_export]
macro_rules! params {
    () => {
        $crate::sql::Params::Positional(::std::vec::Vec::new())
    };
    ($($value:expr),+ $(,)?) => {
        $crate::sql::Params::Positional(::std::vec![
            $(&$value as &dyn $crate::registry::Adaptable),+
        ])
    };
}

/// Named query parameters: `named_params! { "id" => 7, "name" => "x" }`.
#[macro_export]
macro_rules! named_params {
    ($($name:expr => $value:expr),* $(,)?) => {
        $crate::sql::Params::Named(::std::vec![
            $(($name, &$value as &dyn $crate::registry::Adaptable)),*
        ])
    };
}

/// Server settings that affect literal quoting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quoting {
    pub standard_conforming_strings: bool,
}

impl Default for Quoting {
    fn default() -> Self {
        Self {
            standard_conforming_strings: true,
        }
    }
}

// ============================================================================
// Placeholder scanning
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Piece<'s> {
    Literal(&'s str),
    Percent,
    Positional,
    Named(&'s str),
}

fn scan(sql: &str) -> Result<Vec<Piece<'_>>> {
    let mut pieces = Vec::new();
    let bytes = sql.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        if start < i {
            pieces.push(Piece::Literal(&sql[start..i]));
        }
        match bytes.get(i + 1) {
            Some(b'%') => {
                pieces.push(Piece::Percent);
                i += 2;
            }
            Some(b's') => {
                pieces.push(Piece::Positional);
                i += 2;
            }
            Some(b'(') => {
                let close = sql[i + 2..].find(')').map(|n| i + 2 + n).ok_or_else(|| {
                    Error::programming("incomplete placeholder: '%(' without ')'")
                })?;
                if bytes.get(close + 1) != Some(&b's') {
                    return Err(Error::programming(
                        "only '%s', '%%', and '%(name)s' placeholders allowed",
                    ));
                }
                pieces.push(Piece::Named(&sql[i + 2..close]));
                i = close + 2;
            }
            Some(_) => {
                return Err(Error::programming(
                    "only '%s', '%%', and '%(name)s' placeholders allowed",
                ))
            }
            None => return Err(Error::programming("incomplete placeholder: '%' at end of query")),
        }
        start = i;
    }
    if start < bytes.len() {
        pieces.push(Piece::Literal(&sql[start..]));
    }
    Ok(pieces)
}

fn mixed_formats() -> Error {
    Error::programming("argument formats can't be mixed")
}

/// Substitute adapted parameters into `sql`.
pub fn build_query(
    sql: &str,
    params: &Params<'_>,
    registry: &Registry,
    quoting: Quoting,
) -> Result<Vec<u8>> {
    if params.is_none() {
        return Ok(sql.as_bytes().to_vec());
    }

    let mut out = String::with_capacity(sql.len() + 16 * params.len());
    let mut next_positional = 0;
    let mut named_literals: HashMap<&str, String> = HashMap::new();

    for piece in scan(sql)? {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            Piece::Percent => out.push('%'),
            Piece::Positional => {
                let Params::Positional(values) = params else {
                    return Err(mixed_formats());
                };
                let value = values.get(next_positional).ok_or_else(|| {
                    Error::programming("not enough arguments for format string")
                })?;
                next_positional += 1;
                out.push_str(&to_sql_literal(&registry.adapt(*value)?, quoting)?);
            }
            Piece::Named(name) => {
                let Params::Named(values) = params else {
                    return Err(mixed_formats());
                };
                if let Some(literal) = named_literals.get(name) {
                    out.push_str(literal);
                    continue;
                }
                let (_, value) = values.iter().find(|(key, _)| *key == name).ok_or_else(|| {
                    Error::programming(format!("query parameter missing: {}", name))
                })?;
                let literal = to_sql_literal(&registry.adapt(*value)?, quoting)?;
                out.push_str(&literal);
                named_literals.insert(name, literal);
            }
        }
    }

    if let Params::Positional(values) = params {
        if next_positional < values.len() {
            return Err(Error::programming(
                "not all arguments converted during string formatting",
            ));
        }
    }

    Ok(out.into_bytes())
}

/// A query rewritten for the extended protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerQuery {
    /// SQL with `$n` parameters
    pub sql: String,
    /// One entry per `$n`: `None` for positional, the name for named
    pub params: Vec<Option<String>>,
}

/// Rewrite `%s`/`%(name)s` placeholders into `$n` parameters.
///
/// Repeated names share one parameter.
pub fn convert_placeholders(sql: &str) -> Result<ServerQuery> {
    let mut out = String::with_capacity(sql.len());
    let mut params: Vec<Option<String>> = Vec::new();
    let mut positional = false;
    let mut named = false;

    for piece in scan(sql)? {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            Piece::Percent => out.push('%'),
            Piece::Positional => {
                if named {
                    return Err(mixed_formats());
                }
                positional = true;
                params.push(None);
                out.push_str(&format!("${}", params.len()));
            }
            Piece::Named(name) => {
                if positional {
                    return Err(mixed_formats());
                }
                named = true;
                let index = match params.iter().position(|p| p.as_deref() == Some(name)) {
                    Some(index) => index + 1,
                    None => {
                        params.push(Some(name.to_string()));
                        params.len()
                    }
                };
                out.push_str(&format!("${}", index));
            }
        }
    }

    Ok(ServerQuery { sql: out, params })
}

/// Bind values for a converted query, in `$n` order.
pub fn bind_params<'p>(
    query: &ServerQuery,
    params: &Params<'p>,
) -> Result<Vec<&'p dyn Adaptable>> {
    match params {
        Params::None if query.params.is_empty() => Ok(Vec::new()),
        Params::None => Err(Error::programming("not enough arguments for format string")),
        Params::Positional(values) => {
            if query.params.iter().any(Option::is_some) {
                return Err(mixed_formats());
            }
            match values.len().cmp(&query.params.len()) {
                std::cmp::Ordering::Less => {
                    Err(Error::programming("not enough arguments for format string"))
                }
                std::cmp::Ordering::Greater => Err(Error::programming(
                    "not all arguments converted during string formatting",
                )),
                std::cmp::Ordering::Equal => Ok(values.clone()),
            }
        }
        Params::Named(values) => query
            .params
            .iter()
            .map(|name| {
                let name = name.as_deref().ok_or_else(mixed_formats)?;
                values
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| Error::programming(format!("query parameter missing: {}", name)))
            })
            .collect(),
    }
}

// ============================================================================
// Literals
// ============================================================================

/// Quote a string as an SQL literal.
pub fn quote_literal(s: &str, quoting: Quoting) -> Result<String> {
    if s.contains('\0') {
        return Err(Error::Adaptation(
            "A string literal cannot contain NUL (0x00) characters.".into(),
        ));
    }
    let escape_backslashes = !quoting.standard_conforming_strings && s.contains('\\');
    let mut out = String::with_capacity(s.len() + 3);
    if escape_backslashes {
        out.push('E');
    }
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' if escape_backslashes => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out.push('\'');
    Ok(out)
}

/// Quote an identifier (table, column, cursor name).
pub fn quote_ident(s: &str) -> Result<String> {
    if s.contains('\0') {
        return Err(Error::Adaptation(
            "An identifier cannot contain NUL (0x00) characters.".into(),
        ));
    }
    Ok(format!("\"{}\"", s.replace('"', "\"\"")))
}

/// Negative numbers get a leading space so `-%s` never becomes a `--` comment.
fn signed(text: String) -> String {
    if text.starts_with('-') {
        format!(" {}", text)
    } else {
        text
    }
}

fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "'NaN'::float".to_string()
    } else if v.is_infinite() {
        if v > 0.0 {
            "'Infinity'::float".to_string()
        } else {
            "'-Infinity'::float".to_string()
        }
    } else {
        signed(format!("{:?}", v))
    }
}

fn numeric_literal(n: &Numeric) -> String {
    match n.as_str() {
        "NaN" | "Infinity" | "-Infinity" => format!("'{}'::numeric", n),
        s => signed(s.to_string()),
    }
}

fn typed(value: &PgValue, cast: &str, quoting: Quoting) -> Result<String> {
    Ok(format!("{}::{}", quote_literal(&value.encode_text()?, quoting)?, cast))
}

fn array_items(values: &[PgValue], quoting: Quoting) -> Result<String> {
    let items = values
        .iter()
        .map(|v| match v {
            PgValue::Array { values, .. } => Ok(format!("[{}]", array_items(values, quoting)?)),
            other => to_sql_literal(other, quoting),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(items.join(","))
}

/// Render an adapted value as an SQL literal.
pub fn to_sql_literal(value: &PgValue, quoting: Quoting) -> Result<String> {
    let literal = match value {
        PgValue::Null => "NULL".to_string(),
        PgValue::Bool(true) => "true".to_string(),
        PgValue::Bool(false) => "false".to_string(),
        PgValue::Int2(v) => signed(v.to_string()),
        PgValue::Int4(v) => signed(v.to_string()),
        PgValue::Int8(v) => signed(v.to_string()),
        PgValue::Oid(v) => v.to_string(),
        PgValue::Float4(v) => float_literal(*v as f64),
        PgValue::Float8(v) => float_literal(*v),
        PgValue::Numeric(n) => numeric_literal(n),
        PgValue::Text(s) => quote_literal(s, quoting)?,
        PgValue::Bytea(_) => typed(value, "bytea", quoting)?,
        PgValue::Date(_) => typed(value, "date", quoting)?,
        PgValue::Time(_) => typed(value, "time", quoting)?,
        PgValue::TimeTz(..) => typed(value, "timetz", quoting)?,
        PgValue::Timestamp(_) => typed(value, "timestamp", quoting)?,
        PgValue::TimestampTz(_) => typed(value, "timestamptz", quoting)?,
        PgValue::Interval(_) => typed(value, "interval", quoting)?,
        PgValue::Uuid(_) => typed(value, "uuid", quoting)?,
        PgValue::Json(v) => quote_literal(&v.to_string(), quoting)?,
        PgValue::Array { values, .. } if values.is_empty() => "'{}'".to_string(),
        PgValue::Array { values, .. } => format!("ARRAY[{}]", array_items(values, quoting)?),
        PgValue::Record(fields) => {
            if fields.is_empty() {
                return Err(Error::Adaptation("empty tuple has no SQL representation".into()));
            }
            let fields = fields
                .iter()
                .map(|f| to_sql_literal(f, quoting))
                .collect::<Result<Vec<_>>>()?;
            format!("({})", fields.join(", "))
        }
        PgValue::Sql(s) => s.clone(),
        PgValue::Raw { .. } => quote_literal(&value.encode_text()?, quoting)?,
    };
    Ok(literal)
}

//! Host values and the adapters that turn them into `PgValue`s.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{AdapterKey, Registry};
use crate::error::{Error, Result};
use crate::pg::types::{Interval, Numeric, Oid, PgValue};

/// An interface a host type declares so that one adapter covers many types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability(pub &'static str);

impl Capability {
    /// Ordered elements; adapted to an array.
    pub const SEQUENCE: Capability = Capability("sequence");
    /// Fixed heterogeneous fields; adapted to a row constructor.
    pub const RECORD: Capability = Capability("record");
    /// String-keyed entries; adapted to a JSON object.
    pub const MAPPING: Capability = Capability("mapping");
    /// Zero or one element; adapted to NULL or the element.
    pub const OPTIONAL: Capability = Capability("optional");
    /// Serializable document; adapted to JSON.
    pub const JSON: Capability = Capability("json");
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[doc(hidden)]
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A host value that can be sent as a query parameter.
///
/// Adapters are looked up by the value's exact type first and then by the
/// capabilities it declares, in declaration order. The remaining methods
/// expose structure to capability adapters.
pub trait Adaptable: AsAny + Send + Sync {
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Identity of a shared container, used to detect self-reference.
    fn identity(&self) -> Option<usize> {
        None
    }

    /// Elements of a sequence, record or optional value.
    fn visit_elements(&self, _f: &mut dyn FnMut(&dyn Adaptable) -> Result<()>) -> Result<()> {
        Ok(())
    }

    /// Entries of a mapping.
    fn visit_entries(
        &self,
        _f: &mut dyn FnMut(&str, &dyn Adaptable) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }

    /// JSON document for values with the JSON capability.
    fn to_json(&self) -> Option<Result<JsonValue>> {
        None
    }

    /// Last-resort textual form, sent as a quoted string.
    fn as_text(&self) -> Option<String> {
        None
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// State carried through one (possibly recursive) adaptation.
pub struct AdaptContext<'r> {
    registry: &'r Registry,
    in_progress: HashSet<usize>,
}

impl<'r> AdaptContext<'r> {
    pub(crate) fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            in_progress: HashSet::new(),
        }
    }

    /// Adapt `value`, recursing through the registry for nested elements.
    pub fn adapt(&mut self, value: &dyn Adaptable) -> Result<PgValue> {
        let identity = value.identity();
        if let Some(id) = identity {
            if !self.in_progress.insert(id) {
                return Err(Error::Adaptation(format!(
                    "{} contains itself",
                    value.type_name()
                )));
            }
        }
        let result = self.dispatch(value);
        if let Some(id) = identity {
            self.in_progress.remove(&id);
        }
        result
    }

    fn dispatch(&mut self, value: &dyn Adaptable) -> Result<PgValue> {
        let registry = self.registry;
        let exact = AdapterKey::Type(value.as_any().type_id());
        if let Some(adapter) = registry.adapters.get(&exact) {
            return adapter(value, self);
        }
        for capability in value.capabilities() {
            if let Some(adapter) = registry.adapters.get(&AdapterKey::Capability(*capability)) {
                return adapter(value, self);
            }
        }
        if let Some(text) = value.as_text() {
            return Ok(PgValue::Text(text));
        }
        Err(Error::Adaptation(format!(
            "no adapter registered for {}",
            value.type_name()
        )))
    }
}

/// Type-erased adapter stored in the registry.
pub(crate) type AdapterFn =
    Arc<dyn Fn(&dyn Adaptable, &mut AdaptContext<'_>) -> Result<PgValue> + Send + Sync>;

pub(crate) fn erase<T: Adaptable + 'static>(
    adapter: impl Fn(&T, &mut AdaptContext<'_>) -> Result<PgValue> + Send + Sync + 'static,
) -> AdapterFn {
    Arc::new(move |value, ctx| {
        let value = value.as_any().downcast_ref::<T>().ok_or_else(|| {
            Error::Adaptation(format!(
                "adapter for {} called with {}",
                std::any::type_name::<T>(),
                value.type_name()
            ))
        })?;
        adapter(value, ctx)
    })
}

pub(crate) fn exact_key<T: 'static>() -> AdapterKey {
    AdapterKey::Type(TypeId::of::<T>())
}

// ============================================================================
// Wrapper types
// ============================================================================

/// Binary data, sent as `bytea`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bytea(pub Vec<u8>);

/// An SQL fragment inlined verbatim, e.g. `DEFAULT` or an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsIs(pub String);

/// The SQL NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Null;

/// Any serializable value, sent as a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize + Send + Sync + 'static> Adaptable for Json<T> {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::JSON]
    }

    fn to_json(&self) -> Option<Result<JsonValue>> {
        Some(serde_json::to_value(&self.0).map_err(|e| Error::Adaptation(e.to_string())))
    }
}

/// A list that may be mutated after construction, and may contain itself.
#[derive(Clone, Default)]
pub struct SharedList(Arc<RwLock<Vec<Arc<dyn Adaptable>>>>);

impl SharedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: Arc<dyn Adaptable>) {
        self.0.write().push(value);
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

impl fmt::Debug for SharedList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedList(len={})", self.len())
    }
}

impl Adaptable for SharedList {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::SEQUENCE]
    }

    fn identity(&self) -> Option<usize> {
        Some(Arc::as_ptr(&self.0) as *const () as usize)
    }

    fn visit_elements(&self, f: &mut dyn FnMut(&dyn Adaptable) -> Result<()>) -> Result<()> {
        let items: Vec<Arc<dyn Adaptable>> = self.0.read().clone();
        items.iter().try_for_each(|item| f(item.as_ref()))
    }
}

// ============================================================================
// Adaptable implementations
// ============================================================================

macro_rules! scalar_adaptable {
    ($($t:ty),* $(,)?) => {
        $(impl Adaptable for $t {})*
    };
}

scalar_adaptable!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    f32,
    f64,
    String,
    &'static str,
    Bytea,
    AsIs,
    Null,
    NaiveDate,
    NaiveTime,
    NaiveDateTime,
    DateTime<Utc>,
    DateTime<FixedOffset>,
    Uuid,
    JsonValue,
    Numeric,
    Interval,
    PgValue,
);

impl<T: Adaptable + 'static> Adaptable for Vec<T> {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::SEQUENCE]
    }

    fn visit_elements(&self, f: &mut dyn FnMut(&dyn Adaptable) -> Result<()>) -> Result<()> {
        self.iter().try_for_each(|item| f(item))
    }
}

impl<T: Adaptable + 'static> Adaptable for Option<T> {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::OPTIONAL]
    }

    fn visit_elements(&self, f: &mut dyn FnMut(&dyn Adaptable) -> Result<()>) -> Result<()> {
        match self {
            Some(value) => f(value),
            None => Ok(()),
        }
    }
}

impl<V: Adaptable + 'static> Adaptable for HashMap<String, V> {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::MAPPING]
    }

    fn visit_entries(
        &self,
        f: &mut dyn FnMut(&str, &dyn Adaptable) -> Result<()>,
    ) -> Result<()> {
        // Sorted so the rendered document does not depend on hash order
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().try_for_each(|(k, v)| f(k, v))
    }
}

impl<V: Adaptable + 'static> Adaptable for BTreeMap<String, V> {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::MAPPING]
    }

    fn visit_entries(
        &self,
        f: &mut dyn FnMut(&str, &dyn Adaptable) -> Result<()>,
    ) -> Result<()> {
        self.iter().try_for_each(|(k, v)| f(k, v))
    }
}

impl Adaptable for () {
    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::RECORD]
    }
}

macro_rules! tuple_adaptable {
    ($(($($name:ident : $idx:tt),+)),+ $(,)?) => {
        $(
            impl<$($name: Adaptable + 'static),+> Adaptable for ($($name,)+) {
                fn capabilities(&self) -> &'static [Capability] {
                    &[Capability::RECORD]
                }

                fn visit_elements(
                    &self,
                    f: &mut dyn FnMut(&dyn Adaptable) -> Result<()>,
                ) -> Result<()> {
                    $(f(&self.$idx)?;)+
                    Ok(())
                }
            }
        )+
    };
}

tuple_adaptable!(
    (A: 0),
    (A: 0, B: 1),
    (A: 0, B: 1, C: 2),
    (A: 0, B: 1, C: 2, D: 3),
    (A: 0, B: 1, C: 2, D: 3, E: 4),
    (A: 0, B: 1, C: 2, D: 3, E: 4, F: 5),
);

// ============================================================================
// Built-in adapters
// ============================================================================

fn collect_elements(value: &dyn Adaptable, ctx: &mut AdaptContext<'_>) -> Result<Vec<PgValue>> {
    let mut out = Vec::new();
    value.visit_elements(&mut |item| {
        out.push(ctx.adapt(item)?);
        Ok(())
    })?;
    Ok(out)
}

/// Scalar element type of a (possibly nested) list of adapted values.
fn element_type(values: &[PgValue]) -> Oid {
    values
        .iter()
        .find_map(|v| match v {
            PgValue::Null => None,
            PgValue::Array { element, values } if values.is_empty() => {
                Some(*element).filter(|e| *e != Oid::UNSPECIFIED)
            }
            PgValue::Array { element, .. } => Some(*element),
            other => Some(other.type_oid()),
        })
        .unwrap_or(Oid::UNSPECIFIED)
}

fn adapt_sequence(value: &dyn Adaptable, ctx: &mut AdaptContext<'_>) -> Result<PgValue> {
    let values = collect_elements(value, ctx)?;
    Ok(PgValue::Array {
        element: element_type(&values),
        values,
    })
}

fn adapt_record(value: &dyn Adaptable, ctx: &mut AdaptContext<'_>) -> Result<PgValue> {
    let fields = collect_elements(value, ctx)?;
    if fields.is_empty() {
        return Err(Error::Adaptation("empty tuple has no SQL representation".into()));
    }
    Ok(PgValue::Record(fields))
}

fn adapt_mapping(value: &dyn Adaptable, ctx: &mut AdaptContext<'_>) -> Result<PgValue> {
    let mut object = serde_json::Map::new();
    value.visit_entries(&mut |key, item| {
        let adapted = ctx.adapt(item)?;
        let json = adapted
            .to_json()
            .map_err(|e| Error::Adaptation(e.to_string()))?;
        object.insert(key.to_string(), json);
        Ok(())
    })?;
    Ok(PgValue::Json(JsonValue::Object(object)))
}

fn adapt_optional(value: &dyn Adaptable, ctx: &mut AdaptContext<'_>) -> Result<PgValue> {
    let mut inner = PgValue::Null;
    value.visit_elements(&mut |item| {
        inner = ctx.adapt(item)?;
        Ok(())
    })?;
    Ok(inner)
}

fn adapt_json(value: &dyn Adaptable, _ctx: &mut AdaptContext<'_>) -> Result<PgValue> {
    match value.to_json() {
        Some(json) => Ok(PgValue::Json(json?)),
        None => Err(Error::Adaptation(format!(
            "{} declares JSON but provides no document",
            value.type_name()
        ))),
    }
}

/// Install the standard adapters.
pub(crate) fn install_defaults(registry: &mut Registry) {
    registry.register_adapter::<bool>(|v, _| Ok(PgValue::Bool(*v)));
    registry.register_adapter::<i8>(|v, _| Ok(PgValue::Int2(*v as i16)));
    registry.register_adapter::<i16>(|v, _| Ok(PgValue::Int2(*v)));
    registry.register_adapter::<i32>(|v, _| Ok(PgValue::Int4(*v)));
    registry.register_adapter::<i64>(|v, _| Ok(PgValue::Int8(*v)));
    registry.register_adapter::<u8>(|v, _| Ok(PgValue::Int2(*v as i16)));
    registry.register_adapter::<u16>(|v, _| Ok(PgValue::Int4(*v as i32)));
    registry.register_adapter::<u32>(|v, _| Ok(PgValue::Int8(*v as i64)));
    registry.register_adapter::<f32>(|v, _| Ok(PgValue::Float4(*v)));
    registry.register_adapter::<f64>(|v, _| Ok(PgValue::Float8(*v)));
    registry.register_adapter::<String>(|v, _| Ok(PgValue::Text(v.clone())));
    registry.register_adapter::<&'static str>(|v, _| Ok(PgValue::Text(v.to_string())));
    registry.register_adapter::<Vec<u8>>(|v, _| Ok(PgValue::Bytea(v.clone())));
    registry.register_adapter::<Bytea>(|v, _| Ok(PgValue::Bytea(v.0.clone())));
    registry.register_adapter::<AsIs>(|v, _| Ok(PgValue::Sql(v.0.clone())));
    registry.register_adapter::<Null>(|_, _| Ok(PgValue::Null));
    registry.register_adapter::<NaiveDate>(|v, _| Ok(PgValue::Date(*v)));
    registry.register_adapter::<NaiveTime>(|v, _| Ok(PgValue::Time(*v)));
    registry.register_adapter::<NaiveDateTime>(|v, _| Ok(PgValue::Timestamp(*v)));
    registry.register_adapter::<DateTime<Utc>>(|v, _| Ok(PgValue::TimestampTz(v.fixed_offset())));
    registry.register_adapter::<DateTime<FixedOffset>>(|v, _| Ok(PgValue::TimestampTz(*v)));
    registry.register_adapter::<Uuid>(|v, _| Ok(PgValue::Uuid(*v)));
    registry.register_adapter::<JsonValue>(|v, _| Ok(PgValue::Json(v.clone())));
    registry.register_adapter::<Numeric>(|v, _| Ok(PgValue::Numeric(v.clone())));
    registry.register_adapter::<Interval>(|v, _| Ok(PgValue::Interval(*v)));
    registry.register_adapter::<PgValue>(|v, _| Ok(v.clone()));

    registry.register_capability_adapter(Capability::OPTIONAL, adapt_optional);
    registry.register_capability_adapter(Capability::SEQUENCE, adapt_sequence);
    registry.register_capability_adapter(Capability::RECORD, adapt_record);
    registry.register_capability_adapter(Capability::MAPPING, adapt_mapping);
    registry.register_capability_adapter(Capability::JSON, adapt_json);
}

//! Type adaptation registry.
//!
//! Two directions are covered:
//! - adapters turn host values (`Adaptable`) into `PgValue`s for parameters
//! - typecasters turn raw column bytes into `PgValue`s, by type OID
//!
//! A process-wide registry is reachable through [`global`]. Connections read
//! it on every query and layer their own casters on top. Register global
//! entries before connections start executing; lookups hold a read lock for
//! the duration of one adaptation or one fetch.

mod adapt;
mod convert;
mod typecast;

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::pg::protocol::Format;
use crate::pg::types::{Oid, PgValue};
use crate::pg::PgResult;

pub use adapt::{AdaptContext, Adaptable, AsAny, AsIs, Bytea, Capability, Json, Null, SharedList};
pub use convert::FromValue;
pub use typecast::{CasterMap, Casters, Typecaster};

use adapt::{erase, exact_key, AdapterFn};

/// Key of an adapter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKey {
    Type(TypeId),
    Capability(Capability),
}

/// Adapters and typecasters.
pub struct Registry {
    adapters: HashMap<AdapterKey, AdapterFn>,
    casters: CasterMap,
}

pub type SharedRegistry = Arc<RwLock<Registry>>;

static GLOBAL: Lazy<SharedRegistry> =
    Lazy::new(|| Arc::new(RwLock::new(Registry::with_defaults())));

/// The process-wide registry.
pub fn global() -> SharedRegistry {
    Arc::clone(&GLOBAL)
}

/// Install a global adapter for exact type `T`.
pub fn register_adapter<T: Adaptable + 'static>(
    adapter: impl Fn(&T, &mut AdaptContext<'_>) -> Result<PgValue> + Send + Sync + 'static,
) {
    GLOBAL.write().register_adapter::<T>(adapter);
}

/// Install a global typecaster.
pub fn register_typecaster(
    oid: Oid,
    caster: impl Fn(&[u8], Format) -> PgResult<PgValue> + Send + Sync + 'static,
) {
    GLOBAL.write().register_typecaster(oid, caster);
}

impl Registry {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
            casters: HashMap::new(),
        }
    }

    /// A registry with the standard adapters and typecasters.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        adapt::install_defaults(&mut registry);
        typecast::install_defaults(&mut registry.casters);
        registry
    }

    /// Install the adapter for exact type `T`, replacing any previous one.
    pub fn register_adapter<T: Adaptable + 'static>(
        &mut self,
        adapter: impl Fn(&T, &mut AdaptContext<'_>) -> Result<PgValue> + Send + Sync + 'static,
    ) {
        debug!(ty = std::any::type_name::<T>(), "registering adapter");
        self.adapters.insert(exact_key::<T>(), erase(adapter));
    }

    /// Install the adapter for every value declaring `capability`.
    pub fn register_capability_adapter(
        &mut self,
        capability: Capability,
        adapter: impl Fn(&dyn Adaptable, &mut AdaptContext<'_>) -> Result<PgValue>
            + Send
            + Sync
            + 'static,
    ) {
        debug!(%capability, "registering capability adapter");
        self.adapters
            .insert(AdapterKey::Capability(capability), Arc::new(adapter));
    }

    pub fn has_adapter(&self, key: AdapterKey) -> bool {
        self.adapters.contains_key(&key)
    }

    /// Convert a host value to a `PgValue`.
    pub fn adapt(&self, value: &dyn Adaptable) -> Result<PgValue> {
        AdaptContext::new(self).adapt(value)
    }

    /// Install the caster for `oid`, replacing any previous one.
    pub fn register_typecaster(
        &mut self,
        oid: Oid,
        caster: impl Fn(&[u8], Format) -> PgResult<PgValue> + Send + Sync + 'static,
    ) {
        debug!(%oid, "registering typecaster");
        self.casters.insert(oid, Arc::new(caster));
    }

    pub fn typecaster(&self, oid: Oid) -> Option<&Typecaster> {
        self.casters.get(&oid)
    }

    /// Decode one non-NULL value with the registry's casters only.
    pub fn typecast(&self, oid: Oid, raw: &[u8], format: Format) -> PgResult<PgValue> {
        Casters::new(None, self).cast(oid, raw, format)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

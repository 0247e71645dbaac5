//! Prepared statement management and caching.
//!
//! This module provides:
//! - `PreparedStatement`: Represents a server-side prepared statement
//! - `StatementCache`: O(1) LRU cache for prepared statements per connection

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::protocol::FieldDescription;
use super::types::Oid;

/// Shared column descriptions, handed from the connection to cursors and rows.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Default number of prepared statements kept per connection.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 100;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement that has been parsed by PostgreSQL.
///
/// Prepared statements are created via the Parse message and can be
/// executed multiple times with different parameters via Bind + Execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// Server-side name for this statement (e.g., "__pgb_1")
    pub name: String,
    /// The SQL text, with `$n` placeholders
    pub query: String,
    /// Parameter type OIDs sent with the Parse message
    pub param_types: Vec<Oid>,
}

/// Cache key: the same SQL prepared with different parameter types is a
/// different server-side statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl StatementKey {
    pub fn new(query: impl Into<String>, param_types: Vec<Oid>) -> Self {
        Self {
            query: query.into(),
            param_types,
        }
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache for prepared statements.
///
/// Each connection maintains its own statement cache. Evicted statement
/// names are returned so the connection can Close them on the server.
pub struct StatementCache {
    cache: LruCache<StatementKey, Arc<PreparedStatement>>,
    next_id: u32,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, key: &StatementKey) -> Option<Arc<PreparedStatement>> {
        self.cache.get(key).map(Arc::clone)
    }

    /// Check if a statement is cached without touching LRU order.
    #[inline]
    pub fn contains(&self, key: &StatementKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert a prepared statement into the cache.
    ///
    /// If the cache is at capacity, the least recently used statement
    /// is evicted and its name returned.
    pub fn insert(&mut self, key: StatementKey, statement: PreparedStatement) -> Option<String> {
        match self.cache.push(key, Arc::new(statement)) {
            Some((old_key, old)) if !self.cache.contains(&old_key) => Some(old.name.clone()),
            _ => None,
        }
    }

    /// Generate a unique statement name for this connection.
    pub fn next_statement_name(&mut self) -> String {
        self.next_id += 1;
        format!("__pgb_{}", self.next_id)
    }

    /// Get the number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Forget every statement, e.g. after the session was reset on the
    /// server with `DISCARD ALL`.
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATEMENT_CACHE_CAPACITY)
    }
}

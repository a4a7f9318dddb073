//! Prepared statement names and the per-session statement cache.
use lru::LruCache;
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    num::NonZeroUsize,
    sync::{Arc, atomic::Ordering},
};

use crate::{common::verbose, postgres::Oid, row::Column};

type AtomicId = std::sync::atomic::AtomicU32;

#[derive(Clone, PartialEq, Eq)]
pub struct Id([u8; 8]);

impl Id {
    pub(crate) fn unnamed() -> Self {
        Self([b'?'; 8])
    }

    pub(crate) fn next(atomic: &AtomicId, prefix: u8) -> Self {
        // wraps after 9_999_999, long after any cached name is gone
        let id = atomic.fetch_add(1, Ordering::Relaxed) % 10_000_000;
        let mut buf = [prefix, b'0', b'0', b'0', b'0', b'0', b'0', b'0'];
        let len = buf.len();

        let mut b = itoa::Buffer::new();
        let id = b.format(id);
        let i = id.as_bytes();
        buf[len - i.len()..].copy_from_slice(i);

        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        if self.is_unnamed() {
            return "";
        }
        // SAFETY: only constructed from ascii and is immutable
        unsafe { std::str::from_utf8_unchecked(&self.0[..]) }
    }

    pub fn is_unnamed(&self) -> bool {
        self.0[0] == b'?'
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Id").field(&self.as_str()).finish()
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

macro_rules! delegate {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(Id);

        impl $name {
            pub(crate) fn unnamed() -> Self {
                Self(Id::unnamed())
            }

            pub(crate) fn next() -> Self {
                static ID: AtomicId = AtomicId::new(1);
                Self(Id::next(&ID, $prefix))
            }
        }

        impl std::ops::Deref for $name {
            type Target = Id;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.as_str()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

delegate!(StatementName, b'q');

/// Statement cache policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Every statement is parsed unnamed, nothing stays on the server.
    Disabled,
    /// Cache every distinct statement for the lifetime of the session.
    Unbounded,
    /// Keep at most `n` statements, closing the least recently used.
    Lru(NonZeroUsize),
}

/// A statement prepared on the server.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    name: StatementName,
    sql: Box<str>,
    oids: Box<[Oid]>,
    params: Option<Arc<[Oid]>>,
    columns: Option<Arc<[Column]>>,
}

impl PreparedStatement {
    pub(crate) fn new(
        name: StatementName,
        sql: &str,
        oids: &[Oid],
        params: Option<Arc<[Oid]>>,
        columns: Option<Arc<[Column]>>,
    ) -> Self {
        Self { name, sql: sql.into(), oids: oids.into(), params, columns }
    }

    pub fn name(&self) -> &StatementName {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter types the statement was parsed with.
    pub fn oids(&self) -> &[Oid] {
        &self.oids
    }

    /// Parameter types, as inferred by the server once the statement was described, otherwise
    /// as declared.
    pub fn params(&self) -> &[Oid] {
        match &self.params {
            Some(params) => params,
            None => &self.oids,
        }
    }

    /// Result columns, [`None`] until the statement has been described.
    pub fn columns(&self) -> Option<&Arc<[Column]>> {
        self.columns.as_ref()
    }

    pub(crate) fn is_described(&self) -> bool {
        self.params.is_some() && self.columns.is_some()
    }
}

/// Cache key of `(sql, parameter oids)`.
pub(crate) fn cache_key(sql: &str, oids: &[Oid]) -> u64 {
    let mut buf = DefaultHasher::new();
    sql.hash(&mut buf);
    oids.hash(&mut buf);
    buf.finish()
}

/// Per session prepared statement cache.
///
/// Evicted and discarded statements are queued, the query engine sends their `Close` in front
/// of the next batch.
#[derive(Debug)]
pub struct StatementCache {
    cache: Option<LruCache<u64, PreparedStatement>>,
    pending_close: Vec<StatementName>,
}

impl StatementCache {
    pub fn new(mode: CacheMode) -> Self {
        let cache = match mode {
            CacheMode::Disabled => None,
            CacheMode::Unbounded => Some(LruCache::unbounded()),
            CacheMode::Lru(cap) => Some(LruCache::new(cap)),
        };
        Self { cache, pending_close: Vec::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map(LruCache::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lookup a statement, promoting it as most recently used.
    pub fn get(&mut self, key: u64, sql: &str, oids: &[Oid]) -> Option<&PreparedStatement> {
        let stmt = self.cache.as_mut()?.get(&key)?;
        // hash collision
        if &*stmt.sql != sql || &*stmt.oids != oids {
            return None;
        }
        verbose!(name = %stmt.name, "statement cache hit");
        Some(stmt)
    }

    /// Allocate a name for a new statement, returns [`None`] when caching is disabled.
    pub fn insert(&mut self, key: u64, sql: &str, oids: &[Oid]) -> Option<StatementName> {
        let cache = self.cache.as_mut()?;
        let name = StatementName::next();
        let stmt = PreparedStatement::new(name.clone(), sql, oids, None, None);
        verbose!(name = %name, "statement cache miss");
        if let Some((_, evicted)) = cache.push(key, stmt) {
            verbose!(name = %evicted.name, "statement cache evict");
            self.pending_close.push(evicted.name);
        }
        Some(name)
    }

    /// Record the described result columns.
    pub fn set_columns(&mut self, key: u64, name: &StatementName, columns: Arc<[Column]>) {
        if let Some(stmt) = self.cache.as_mut().and_then(|e| e.peek_mut(&key)) {
            if &stmt.name == name {
                stmt.columns = Some(columns);
            }
        }
    }

    /// Record the parameter types the server inferred.
    pub fn set_params(&mut self, key: u64, name: &StatementName, params: Arc<[Oid]>) {
        if let Some(stmt) = self.cache.as_mut().and_then(|e| e.peek_mut(&key)) {
            if &stmt.name == name {
                stmt.params = Some(params);
            }
        }
    }

    /// Remove a statement the server rejected or that may no longer match, its `Close` is queued.
    pub fn discard(&mut self, key: u64, name: &StatementName) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        if cache.peek(&key).is_some_and(|e| &e.name == name) {
            cache.pop(&key);
        }
        verbose!(name = %name, "statement cache discard");
        self.pending_close.push(name.clone());
    }

    /// Drop every statement, queueing their `Close`.
    pub fn clear(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            while let Some((_, stmt)) = cache.pop_lru() {
                self.pending_close.push(stmt.name);
            }
        }
    }

    pub(crate) fn take_pending_close(&mut self) -> Vec<StatementName> {
        std::mem::take(&mut self.pending_close)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;

    #[test]
    fn statement_name_format() {
        let name = StatementName::next();
        assert_eq!(name.as_str().len(), 8);
        assert!(name.as_str().starts_with('q'));
        assert_eq!(StatementName::unnamed().as_str(), "");
    }

    #[test]
    fn lru_eviction_queues_close() {
        let mut cache = StatementCache::new(CacheMode::Lru(NonZeroUsize::new(2).unwrap()));
        let a = cache.insert(cache_key("a", &[]), "a", &[]).unwrap();
        cache.insert(cache_key("b", &[]), "b", &[]).unwrap();
        assert!(cache.get(cache_key("a", &[]), "a", &[]).is_some());
        let b_evicted = cache.take_pending_close();
        assert!(b_evicted.is_empty());

        cache.insert(cache_key("c", &[]), "c", &[]).unwrap();
        let closed = cache.take_pending_close();
        assert_eq!(closed.len(), 1);
        assert_ne!(closed[0], a, "`a` was used most recently");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn key_includes_parameter_types() {
        assert_ne!(cache_key("select $1", &[oid::INT4]), cache_key("select $1", &[oid::TEXT]));
    }

    #[test]
    fn disabled_cache() {
        let mut cache = StatementCache::new(CacheMode::Disabled);
        assert!(cache.insert(1, "a", &[]).is_none());
        assert!(cache.get(1, "a", &[]).is_none());
    }

    #[test]
    fn discard_and_clear() {
        let mut cache = StatementCache::new(CacheMode::Unbounded);
        let key = cache_key("a", &[]);
        let a = cache.insert(key, "a", &[]).unwrap();
        cache.discard(key, &a);
        assert!(cache.get(key, "a", &[]).is_none());
        assert_eq!(cache.take_pending_close(), [a]);

        cache.insert(cache_key("b", &[]), "b", &[]);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.take_pending_close().len(), 1);
    }

    #[test]
    fn described_parameter_types() {
        let mut cache = StatementCache::new(CacheMode::Unbounded);
        let key = cache_key("select $1", &[]);
        let name = cache.insert(key, "select $1", &[]).unwrap();
        assert!(cache.get(key, "select $1", &[]).unwrap().params().is_empty());

        cache.set_params(key, &name, Arc::from([oid::INT8]));
        cache.set_columns(key, &name, Arc::from([]));
        let stmt = cache.get(key, "select $1", &[]).unwrap();
        assert_eq!(stmt.params(), [oid::INT8]);
        assert!(stmt.oids().is_empty(), "lookup still uses the declared types");
        assert!(stmt.is_described());
    }
}

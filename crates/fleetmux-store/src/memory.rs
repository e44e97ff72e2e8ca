//! In-memory storage backend for testing.
//!
//! Collections are `BTreeMap`s behind a single `RwLock`. Nothing is
//! persistent. Predicates and updates run through the same evaluation
//! functions the Postgres backend uses for its write path, so a test against
//! this backend exercises the production semantics.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::query::{self, Query, Sort};
use crate::update::{self, Update};
use crate::{IndexSpec, StoreBackend, StoreError};

/// An in-memory document store.
///
/// Thread-safe and async-compatible. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<BTreeMap<String, BTreeMap<String, Value>>>>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn insert(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_owned()).or_default();
        if docs.contains_key(key) {
            return Err(StoreError::already_exists(collection, key));
        }
        docs.insert(key.to_owned(), doc);
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        key: &str,
        upd: &Update,
        upsert: bool,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_owned()).or_default();
        match docs.get_mut(key) {
            Some(doc) => update::apply(upd, doc),
            None if upsert => {
                let mut doc = Value::Object(Map::new());
                update::apply(upd, &mut doc)?;
                docs.insert(key.to_owned(), doc);
                Ok(())
            }
            None => Err(StoreError::not_found(collection)),
        }
    }

    async fn update_query(
        &self,
        collection: &str,
        q: &Query,
        sort: &Sort,
        upd: &Update,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_owned()).or_default();
        let mut matching: Vec<&String> = docs
            .iter()
            .filter(|(_, doc)| query::matches(q, doc))
            .map(|(key, _)| key)
            .collect();
        if !sort.is_empty() {
            matching.sort_by(|a, b| {
                // Keys came from the map; both lookups must succeed.
                match (docs.get(*a), docs.get(*b)) {
                    (Some(x), Some(y)) => sort.compare(x, y),
                    _ => std::cmp::Ordering::Equal,
                }
            });
        }
        let key = matching
            .first()
            .map(|k| (*k).clone())
            .ok_or_else(|| StoreError::not_found(collection))?;
        if let Some(doc) = docs.get_mut(&key) {
            update::apply(upd, doc)?;
        }
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        q: &Query,
        sort: &Sort,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.read().await;
        let mut results: Vec<Value> = collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| query::matches(q, doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if !sort.is_empty() {
            results.sort_by(|a, b| sort.compare(a, b));
        }
        Ok(results)
    }

    async fn count(&self, collection: &str, q: &Query) -> Result<u64, StoreError> {
        let collections = self.collections.read().await;
        let count = collections
            .get(collection)
            .map(|docs| docs.values().filter(|doc| query::matches(q, doc)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn remove(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let removed = collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(key));
        match removed {
            Some(_) => Ok(()),
            None => Err(StoreError::not_found(collection)),
        }
    }

    async fn remove_all(&self, collection: &str, q: &Query) -> Result<u64, StoreError> {
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, doc| !query::matches(q, doc));
        Ok((before - docs.len()) as u64)
    }

    async fn ensure_collections(
        &self,
        collections: &[&str],
        _indexes: &[IndexSpec],
    ) -> Result<(), StoreError> {
        let mut guard = self.collections.write().await;
        for name in collections {
            guard.entry((*name).to_owned()).or_default();
        }
        Ok(())
    }
}

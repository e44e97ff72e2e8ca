//! Document catalog store for fleetmux.
//!
//! This crate defines the [`StoreBackend`] trait — a collection/key/document
//! storage interface with query predicates and atomic field-level updates —
//! and the typed [`Store`] front that the broker's catalog layer is built on.
//! The backend knows nothing about controllers, models, or offers; it moves
//! JSON documents.
//!
//! Two implementations are provided:
//!
//! - [`PostgresStore`] — production default, one JSONB document per row
//!   (feature `postgres-backend`)
//! - [`MemoryStore`] — in-memory, for testing
//!
//! Atomicity contract: `insert` is atomic on key collision, `update` and
//! `update_query` apply their whole operation list against a consistent
//! snapshot of one document (compare-and-update when combined with a
//! predicate). This single-document atomicity is the only concurrency
//! primitive the catalog relies on.

mod document;
mod error;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres;
pub mod query;
pub mod update;

use std::sync::Arc;

use serde_json::Value;

pub use document::Document;
pub use error::StoreError;
pub use memory::MemoryStore;
#[cfg(feature = "postgres-backend")]
pub use postgres::PostgresStore;
pub use query::{Query, Sort};
pub use update::Update;

/// A secondary index a backend should maintain for a collection.
///
/// Fields are dot-paths into the document. Backends without native indexing
/// (the memory store) may ignore these; they are a performance contract, not
/// a semantic one — except for `unique`, which the catalog layer additionally
/// enforces by construction of its keys and lookups.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    /// Collection the index belongs to.
    pub collection: &'static str,
    /// Index name, unique within the database.
    pub name: &'static str,
    /// Indexed document fields (dot-paths).
    pub fields: &'static [&'static str],
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

/// A pluggable document storage backend.
///
/// Documents are JSON objects in named collections, addressed by a string
/// key. Implementations must be safe to share across async tasks.
#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Fetch a document by key. Returns `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the backend fails.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert a document under a key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] on key collision.
    async fn insert(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError>;

    /// Atomically apply an update to the document with the given key.
    ///
    /// With `upsert`, a missing document is created as the result of applying
    /// the update to an empty object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the document is absent and
    /// `upsert` is false.
    async fn update(
        &self,
        collection: &str,
        key: &str,
        update: &update::Update,
        upsert: bool,
    ) -> Result<(), StoreError>;

    /// Atomically apply an update to the first document matching a query.
    ///
    /// This is the compare-and-update primitive: the predicate and the
    /// update are evaluated against the same document snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when nothing matches.
    async fn update_query(
        &self,
        collection: &str,
        query: &Query,
        sort: &Sort,
        update: &update::Update,
    ) -> Result<(), StoreError>;

    /// Fetch all documents matching a query, in sort order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the backend fails.
    async fn find(
        &self,
        collection: &str,
        query: &Query,
        sort: &Sort,
    ) -> Result<Vec<Value>, StoreError>;

    /// Count documents matching a query.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the backend fails.
    async fn count(&self, collection: &str, query: &Query) -> Result<u64, StoreError>;

    /// Remove a document by key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    async fn remove(&self, collection: &str, key: &str) -> Result<(), StoreError>;

    /// Remove every document matching a query. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the backend fails.
    async fn remove_all(&self, collection: &str, query: &Query) -> Result<u64, StoreError>;

    /// Create collections and indexes as needed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the backend fails.
    async fn ensure_collections(
        &self,
        collections: &[&str],
        indexes: &[IndexSpec],
    ) -> Result<(), StoreError>;
}

/// The typed front over a [`StoreBackend`].
///
/// Dispatches on the [`Document`] implementation at each call site, so the
/// backend stays object-safe and the callers stay typed.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
}

impl Store {
    /// Wrap a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Fill a document from its key fields.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no document has that key.
    pub async fn get<D: Document>(&self, doc: &mut D) -> Result<(), StoreError> {
        let key = doc.key();
        let value = self
            .backend
            .get(D::collection(), &key)
            .await?
            .ok_or_else(|| StoreError::not_found(D::collection()))?;
        *doc = decode::<D>(value)?;
        Ok(())
    }

    /// Insert a new document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] on key collision.
    pub async fn insert<D: Document>(&self, doc: &D) -> Result<(), StoreError> {
        self.backend
            .insert(D::collection(), &doc.key(), encode(doc)?)
            .await
    }

    /// Atomically update the document with the same key as `doc`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent and `upsert` is false.
    pub async fn update<D: Document>(
        &self,
        doc: &D,
        update: &Update,
        upsert: bool,
    ) -> Result<(), StoreError> {
        self.backend
            .update(D::collection(), &doc.key(), update, upsert)
            .await
    }

    /// Atomically update the document with the given key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent and `upsert` is false.
    pub async fn update_key<D: Document>(
        &self,
        key: &str,
        update: &Update,
        upsert: bool,
    ) -> Result<(), StoreError> {
        self.backend
            .update(D::collection(), key, update, upsert)
            .await
    }

    /// Atomically update the first document matching `query` (in `sort`
    /// order). This is the CAS primitive used for conditional mutations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when nothing matches.
    pub async fn update_query<D: Document>(
        &self,
        query: &Query,
        sort: &Sort,
        update: &Update,
    ) -> Result<(), StoreError> {
        self.backend
            .update_query(D::collection(), query, sort, update)
            .await
    }

    /// Fetch the first document matching `query` in `sort` order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when nothing matches.
    pub async fn find_one<D: Document>(&self, query: &Query, sort: &Sort) -> Result<D, StoreError> {
        let values = self.backend.find(D::collection(), query, sort).await?;
        values
            .into_iter()
            .next()
            .map(decode::<D>)
            .transpose()?
            .ok_or_else(|| StoreError::not_found(D::collection()))
    }

    /// Iterate the documents matching `query` in `sort` order. The callback
    /// may return an error, which aborts iteration and is propagated.
    ///
    /// # Errors
    ///
    /// Returns the callback's error, or any store error, converted into `E`.
    pub async fn for_each<D, E, F>(&self, query: &Query, sort: &Sort, mut f: F) -> Result<(), E>
    where
        D: Document,
        E: From<StoreError>,
        F: FnMut(D) -> Result<(), E>,
    {
        let values = self.backend.find(D::collection(), query, sort).await?;
        for value in values {
            f(decode::<D>(value)?)?;
        }
        Ok(())
    }

    /// Count documents matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the backend fails.
    pub async fn count<D: Document>(&self, query: &Query) -> Result<u64, StoreError> {
        self.backend.count(D::collection(), query).await
    }

    /// Remove the document with the same key as `doc`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    pub async fn remove<D: Document>(&self, doc: &D) -> Result<(), StoreError> {
        self.backend.remove(D::collection(), &doc.key()).await
    }

    /// Remove the document with the given key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when absent.
    pub async fn remove_key<D: Document>(&self, key: &str) -> Result<(), StoreError> {
        self.backend.remove(D::collection(), key).await
    }

    /// Remove every document matching `query`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the backend fails.
    pub async fn remove_all<D: Document>(&self, query: &Query) -> Result<u64, StoreError> {
        self.backend.remove_all(D::collection(), query).await
    }

    /// Create collections and indexes as needed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the backend fails.
    pub async fn ensure_collections(
        &self,
        collections: &[&str],
        indexes: &[IndexSpec],
    ) -> Result<(), StoreError> {
        self.backend.ensure_collections(collections, indexes).await
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

fn encode<D: Document>(doc: &D) -> Result<Value, StoreError> {
    serde_json::to_value(doc).map_err(|e| StoreError::BadDocument {
        collection: D::collection().to_owned(),
        reason: e.to_string(),
    })
}

fn decode<D: Document>(value: Value) -> Result<D, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::BadDocument {
        collection: D::collection().to_owned(),
        reason: e.to_string(),
    })
}

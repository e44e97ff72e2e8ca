//! The [`Document`] trait — what a struct must provide to live in the store.
//!
//! Every document computes its own string key from its path fields (e.g.
//! `bob/prod` for a controller, `aws/bob/default` for a credential). The key
//! fields are part of the serialized body, so a document loaded by query
//! deserializes back with its identity intact and no separate id fixup is
//! needed.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed document stored in a named collection.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The collection this document type lives in.
    fn collection() -> &'static str;

    /// The document's unique key within its collection, derived from its
    /// path fields.
    fn key(&self) -> String;
}

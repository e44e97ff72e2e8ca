//! Atomic field-level updates.
//!
//! An [`Update`] is an ordered list of field operations applied to a document
//! in one atomic step. Like [`crate::query`], the same representation is
//! applied by both backends through [`apply`], so an update has identical
//! semantics in memory and in Postgres.

use serde_json::{Map, Value};

use crate::StoreError;

/// A single field-level operation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Set the field to the value, creating intermediate objects as needed.
    Set(String, Value),
    /// Remove the field. Removing an absent field is a no-op.
    Unset(String),
    /// Append the value to the array field unless an equal element exists.
    /// An absent field becomes a one-element array.
    AddToSet(String, Value),
    /// Remove every array element equal to the value.
    Pull(String, Value),
    /// Append the value to the array field unconditionally.
    Push(String, Value),
}

/// An ordered set of field-level operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    /// An empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `Set` operation.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Set(field.into(), value.into()));
        self
    }

    /// Add an `Unset` operation.
    #[must_use]
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.ops.push(UpdateOp::Unset(field.into()));
        self
    }

    /// Add an `AddToSet` operation.
    #[must_use]
    pub fn add_to_set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::AddToSet(field.into(), value.into()));
        self
    }

    /// Add a `Pull` operation.
    #[must_use]
    pub fn pull(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Pull(field.into(), value.into()));
        self
    }

    /// Add a `Push` operation.
    #[must_use]
    pub fn push(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push(UpdateOp::Push(field.into(), value.into()));
        self
    }

    /// True when the update contains no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// The operations in application order.
    #[must_use]
    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }
}

/// Apply an update to a document in place.
///
/// # Errors
///
/// Returns [`StoreError::BadQuery`] when an operation addresses through a
/// non-object intermediate, or applies an array operation to a non-array
/// field.
pub fn apply(update: &Update, doc: &mut Value) -> Result<(), StoreError> {
    for op in update.ops() {
        match op {
            UpdateOp::Set(field, value) => set_path(doc, field, value.clone())?,
            UpdateOp::Unset(field) => unset_path(doc, field),
            UpdateOp::AddToSet(field, value) => {
                let array = array_at(doc, field)?;
                if !array.iter().any(|e| e == value) {
                    array.push(value.clone());
                }
            }
            UpdateOp::Pull(field, value) => {
                if let Some(Value::Array(array)) = lookup_mut(doc, field) {
                    array.retain(|e| e != value);
                }
            }
            UpdateOp::Push(field, value) => {
                array_at(doc, field)?.push(value.clone());
            }
        }
    }
    Ok(())
}

/// Set a dot-path, creating intermediate objects for missing steps.
fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let object = current.as_object_mut().ok_or_else(|| StoreError::BadQuery {
            reason: format!("cannot set '{path}': '{part}' is addressed through a non-object"),
        })?;
        if parts.peek().is_none() {
            object.insert(part.to_owned(), value);
            return Ok(());
        }
        current = object
            .entry(part.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

fn unset_path(doc: &mut Value, path: &str) {
    let Some((parent_path, leaf)) = split_leaf(path) else {
        return;
    };
    let parent = match parent_path {
        Some(p) => match lookup_mut(doc, p) {
            Some(v) => v,
            None => return,
        },
        None => doc,
    };
    if let Some(object) = parent.as_object_mut() {
        object.remove(leaf);
    }
}

/// Mutable array at the path, created empty when absent.
fn array_at<'v>(doc: &'v mut Value, path: &str) -> Result<&'v mut Vec<Value>, StoreError> {
    let mut current = doc;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let object = current.as_object_mut().ok_or_else(|| StoreError::BadQuery {
            reason: format!("cannot update '{path}': '{part}' is addressed through a non-object"),
        })?;
        let last = parts.peek().is_none();
        let entry = object.entry(part.to_owned()).or_insert_with(|| {
            if last {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        });
        if last {
            return entry.as_array_mut().ok_or_else(|| StoreError::BadQuery {
                reason: format!("field '{path}' is not an array"),
            });
        }
        current = entry;
    }
    Err(StoreError::BadQuery {
        reason: "empty field path".to_owned(),
    })
}

fn lookup_mut<'v>(doc: &'v mut Value, path: &str) -> Option<&'v mut Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object_mut()?.get_mut(part)?;
    }
    Some(current)
}

fn split_leaf(path: &str) -> Option<(Option<&str>, &str)> {
    if path.is_empty() {
        return None;
    }
    match path.rsplit_once('.') {
        Some((parent, leaf)) => Some((Some(parent), leaf)),
        None => Some((None, path)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_intermediate_objects() {
        let mut doc = json!({});
        apply(&Update::new().set("users.alice", 3), &mut doc).unwrap();
        assert_eq!(doc, json!({"users": {"alice": 3}}));
    }

    #[test]
    fn set_overwrites_existing() {
        let mut doc = json!({"users": {"alice": 1}});
        apply(&Update::new().set("users.alice", 3), &mut doc).unwrap();
        assert_eq!(doc, json!({"users": {"alice": 3}}));
    }

    #[test]
    fn unset_removes_field_and_tolerates_absence() {
        let mut doc = json!({"users": {"alice": 3, "bob": 1}});
        apply(&Update::new().unset("users.alice"), &mut doc).unwrap();
        assert_eq!(doc, json!({"users": {"bob": 1}}));
        apply(&Update::new().unset("users.carol"), &mut doc).unwrap();
        apply(&Update::new().unset("missing.deep.path"), &mut doc).unwrap();
    }

    #[test]
    fn add_to_set_deduplicates() {
        let mut doc = json!({"controllers": ["bob/a"]});
        apply(&Update::new().add_to_set("controllers", "bob/a"), &mut doc).unwrap();
        apply(&Update::new().add_to_set("controllers", "bob/b"), &mut doc).unwrap();
        assert_eq!(doc, json!({"controllers": ["bob/a", "bob/b"]}));
    }

    #[test]
    fn add_to_set_creates_missing_array() {
        let mut doc = json!({});
        apply(&Update::new().add_to_set("controllers", "bob/a"), &mut doc).unwrap();
        assert_eq!(doc, json!({"controllers": ["bob/a"]}));
    }

    #[test]
    fn pull_removes_matching_elements() {
        let mut doc = json!({"controllers": ["bob/a", "bob/b", "bob/a"]});
        apply(&Update::new().pull("controllers", "bob/a"), &mut doc).unwrap();
        assert_eq!(doc, json!({"controllers": ["bob/b"]}));
        // Pulling from an absent field is a no-op.
        apply(&Update::new().pull("missing", "x"), &mut doc).unwrap();
    }

    #[test]
    fn push_appends_unconditionally() {
        let mut doc = json!({"log": ["a"]});
        apply(&Update::new().push("log", "a"), &mut doc).unwrap();
        assert_eq!(doc, json!({"log": ["a", "a"]}));
    }

    #[test]
    fn array_op_on_scalar_is_rejected() {
        let mut doc = json!({"name": "x"});
        let err = apply(&Update::new().push("name", 1), &mut doc).unwrap_err();
        assert!(matches!(err, StoreError::BadQuery { .. }));
    }

    #[test]
    fn ops_apply_in_order() {
        let mut doc = json!({});
        let update = Update::new()
            .set("lease.owner", "r1")
            .set("lease.expiry", 100)
            .unset("lease.owner");
        apply(&update, &mut doc).unwrap();
        assert_eq!(doc, json!({"lease": {"expiry": 100}}));
    }
}

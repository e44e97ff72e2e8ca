//! Query predicates over documents.
//!
//! A [`Query`] is a small AST evaluated against the JSON form of a document.
//! Field addressing is dot-path (`users.alice`, `info.life`), matching the
//! nested-map layout of the catalog documents. The same AST drives both the
//! in-memory backend (via [`matches`]) and the SQL translation in the
//! Postgres backend, so a predicate means exactly one thing regardless of
//! where it runs.
//!
//! Semantics worth knowing:
//!
//! - `Eq(field, Null)` matches a missing field as well as an explicit null —
//!   "absent" and "unset" are the same state.
//! - `Eq` against an array field matches when any element equals the value
//!   (array membership).
//! - `Gte` orders numbers numerically and strings lexicographically; values
//!   of different JSON types never satisfy it.
//! - `Nothing` is the impossible predicate: it matches no document. It exists
//!   so that an unparsable filter input can poison exactly one clause instead
//!   of failing the whole query.

use std::cmp::Ordering;

use serde_json::Value;

/// A query predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Matches every document.
    All,
    /// Matches no document.
    Nothing,
    /// Field equals value (or array membership, or absent when value is null).
    Eq(String, Value),
    /// Field is greater than or equal to value (same-type comparison only).
    Gte(String, Value),
    /// Field, rendered as text, matches the regular expression.
    Contains(String, String),
    /// Field presence test.
    Exists(String, bool),
    /// Some element of the array field satisfies all sub-predicates, whose
    /// field paths are relative to the element.
    ElemMatch(String, Vec<Query>),
    /// Conjunction. An empty conjunction matches everything.
    And(Vec<Query>),
    /// Disjunction. An empty disjunction matches nothing.
    Or(Vec<Query>),
}

impl Query {
    /// Equality predicate.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// Greater-or-equal predicate.
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(field.into(), value.into())
    }

    /// Regex-contains predicate.
    pub fn contains(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Contains(field.into(), pattern.into())
    }

    /// Field-existence predicate.
    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Self::Exists(field.into(), exists)
    }

    /// Conjunction of the given predicates.
    #[must_use]
    pub fn and(queries: Vec<Query>) -> Self {
        Self::And(queries)
    }

    /// Disjunction of the given predicates.
    #[must_use]
    pub fn or(queries: Vec<Query>) -> Self {
        Self::Or(queries)
    }
}

/// Look up a dot-path in a JSON value.
///
/// Returns `None` when any intermediate step is missing or not an object.
#[must_use]
pub fn lookup<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Evaluate a query against a document.
#[must_use]
pub fn matches(query: &Query, doc: &Value) -> bool {
    match query {
        Query::All => true,
        Query::Nothing => false,
        Query::Eq(field, expected) => eq_matches(lookup(doc, field), expected),
        Query::Gte(field, bound) => match lookup(doc, field) {
            Some(actual) => value_cmp(actual, bound).is_some_and(Ordering::is_ge),
            None => false,
        },
        Query::Contains(field, pattern) => match lookup(doc, field).and_then(value_text) {
            Some(text) => regex::Regex::new(pattern)
                .map(|re| re.is_match(&text))
                .unwrap_or(false),
            None => false,
        },
        Query::Exists(field, expected) => {
            let present = lookup(doc, field).is_some_and(|v| !v.is_null());
            present == *expected
        }
        Query::ElemMatch(field, subqueries) => match lookup(doc, field) {
            Some(Value::Array(elements)) => elements
                .iter()
                .any(|element| subqueries.iter().all(|q| matches(q, element))),
            _ => false,
        },
        Query::And(queries) => queries.iter().all(|q| matches(q, doc)),
        Query::Or(queries) => queries.iter().any(|q| matches(q, doc)),
    }
}

fn eq_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        // Null matches missing-or-null: absent and unset are the same state.
        (None, Value::Null) => true,
        (Some(v), Value::Null) => v.is_null(),
        (None, _) => false,
        (Some(Value::Array(elements)), expected) if !expected.is_array() => {
            elements.iter().any(|e| e == expected)
        }
        (Some(actual), expected) => actual == expected,
    }
}

/// Order two JSON values of the same scalar type.
///
/// Returns `None` for mismatched or non-scalar types.
fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64()?;
            let y = y.as_f64()?;
            x.partial_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// A sort order: field paths with direction, applied in sequence.
#[derive(Debug, Clone, Default)]
pub struct Sort {
    keys: Vec<(String, bool)>,
}

impl Sort {
    /// The empty sort (backend iteration order).
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Sort ascending by the given field.
    pub fn by(field: impl Into<String>) -> Self {
        Self {
            keys: vec![(field.into(), true)],
        }
    }

    /// Add a further ascending sort key.
    #[must_use]
    pub fn then(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), true));
        self
    }

    /// Add a further descending sort key.
    #[must_use]
    pub fn then_desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), false));
        self
    }

    /// True when no sort keys are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The (field, ascending) pairs in order.
    #[must_use]
    pub fn keys(&self) -> &[(String, bool)] {
        &self.keys
    }

    /// Compare two documents under this sort. Missing fields sort first.
    #[must_use]
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for (field, ascending) in &self.keys {
            let left = lookup(a, field);
            let right = lookup(b, field);
            let ord = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => value_cmp(x, y).unwrap_or(Ordering::Equal),
            };
            let ord = if *ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

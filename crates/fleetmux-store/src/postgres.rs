//! PostgreSQL storage backend.
//!
//! Each collection is a table `(key TEXT PRIMARY KEY, doc JSONB NOT NULL)`.
//! Read-side queries compile the [`Query`] AST into SQL over the JSONB
//! column; write-side updates run a row-locked read-modify-write inside a
//! transaction, applying the same [`crate::update::apply`] used by the
//! memory backend. One evaluation semantics, two execution strategies.
//!
//! Connection health is the pool's problem: sqlx discards broken
//! connections, so a [`StoreError::Transient`] means the next call gets a
//! fresh session.

use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};

use crate::query::{Query, Sort};
use crate::update::{self, Update};
use crate::{IndexSpec, StoreBackend, StoreError};

/// A PostgreSQL-backed document store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transient`] when the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .map_err(transient)?;
        Ok(Self::new(pool))
    }
}

#[async_trait::async_trait]
impl StoreBackend for PostgresStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let table = table_name(collection)?;
        let row = sqlx::query(&format!("SELECT doc FROM {table} WHERE key = $1"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(transient)?;
        row.map(|r| r.try_get::<Value, _>("doc").map_err(transient))
            .transpose()
    }

    async fn insert(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        let table = table_name(collection)?;
        let result = sqlx::query(&format!(
            "INSERT INTO {table} (key, doc) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING"
        ))
        .bind(key)
        .bind(&doc)
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::already_exists(collection, key));
        }
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        key: &str,
        upd: &Update,
        upsert: bool,
    ) -> Result<(), StoreError> {
        let table = table_name(collection)?;
        let mut tx = self.pool.begin().await.map_err(transient)?;
        let row = sqlx::query(&format!("SELECT doc FROM {table} WHERE key = $1 FOR UPDATE"))
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?;
        match row {
            Some(row) => {
                let mut doc: Value = row.try_get("doc").map_err(transient)?;
                update::apply(upd, &mut doc)?;
                write_doc(&mut tx, &table, key, &doc).await?;
            }
            None if upsert => {
                let mut doc = Value::Object(Map::new());
                update::apply(upd, &mut doc)?;
                let result = sqlx::query(&format!(
                    "INSERT INTO {table} (key, doc) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING"
                ))
                .bind(key)
                .bind(&doc)
                .execute(&mut *tx)
                .await
                .map_err(transient)?;
                if result.rows_affected() == 0 {
                    // Lost a race with a concurrent upsert; retryable.
                    return Err(StoreError::Transient {
                        reason: format!("concurrent upsert of '{key}' in '{collection}'"),
                    });
                }
            }
            None => return Err(StoreError::not_found(collection)),
        }
        tx.commit().await.map_err(transient)
    }

    async fn update_query(
        &self,
        collection: &str,
        q: &Query,
        sort: &Sort,
        upd: &Update,
    ) -> Result<(), StoreError> {
        let table = table_name(collection)?;
        let mut args = Vec::new();
        let predicate = render(q, "doc", &mut args, 0)?;
        let order = order_by(sort)?;
        let sql = format!(
            "SELECT key, doc FROM {table} WHERE {predicate}{order} LIMIT 1 FOR UPDATE"
        );

        let mut tx = self.pool.begin().await.map_err(transient)?;
        let row = bind_args(sqlx::query(&sql), &args)
            .fetch_optional(&mut *tx)
            .await
            .map_err(transient)?
            .ok_or_else(|| StoreError::not_found(collection))?;
        let key: String = row.try_get("key").map_err(transient)?;
        let mut doc: Value = row.try_get("doc").map_err(transient)?;
        update::apply(upd, &mut doc)?;
        write_doc(&mut tx, &table, &key, &doc).await?;
        tx.commit().await.map_err(transient)
    }

    async fn find(
        &self,
        collection: &str,
        q: &Query,
        sort: &Sort,
    ) -> Result<Vec<Value>, StoreError> {
        let table = table_name(collection)?;
        let mut args = Vec::new();
        let predicate = render(q, "doc", &mut args, 0)?;
        let order = order_by(sort)?;
        let sql = format!("SELECT doc FROM {table} WHERE {predicate}{order}");
        let rows = bind_args(sqlx::query(&sql), &args)
            .fetch_all(&self.pool)
            .await
            .map_err(transient)?;
        rows.into_iter()
            .map(|r| r.try_get::<Value, _>("doc").map_err(transient))
            .collect()
    }

    async fn count(&self, collection: &str, q: &Query) -> Result<u64, StoreError> {
        let table = table_name(collection)?;
        let mut args = Vec::new();
        let predicate = render(q, "doc", &mut args, 0)?;
        let sql = format!("SELECT COUNT(*) AS n FROM {table} WHERE {predicate}");
        let row = bind_args(sqlx::query(&sql), &args)
            .fetch_one(&self.pool)
            .await
            .map_err(transient)?;
        let n: i64 = row.try_get("n").map_err(transient)?;
        Ok(n.unsigned_abs())
    }

    async fn remove(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let table = table_name(collection)?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE key = $1"))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(collection));
        }
        Ok(())
    }

    async fn remove_all(&self, collection: &str, q: &Query) -> Result<u64, StoreError> {
        let table = table_name(collection)?;
        let mut args = Vec::new();
        let predicate = render(q, "doc", &mut args, 0)?;
        let result = bind_args(
            sqlx::query(&format!("DELETE FROM {table} WHERE {predicate}")),
            &args,
        )
        .execute(&self.pool)
        .await
        .map_err(transient)?;
        Ok(result.rows_affected())
    }

    async fn ensure_collections(
        &self,
        collections: &[&str],
        indexes: &[IndexSpec],
    ) -> Result<(), StoreError> {
        for collection in collections {
            let table = table_name(collection)?;
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, doc JSONB NOT NULL)"
            ))
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        }
        for index in indexes {
            let table = table_name(index.collection)?;
            let name = table_name(index.name)?;
            let exprs = index
                .fields
                .iter()
                .map(|field| Ok(format!("(doc #>> {})", path_literal(field)?)))
                .collect::<Result<Vec<_>, StoreError>>()?
                .join(", ");
            let unique = if index.unique { "UNIQUE " } else { "" };
            sqlx::query(&format!(
                "CREATE {unique}INDEX IF NOT EXISTS {name} ON {table} ({exprs})"
            ))
            .execute(&self.pool)
            .await
            .map_err(transient)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}

async fn write_doc(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    key: &str,
    doc: &Value,
) -> Result<(), StoreError> {
    sqlx::query(&format!("UPDATE {table} SET doc = $2 WHERE key = $1"))
        .bind(key)
        .bind(doc)
        .execute(&mut **tx)
        .await
        .map_err(transient)?;
    Ok(())
}

fn transient(e: sqlx::Error) -> StoreError {
    StoreError::Transient {
        reason: e.to_string(),
    }
}

/// A bind argument for a dynamically built statement.
enum Arg {
    Json(Value),
    Text(String),
}

fn bind_args<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    args: &'q [Arg],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for arg in args {
        query = match arg {
            Arg::Json(v) => query.bind(v),
            Arg::Text(s) => query.bind(s),
        };
    }
    query
}

/// Validate a collection or index name as a safe SQL identifier.
fn table_name(name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(name.to_owned())
    } else {
        Err(StoreError::BadQuery {
            reason: format!("invalid collection name '{name}'"),
        })
    }
}

/// Render a dot-path as a quoted Postgres `text[]` path literal.
fn path_literal(path: &str) -> Result<String, StoreError> {
    let valid = !path.is_empty()
        && path.split('.').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| {
                    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '@')
                })
        });
    if !valid {
        return Err(StoreError::BadQuery {
            reason: format!("invalid field path '{path}'"),
        });
    }
    Ok(format!("'{{{}}}'", path.split('.').collect::<Vec<_>>().join(",")))
}

fn order_by(sort: &Sort) -> Result<String, StoreError> {
    if sort.is_empty() {
        return Ok(String::new());
    }
    let clauses = sort
        .keys()
        .iter()
        .map(|(field, ascending)| {
            let direction = if *ascending { "ASC" } else { "DESC" };
            // NULLS FIRST matches the memory backend's missing-fields-first.
            Ok(format!(
                "doc #> {} {direction} NULLS FIRST",
                path_literal(field)?
            ))
        })
        .collect::<Result<Vec<_>, StoreError>>()?
        .join(", ");
    Ok(format!(" ORDER BY {clauses}"))
}

/// Compile a query into a SQL boolean expression over `root` (a JSONB
/// expression), appending bind arguments as it goes.
fn render(q: &Query, root: &str, args: &mut Vec<Arg>, depth: usize) -> Result<String, StoreError> {
    match q {
        Query::All => Ok("TRUE".to_owned()),
        Query::Nothing => Ok("FALSE".to_owned()),
        Query::Eq(field, value) => {
            let path = path_literal(field)?;
            if value.is_null() {
                return Ok(format!(
                    "({root} #> {path} IS NULL OR {root} #> {path} = 'null'::jsonb)"
                ));
            }
            args.push(Arg::Json(value.clone()));
            let eq = args.len();
            args.push(Arg::Json(Value::Array(vec![value.clone()])));
            let member = args.len();
            Ok(format!(
                "({root} #> {path} = ${eq} OR (jsonb_typeof({root} #> {path}) = 'array' \
                 AND {root} #> {path} @> ${member}))"
            ))
        }
        Query::Gte(field, value) => {
            let path = path_literal(field)?;
            args.push(Arg::Json(value.clone()));
            let ty = args.len();
            args.push(Arg::Json(value.clone()));
            let bound = args.len();
            Ok(format!(
                "({root} #> {path} IS NOT NULL \
                 AND jsonb_typeof({root} #> {path}) = jsonb_typeof(${ty}) \
                 AND {root} #> {path} >= ${bound})"
            ))
        }
        Query::Contains(field, pattern) => {
            let path = path_literal(field)?;
            args.push(Arg::Text(pattern.clone()));
            let re = args.len();
            Ok(format!(
                "(jsonb_typeof({root} #> {path}) = 'string' AND ({root} #>> {path}) ~ ${re})"
            ))
        }
        Query::Exists(field, expected) => {
            let path = path_literal(field)?;
            let present =
                format!("({root} #> {path} IS NOT NULL AND {root} #> {path} <> 'null'::jsonb)");
            if *expected {
                Ok(present)
            } else {
                Ok(format!("NOT {present}"))
            }
        }
        Query::ElemMatch(field, subqueries) => {
            let path = path_literal(field)?;
            let alias = format!("elem{depth}");
            let element = format!("{alias}.value");
            let inner = if subqueries.is_empty() {
                "TRUE".to_owned()
            } else {
                subqueries
                    .iter()
                    .map(|sub| render(sub, &element, args, depth + 1))
                    .collect::<Result<Vec<_>, StoreError>>()?
                    .join(" AND ")
            };
            Ok(format!(
                "(jsonb_typeof({root} #> {path}) = 'array' AND EXISTS \
                 (SELECT 1 FROM jsonb_array_elements({root} #> {path}) AS {alias}(value) \
                 WHERE {inner}))"
            ))
        }
        Query::And(queries) => {
            if queries.is_empty() {
                return Ok("TRUE".to_owned());
            }
            let parts = queries
                .iter()
                .map(|sub| render(sub, root, args, depth))
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
        Query::Or(queries) => {
            if queries.is_empty() {
                return Ok("FALSE".to_owned());
            }
            let parts = queries
                .iter()
                .map(|sub| render(sub, root, args, depth))
                .collect::<Result<Vec<_>, StoreError>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
    }
}

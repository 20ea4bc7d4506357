//! SQLite-backed collection that executes subset loads as SQL.
//!
//! Items are stored as JSON text keyed by their encoded identity. Predicates
//! compile to `json_extract` expressions; every leaf is coalesced to 0/1 so
//! missing fields never turn a comparison into SQL `NULL`. Membership lists
//! bind as a single JSON array read through `json_each`. Sort keys rank by
//! JSON type before value, and ties fall back to insertion order.

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::Value;
use tracing::trace;

use crate::{
    engine::loader::{FieldIdentity, IdentityExtractor, LoadError, SubsetLoader},
    expr::{Expr, FieldPath, Operand},
    query::{LoadSubsetOptions, SortDirection},
    types::{Item, ItemKey},
};

use super::{BackendError, BackendResult};

/// SQL text plus positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledLoad {
    /// Statement text.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<SqlValue>,
}

/// SQLite implementation of [`SubsetLoader`].
pub struct SqliteBackend<I = FieldIdentity> {
    conn: Arc<Mutex<Connection>>,
    identity: I,
}

impl SqliteBackend<FieldIdentity> {
    /// Opens or creates a collection at `path`, keyed by `id`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        Self::open_with_identity(path, FieldIdentity::default())
    }

    /// Opens an in-memory collection keyed by `id`.
    pub fn open_in_memory() -> BackendResult<Self> {
        Self::init_connection(Connection::open_in_memory()?, FieldIdentity::default())
    }
}

impl<I: IdentityExtractor> SqliteBackend<I> {
    /// Opens or creates a collection at `path` keyed by `identity`.
    pub fn open_with_identity(path: impl AsRef<Path>, identity: I) -> BackendResult<Self> {
        Self::init_connection(Connection::open(path)?, identity)
    }

    fn init_connection(conn: Connection, identity: I) -> BackendResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            identity,
        })
    }

    /// Inserts or overwrites `item`.
    pub fn upsert(&self, item: &Item) -> BackendResult<ItemKey> {
        let key = self.key_of(item)?;
        let conn = self.lock();
        upsert_row(&conn, &key, item)?;
        Ok(key)
    }

    /// Upserts every item in one transaction; returns how many were written.
    pub fn upsert_many<'a>(&self, items: impl IntoIterator<Item = &'a Item>) -> BackendResult<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut count = 0usize;
        for item in items {
            let key = self.key_of(item)?;
            upsert_row(&tx, &key, item)?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    }

    /// Deletes the item for `key`; returns whether it existed.
    pub fn remove(&self, key: &ItemKey) -> BackendResult<bool> {
        let encoded = serde_json::to_string(key)?;
        let removed = self
            .lock()
            .execute("DELETE FROM items WHERE item_key = ?1", params![encoded])?;
        Ok(removed > 0)
    }

    /// Current item for `key`.
    pub fn get(&self, key: &ItemKey) -> BackendResult<Option<Item>> {
        let encoded = serde_json::to_string(key)?;
        let payload: Option<String> = self
            .lock()
            .query_row(
                "SELECT payload FROM items WHERE item_key = ?1",
                params![encoded],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(BackendError::from))
            .transpose()
    }

    /// Number of stored items.
    pub fn len(&self) -> BackendResult<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// True when empty.
    pub fn is_empty(&self) -> BackendResult<bool> {
        Ok(self.len()? == 0)
    }

    fn key_of(&self, item: &Item) -> BackendResult<ItemKey> {
        self.identity
            .key_of(item)
            .ok_or_else(|| BackendError::MissingIdentity(self.identity.id_path().to_string()))
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<I: IdentityExtractor> SubsetLoader for SqliteBackend<I> {
    async fn load(&self, options: &LoadSubsetOptions) -> Result<Vec<Item>, LoadError> {
        let compiled = compile_load(options)?;
        trace!(sql = %compiled.sql, "sqlite subset load");
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            run_load(&conn, &compiled)
        })
        .await
        .map_err(|e| LoadError::Backend(format!("join error: {e}")))?
        .map_err(LoadError::from)
    }
}

/// Translates load options into a `SELECT` over the `items` table.
pub fn compile_load(options: &LoadSubsetOptions) -> BackendResult<CompiledLoad> {
    let mut sql = String::from("SELECT payload FROM items");
    let mut params = Vec::new();

    if let Some(filter) = &options.filter {
        sql.push_str(" WHERE ");
        compile_expr(filter, &mut sql, &mut params)?;
    }

    sql.push_str(" ORDER BY ");
    for spec in options.order_by.iter().flatten() {
        let dir = match spec.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        push_field(&spec.field, &mut sql, &mut params);
        sql.push_str(" IS NULL ");
        sql.push_str(dir);
        sql.push_str(", ");
        push_type_rank(&spec.field, &mut sql, &mut params);
        sql.push(' ');
        sql.push_str(dir);
        sql.push_str(", ");
        push_field(&spec.field, &mut sql, &mut params);
        sql.push(' ');
        sql.push_str(dir);
        sql.push_str(", ");
    }
    sql.push_str("rowid ASC");

    if let Some(limit) = options.limit {
        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Integer(i64::try_from(limit.get()).unwrap_or(i64::MAX)));
    }

    Ok(CompiledLoad { sql, params })
}

fn compile_expr(expr: &Expr, sql: &mut String, params: &mut Vec<SqlValue>) -> BackendResult<()> {
    match expr {
        Expr::Cmp { op, lhs, rhs } => {
            sql.push_str("COALESCE((");
            compile_operand(lhs, sql, params)?;
            sql.push(' ');
            sql.push_str(op.sql());
            sql.push(' ');
            compile_operand(rhs, sql, params)?;
            sql.push_str("), 0)");
        }
        Expr::In { values, .. } if values.is_empty() => sql.push('0'),
        // One JSON array parameter keeps large key sets under the bind limit.
        Expr::In { operand, values } => {
            for value in values {
                sql_literal(value)?;
            }
            sql.push_str("COALESCE((");
            compile_operand(operand, sql, params)?;
            sql.push_str(" IN (SELECT value FROM json_each(?))), 0)");
            params.push(SqlValue::Text(serde_json::to_string(values)?));
        }
        Expr::And(children) => compile_joined(children, " AND ", '1', sql, params)?,
        Expr::Or(children) => compile_joined(children, " OR ", '0', sql, params)?,
        Expr::Not(inner) => {
            sql.push_str("(NOT ");
            compile_expr(inner, sql, params)?;
            sql.push(')');
        }
    }
    Ok(())
}

fn compile_joined(
    children: &[Expr],
    sep: &str,
    empty: char,
    sql: &mut String,
    params: &mut Vec<SqlValue>,
) -> BackendResult<()> {
    if children.is_empty() {
        sql.push(empty);
        return Ok(());
    }
    sql.push('(');
    for (idx, child) in children.iter().enumerate() {
        if idx > 0 {
            sql.push_str(sep);
        }
        compile_expr(child, sql, params)?;
    }
    sql.push(')');
    Ok(())
}

fn compile_operand(operand: &Operand, sql: &mut String, params: &mut Vec<SqlValue>) -> BackendResult<()> {
    match operand {
        Operand::Field(path) => push_field(path, sql, params),
        Operand::Literal(value) => {
            sql.push('?');
            params.push(sql_literal(value)?);
        }
    }
    Ok(())
}

fn push_field(path: &FieldPath, sql: &mut String, params: &mut Vec<SqlValue>) {
    sql.push_str("json_extract(payload, ?)");
    params.push(SqlValue::Text(path.to_json_path()));
}

// Mixed types sort number < string < bool < other, as in memory.
fn push_type_rank(path: &FieldPath, sql: &mut String, params: &mut Vec<SqlValue>) {
    sql.push_str(
        "CASE json_type(payload, ?) WHEN 'integer' THEN 0 WHEN 'real' THEN 0 \
         WHEN 'text' THEN 1 WHEN 'true' THEN 2 WHEN 'false' THEN 2 ELSE 3 END",
    );
    params.push(SqlValue::Text(path.to_json_path()));
}

// json_extract yields 1/0 for JSON booleans.
fn sql_literal(value: &Value) -> BackendResult<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(SqlValue::Integer(i)),
            (None, Some(f)) => Ok(SqlValue::Real(f)),
            (None, None) => Err(BackendError::Unsupported(format!("number literal {n}"))),
        },
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(BackendError::Unsupported(format!(
            "non-scalar literal {value}"
        ))),
    }
}

fn upsert_row(conn: &Connection, key: &ItemKey, item: &Item) -> BackendResult<()> {
    let encoded_key = serde_json::to_string(key)?;
    let payload = serde_json::to_string(item)?;
    conn.execute(
        "INSERT INTO items(item_key, payload) VALUES (?1, ?2)
         ON CONFLICT(item_key) DO UPDATE SET payload = excluded.payload",
        params![encoded_key, payload],
    )?;
    Ok(())
}

fn run_load(conn: &Connection, compiled: &CompiledLoad) -> BackendResult<Vec<Item>> {
    let mut stmt = conn.prepare(&compiled.sql)?;
    let rows = stmt.query_map(params_from_iter(compiled.params.iter()), |row| {
        row.get::<_, String>(0)
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?)?);
    }
    Ok(out)
}

//! SQLite storage implementation for location tables

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};
use tracing::debug;

use crate::config::ColumnNames;
use crate::error::{RegistrarError, Result};
use crate::storage::{Condition, DbRow, DbValue, LocationStore, QuerySpec};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool for `database_url`
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the location table using the configured column names
    pub async fn initialize(&self, table: &str, columns: &ColumnNames) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                {ruid} TEXT UNIQUE,
                {user} TEXT NOT NULL,
                {domain} TEXT,
                {contact} TEXT NOT NULL,
                {expires} INTEGER NOT NULL,
                {q} REAL NOT NULL,
                {callid} TEXT NOT NULL,
                {cseq} INTEGER NOT NULL,
                {flags} INTEGER NOT NULL DEFAULT 0,
                {cflags} INTEGER NOT NULL DEFAULT 0,
                {user_agent} TEXT,
                {received} TEXT,
                {path} TEXT,
                {socket} TEXT,
                {methods} INTEGER,
                {instance} TEXT,
                {reg_id} INTEGER NOT NULL DEFAULT 0,
                {last_modified} INTEGER NOT NULL DEFAULT 0
            )",
            table = quote(table),
            ruid = quote(&columns.ruid),
            user = quote(&columns.user),
            domain = quote(&columns.domain),
            contact = quote(&columns.contact),
            expires = quote(&columns.expires),
            q = quote(&columns.q),
            callid = quote(&columns.callid),
            cseq = quote(&columns.cseq),
            flags = quote(&columns.flags),
            cflags = quote(&columns.cflags),
            user_agent = quote(&columns.user_agent),
            received = quote(&columns.received),
            path = quote(&columns.path),
            socket = quote(&columns.socket),
            methods = quote(&columns.methods),
            instance = quote(&columns.instance),
            reg_id = quote(&columns.reg_id),
            last_modified = quote(&columns.last_modified),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!("location table {} ready", table);
        Ok(())
    }

    fn insert_sql(verb: &str, table: &str, values: &[(String, DbValue)]) -> String {
        let cols: Vec<String> = values.iter().map(|(c, _)| quote(c)).collect();
        let marks: Vec<&str> = values.iter().map(|_| "?").collect();
        format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            quote(table),
            cols.join(", "),
            marks.join(", ")
        )
    }

    async fn execute_insert(&self, verb: &str, table: &str, values: &[(String, DbValue)]) -> Result<()> {
        let sql = Self::insert_sql(verb, table, values);
        let mut query = sqlx::query(&sql);
        for (_, value) in values {
            query = bind_value(query, value);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Build a WHERE clause; NULL comparisons become IS / IS NOT
fn where_clause(keys: &[Condition]) -> (String, Vec<&DbValue>) {
    if keys.is_empty() {
        return (String::new(), Vec::new());
    }
    let mut parts = Vec::with_capacity(keys.len());
    let mut binds = Vec::new();
    for cond in keys {
        let column = quote(&cond.column);
        if cond.value.is_null() {
            let op = match cond.op {
                crate::storage::CmpOp::Ne => "IS NOT NULL",
                _ => "IS NULL",
            };
            parts.push(format!("{} {}", column, op));
        } else {
            parts.push(format!("{} {} ?", column, cond.op.as_sql()));
            binds.push(&cond.value);
        }
    }
    (format!(" WHERE {}", parts.join(" AND ")), binds)
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &DbValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        DbValue::Null => query.bind(None::<String>),
        DbValue::Str(s) => query.bind(s.clone()),
        DbValue::Int(v) | DbValue::DateTime(v) => query.bind(*v),
        DbValue::Double(v) => query.bind(*v),
        DbValue::Bitmap(v) => query.bind(*v as i64),
        DbValue::Blob(b) => query.bind(b.clone()),
    }
}

fn decode_row(row: &SqliteRow, width: usize) -> Result<DbRow> {
    let mut out = Vec::with_capacity(width);
    for i in 0..width {
        let kind = {
            let raw = row.try_get_raw(i)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };
        let value = match kind.as_deref() {
            None => DbValue::Null,
            Some("INTEGER") => DbValue::Int(row.try_get::<i64, _>(i)?),
            Some("REAL") => DbValue::Double(row.try_get::<f64, _>(i)?),
            Some("BLOB") => DbValue::Blob(row.try_get::<Vec<u8>, _>(i)?),
            Some(_) => DbValue::Str(row.try_get::<String, _>(i)?),
        };
        out.push(value);
    }
    Ok(out)
}

#[async_trait]
impl LocationStore for SqliteStore {
    async fn insert(&self, table: &str, values: &[(String, DbValue)]) -> Result<()> {
        self.execute_insert("INSERT", table, values).await
    }

    async fn insert_update(
        &self,
        table: &str,
        values: &[(String, DbValue)],
        _key_columns: &[String],
    ) -> Result<()> {
        // relies on the UNIQUE constraint created by `initialize`
        self.execute_insert("INSERT OR REPLACE", table, values).await
    }

    async fn update(
        &self,
        table: &str,
        keys: &[Condition],
        values: &[(String, DbValue)],
    ) -> Result<u64> {
        if values.is_empty() {
            return Err(RegistrarError::Storage("update without columns".to_string()));
        }
        let sets: Vec<String> = values.iter().map(|(c, _)| format!("{} = ?", quote(c))).collect();
        let (clause, binds) = where_clause(keys);
        let sql = format!("UPDATE {} SET {}{}", quote(table), sets.join(", "), clause);

        let mut query = sqlx::query(&sql);
        for (_, value) in values {
            query = bind_value(query, value);
        }
        for value in binds {
            query = bind_value(query, value);
        }
        let done = query.execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn delete(&self, table: &str, keys: &[Condition]) -> Result<u64> {
        let (clause, binds) = where_clause(keys);
        let sql = format!("DELETE FROM {}{}", quote(table), clause);
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let done = query.execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn query(&self, table: &str, spec: &QuerySpec) -> Result<Vec<DbRow>> {
        if spec.columns.is_empty() {
            return Ok(Vec::new());
        }
        let cols: Vec<String> = spec.columns.iter().map(|c| quote(c)).collect();
        let (clause, binds) = where_clause(&spec.keys);
        let mut sql = format!("SELECT {} FROM {}{}", cols.join(", "), quote(table), clause);
        match &spec.order_by {
            Some(order) => sql.push_str(&format!(" ORDER BY {}, id", quote(order))),
            None => sql.push_str(" ORDER BY id"),
        }
        if let Some(limit) = spec.limit {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, spec.offset));
        } else if spec.offset > 0 {
            sql.push_str(&format!(" LIMIT -1 OFFSET {}", spec.offset));
        }

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| decode_row(row, spec.columns.len()))
            .collect()
    }
}

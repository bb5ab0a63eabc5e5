//! In-memory row store
//!
//! Keeps tables as vectors of column maps. Useful for embedding the registry
//! without a database and for exercising synchronization policies in tests:
//! writes can be made to fail on demand and every operation is logged.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{RegistrarError, Result};
use crate::storage::{Condition, DbRow, DbValue, LocationStore, QuerySpec};

type StoredRow = HashMap<String, DbValue>;

/// Kind of operation recorded in the store log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOpKind {
    Insert,
    InsertUpdate,
    Update,
    Delete,
    Query,
}

/// One logged store operation
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOp {
    pub kind: StoreOpKind,
    pub table: String,
    pub keys: Vec<Condition>,
}

/// Row store held in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<StoredRow>>>,
    log: Mutex<Vec<StoreOp>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, AtomicOrdering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, AtomicOrdering::SeqCst);
    }

    /// Number of rows in `table`
    pub async fn row_count(&self, table: &str) -> usize {
        self.tables.lock().await.get(table).map_or(0, Vec::len)
    }

    /// Copy of every row in `table`
    pub async fn rows(&self, table: &str) -> Vec<HashMap<String, DbValue>> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Put a raw row into `table`, bypassing the log
    pub async fn seed(&self, table: &str, values: Vec<(String, DbValue)>) {
        let row: StoredRow = values.into_iter().collect();
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Logged operations so far
    pub async fn operations(&self) -> Vec<StoreOp> {
        self.log.lock().await.clone()
    }

    /// Count of logged operations of `kind`
    pub async fn count_ops(&self, kind: StoreOpKind) -> usize {
        self.log.lock().await.iter().filter(|op| op.kind == kind).count()
    }

    pub async fn clear_log(&self) {
        self.log.lock().await.clear();
    }

    async fn record(&self, kind: StoreOpKind, table: &str, keys: &[Condition]) {
        trace!(?kind, table, "memory store operation");
        self.log.lock().await.push(StoreOp {
            kind,
            table: table.to_string(),
            keys: keys.to_vec(),
        });
    }

    fn check_writable(&self, table: &str) -> Result<()> {
        if self.fail_writes.load(AtomicOrdering::SeqCst) {
            return Err(RegistrarError::Storage(format!(
                "write to table {} rejected",
                table
            )));
        }
        Ok(())
    }

    fn row_matches(row: &StoredRow, keys: &[Condition]) -> bool {
        keys.iter().all(|cond| {
            let stored = row.get(&cond.column).unwrap_or(&DbValue::Null);
            cond.matches(stored)
        })
    }
}

#[async_trait]
impl LocationStore for MemoryStore {
    async fn insert(&self, table: &str, values: &[(String, DbValue)]) -> Result<()> {
        self.check_writable(table)?;
        self.record(StoreOpKind::Insert, table, &[]).await;
        let row: StoredRow = values.iter().cloned().collect();
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row);
        Ok(())
    }

    async fn insert_update(
        &self,
        table: &str,
        values: &[(String, DbValue)],
        key_columns: &[String],
    ) -> Result<()> {
        self.check_writable(table)?;
        let keys: Vec<Condition> = values
            .iter()
            .filter(|(col, _)| key_columns.contains(col))
            .map(|(col, val)| Condition::eq(col.clone(), val.clone()))
            .collect();
        self.record(StoreOpKind::InsertUpdate, table, &keys).await;

        let row: StoredRow = values.iter().cloned().collect();
        let mut tables = self.tables.lock().await;
        let rows = tables.entry(table.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|r| !keys.is_empty() && Self::row_matches(r, &keys))
        {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        keys: &[Condition],
        values: &[(String, DbValue)],
    ) -> Result<u64> {
        self.check_writable(table)?;
        self.record(StoreOpKind::Update, table, keys).await;
        let mut tables = self.tables.lock().await;
        let mut changed = 0;
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| Self::row_matches(r, keys)) {
                for (col, val) in values {
                    row.insert(col.clone(), val.clone());
                }
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete(&self, table: &str, keys: &[Condition]) -> Result<u64> {
        self.check_writable(table)?;
        self.record(StoreOpKind::Delete, table, keys).await;
        let mut tables = self.tables.lock().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !Self::row_matches(r, keys));
        Ok((before - rows.len()) as u64)
    }

    async fn query(&self, table: &str, spec: &QuerySpec) -> Result<Vec<DbRow>> {
        if self.fail_reads.load(AtomicOrdering::SeqCst) {
            return Err(RegistrarError::Storage(format!(
                "read from table {} failed",
                table
            )));
        }
        self.record(StoreOpKind::Query, table, &spec.keys).await;
        let tables = self.tables.lock().await;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut selected: Vec<&StoredRow> = rows
            .iter()
            .filter(|r| Self::row_matches(r, &spec.keys))
            .collect();
        if let Some(order) = &spec.order_by {
            selected.sort_by(|a, b| {
                let va = a.get(order).unwrap_or(&DbValue::Null);
                let vb = b.get(order).unwrap_or(&DbValue::Null);
                va.compare(vb).unwrap_or(Ordering::Equal)
            });
        }

        let limit = spec.limit.unwrap_or(usize::MAX);
        Ok(selected
            .into_iter()
            .skip(spec.offset)
            .take(limit)
            .map(|r| {
                spec.columns
                    .iter()
                    .map(|c| r.get(c).cloned().unwrap_or(DbValue::Null))
                    .collect()
            })
            .collect())
    }
}

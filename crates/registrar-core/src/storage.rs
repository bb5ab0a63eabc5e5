//! Persistence interface for location tables
//!
//! The registry talks to its backing store through [`LocationStore`], a
//! row-oriented interface over named tables with typed, nullable columns.
//! Implement it for different backends (SQL, Redis, Memory, etc.).

use async_trait::async_trait;
use std::cmp::Ordering;

use crate::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A typed column value
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Str(String),
    Int(i64),
    Double(f64),
    /// Seconds since the Unix epoch
    DateTime(i64),
    Bitmap(u32),
    Blob(Vec<u8>),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Text value, `None` for NULL or non-text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer view of any integral column
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DbValue::Int(v) | DbValue::DateTime(v) => Some(*v),
            DbValue::Bitmap(v) => Some(*v as i64),
            DbValue::Double(v) => Some(*v as i64),
            DbValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DbValue::Double(v) => Some(*v),
            DbValue::Int(v) | DbValue::DateTime(v) => Some(*v as f64),
            DbValue::Bitmap(v) => Some(*v as f64),
            DbValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bitmap(&self) -> Option<u32> {
        self.as_i64().map(|v| v as u32)
    }

    /// Optional text helper mapping NULL and empty strings to `None`
    pub fn opt_str(value: Option<&str>) -> DbValue {
        match value {
            Some(s) if !s.is_empty() => DbValue::Str(s.to_string()),
            _ => DbValue::Null,
        }
    }

    /// Ordering used when evaluating conditions; `None` when incomparable
    pub fn compare(&self, other: &DbValue) -> Option<Ordering> {
        match (self, other) {
            (DbValue::Null, DbValue::Null) => Some(Ordering::Equal),
            (DbValue::Null, _) | (_, DbValue::Null) => None,
            (DbValue::Str(a), DbValue::Str(b)) => Some(a.cmp(b)),
            (DbValue::Blob(a), DbValue::Blob(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

/// One result row, values in the order of the requested columns
pub type DbRow = Vec<DbValue>;

/// Comparison operator in a match condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// `column <op> value`; conditions in a list are AND-ed
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: CmpOp,
    pub value: DbValue,
}

impl Condition {
    pub fn new(column: impl Into<String>, op: CmpOp, value: DbValue) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: DbValue) -> Self {
        Self::new(column, CmpOp::Eq, value)
    }

    /// Evaluate against a stored value. NULL only equals NULL.
    pub fn matches(&self, stored: &DbValue) -> bool {
        if self.value.is_null() || stored.is_null() {
            let both = self.value.is_null() && stored.is_null();
            return match self.op {
                CmpOp::Eq => both,
                CmpOp::Ne => !both,
                _ => false,
            };
        }
        match stored.compare(&self.value) {
            Some(ord) => match self.op {
                CmpOp::Eq => ord == Ordering::Equal,
                CmpOp::Ne => ord != Ordering::Equal,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
            },
            None => self.op == CmpOp::Ne,
        }
    }
}

/// Select request: filter, projection, ordering and paging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub keys: Vec<Condition>,
    pub columns: Vec<String>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl QuerySpec {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            ..Default::default()
        }
    }

    pub fn filter(mut self, keys: Vec<Condition>) -> Self {
        self.keys = keys;
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Abstract row store used by the registry
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Insert a row
    async fn insert(&self, table: &str, values: &[(String, DbValue)]) -> Result<()>;

    /// Insert a row, replacing any row with equal `key_columns`
    async fn insert_update(
        &self,
        table: &str,
        values: &[(String, DbValue)],
        key_columns: &[String],
    ) -> Result<()>;

    /// Update matching rows, returning how many changed
    async fn update(
        &self,
        table: &str,
        keys: &[Condition],
        values: &[(String, DbValue)],
    ) -> Result<u64>;

    /// Delete matching rows, returning how many were removed
    async fn delete(&self, table: &str, keys: &[Condition]) -> Result<u64>;

    /// Select rows
    async fn query(&self, table: &str, spec: &QuerySpec) -> Result<Vec<DbRow>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_null_semantics() {
        let is_null = Condition::eq("path", DbValue::Null);
        assert!(is_null.matches(&DbValue::Null));
        assert!(!is_null.matches(&DbValue::Str("<sip:p>".into())));

        let lt = Condition::new("expires", CmpOp::Lt, DbValue::DateTime(100));
        assert!(lt.matches(&DbValue::DateTime(99)));
        assert!(lt.matches(&DbValue::Int(0)));
        assert!(!lt.matches(&DbValue::Null));
    }

    #[test]
    fn test_numeric_views() {
        assert_eq!(DbValue::Str(" 42 ".into()).as_i64(), Some(42));
        assert_eq!(DbValue::Bitmap(7).as_i64(), Some(7));
        assert_eq!(DbValue::Int(1).as_f64(), Some(1.0));
        assert_eq!(DbValue::opt_str(Some("")), DbValue::Null);
    }
}

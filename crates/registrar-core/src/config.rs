//! Registry configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RegistrarError, Result};

/// Cache-consistency policy toward the backing store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Memory only, the store is never written
    None,
    /// Every mutation is written synchronously before returning
    WriteThrough,
    /// Mutations are flushed by the maintenance timer
    WriteBack,
    /// No cache, every read and write goes to the store
    StoreOnly,
}

impl SyncPolicy {
    /// Whether records are cached in the domain hash table
    pub fn caches(&self) -> bool {
        !matches!(self, SyncPolicy::StoreOnly)
    }

    /// Whether the policy talks to a backing store at all
    pub fn uses_store(&self) -> bool {
        !matches!(self, SyncPolicy::None)
    }

    /// Whether startup preloads the cache from the store
    pub fn preloads(&self) -> bool {
        matches!(self, SyncPolicy::WriteThrough | SyncPolicy::WriteBack)
    }
}

/// How a REGISTER contact is matched against the stored bindings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchingMode {
    /// Contact URI only
    ContactOnly,
    /// Contact URI and Call-ID
    ContactCallid,
    /// Contact URI and Path
    ContactPath,
}

impl MatchingMode {
    /// Map the numeric mode used by classic registrar configs
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(MatchingMode::ContactOnly),
            1 => Ok(MatchingMode::ContactCallid),
            2 => Ok(MatchingMode::ContactPath),
            other => Err(RegistrarError::Config(format!(
                "invalid matching mode {}",
                other
            ))),
        }
    }
}

/// Ordering of contacts inside a record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContactOrder {
    /// Ascending q-value, equal q keeps arrival order
    QValue,
    /// Most recently modified first
    LastModifiedDesc,
}

/// Column names of the location table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ColumnNames {
    pub ruid: String,
    pub user: String,
    pub domain: String,
    pub contact: String,
    pub expires: String,
    pub q: String,
    pub callid: String,
    pub cseq: String,
    pub flags: String,
    pub cflags: String,
    pub user_agent: String,
    pub received: String,
    pub path: String,
    pub socket: String,
    pub methods: String,
    pub instance: String,
    pub reg_id: String,
    pub last_modified: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            ruid: "ruid".to_string(),
            user: "username".to_string(),
            domain: "domain".to_string(),
            contact: "contact".to_string(),
            expires: "expires".to_string(),
            q: "q".to_string(),
            callid: "callid".to_string(),
            cseq: "cseq".to_string(),
            flags: "flags".to_string(),
            cflags: "cflags".to_string(),
            user_agent: "user_agent".to_string(),
            received: "received".to_string(),
            path: "path".to_string(),
            socket: "socket".to_string(),
            methods: "methods".to_string(),
            instance: "instance".to_string(),
            reg_id: "reg_id".to_string(),
            last_modified: "last_modified".to_string(),
        }
    }
}

/// Configuration for the location registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Synchronization policy toward the backing store
    pub sync_policy: SyncPolicy,

    /// Number of slots per domain, power of two
    pub hash_size: usize,

    /// Size of the shared slot-lock pool
    pub lock_count: usize,

    /// Contact matching strategy
    pub matching_mode: MatchingMode,

    /// Contact ordering inside a record
    pub contact_order: ContactOrder,

    /// Retransmission window for an equal CSeq, in seconds
    pub cseq_delay: u64,

    /// Maintenance sweep interval in seconds
    pub timer_interval: u64,

    /// Number of sweep workers
    pub timer_workers: usize,

    /// Preload page size
    pub fetch_rows: usize,

    /// Key store updates and deletes by ruid
    pub ops_by_ruid: bool,

    /// Persist updates as upserts
    pub update_as_insert: bool,

    /// Store user and domain parts of the AOR in separate columns
    pub use_domain: bool,

    /// Column name overrides
    pub columns: ColumnNames,

    /// Domain tables registered at init
    pub domains: Vec<String>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::WriteBack,
            hash_size: 1024,
            lock_count: 256,
            matching_mode: MatchingMode::ContactOnly,
            contact_order: ContactOrder::QValue,
            cseq_delay: 20,
            timer_interval: 60,
            timer_workers: 1,
            fetch_rows: 2000,
            ops_by_ruid: false,
            update_as_insert: false,
            use_domain: false,
            columns: ColumnNames::default(),
            domains: vec!["location".to_string()],
        }
    }
}

impl LocationConfig {
    /// Parse a JSON configuration document, then validate it
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: LocationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings the registry cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.hash_size == 0 || !self.hash_size.is_power_of_two() {
            return Err(RegistrarError::Config(format!(
                "hash_size must be a power of two, got {}",
                self.hash_size
            )));
        }
        if self.lock_count == 0 {
            return Err(RegistrarError::Config(
                "lock_count must be at least 1".to_string(),
            ));
        }
        if self.timer_workers == 0 {
            return Err(RegistrarError::Config(
                "timer_workers must be at least 1".to_string(),
            ));
        }
        if self.fetch_rows == 0 {
            return Err(RegistrarError::Config(
                "fetch_rows must be at least 1".to_string(),
            ));
        }
        if self.domains.iter().any(|d| d.is_empty()) {
            return Err(RegistrarError::Config(
                "domain table names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Lock pool size actually allocated
    pub fn effective_lock_count(&self) -> usize {
        self.lock_count.min(self.hash_size).max(1)
    }

    pub fn timer_period(&self) -> Duration {
        Duration::from_secs(self.timer_interval.max(1))
    }
}

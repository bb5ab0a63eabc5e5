//! Startup load of cached domains from the store

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RegistrarError, Result};
use crate::registrar::domain::Domain;

/// Outcome of preloading one domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadStats {
    pub rows: usize,
    pub loaded: usize,
    pub skipped: usize,
    pub pages: usize,
}

/// Page through the domain's table and link every row as a `Sync` contact.
///
/// Bad rows are skipped with a warning; store read failures abort the load.
pub async fn preload_domain(domain: &Domain) -> Result<PreloadStats> {
    let mut stats = PreloadStats::default();
    if !domain.config().sync_policy.preloads() {
        return Ok(stats);
    }
    let table = domain.table().ok_or_else(|| {
        RegistrarError::InvalidState(format!(
            "cannot preload domain {} without a backing store",
            domain.name()
        ))
    })?;
    let page_size = domain.config().fetch_rows.max(1);

    loop {
        let rows = table.load_page(stats.rows, page_size).await?;
        stats.pages += 1;
        stats.rows += rows.len();

        for row in &rows {
            let loaded = match table.decode_full(row) {
                Ok(loaded) => loaded,
                Err(reason) => {
                    warn!(domain = %domain.name(), %reason, "skipping location row");
                    stats.skipped += 1;
                    continue;
                }
            };
            let mut guard = domain.lock(&loaded.aor).await;
            let mut record = guard.insert_record(&loaded.aor).await?;
            match record.load_contact(&loaded.uri, &loaded.info) {
                Ok(()) => stats.loaded += 1,
                Err(e) => {
                    warn!(domain = %domain.name(), aor = %loaded.aor, "skipping location row: {}", e);
                    stats.skipped += 1;
                }
            }
        }

        debug!(domain = %domain.name(), page = stats.pages, rows = rows.len(), "preload page done");
        if rows.len() < page_size {
            break;
        }
    }

    info!(
        domain = %domain.name(),
        loaded = stats.loaded,
        skipped = stats.skipped,
        "domain preloaded"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocationConfig, SyncPolicy};
    use crate::events::ContactCallbacks;
    use crate::registrar::domain::DomainContext;
    use crate::storage::{DbValue, LocationStore, MemoryStore};
    use crate::types::{ContactState, ManualClock};
    use std::sync::Arc;

    fn row(user: &str, contact: &str, ruid: &str, callid: &str) -> Vec<(String, DbValue)> {
        vec![
            ("username".to_string(), DbValue::Str(user.to_string())),
            ("contact".to_string(), DbValue::Str(contact.to_string())),
            ("expires".to_string(), DbValue::DateTime(5_000)),
            ("q".to_string(), DbValue::Double(0.5)),
            ("callid".to_string(), DbValue::Str(callid.to_string())),
            ("cseq".to_string(), DbValue::Int(3)),
            ("flags".to_string(), DbValue::Int(0)),
            ("cflags".to_string(), DbValue::Int(0)),
            ("ruid".to_string(), DbValue::Str(ruid.to_string())),
        ]
    }

    #[tokio::test]
    async fn test_paged_preload_skips_bad_rows() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store
                .seed(
                    "location",
                    row(&format!("user{}", i), "sip:u@1", &format!("r{}", i), "cid"),
                )
                .await;
        }
        // no call-id
        store.seed("location", row("broken", "sip:x@1", "r9", "")).await;

        let ctx = DomainContext {
            config: LocationConfig {
                sync_policy: SyncPolicy::WriteBack,
                hash_size: 16,
                fetch_rows: 2,
                ..Default::default()
            },
            store: Some(store.clone() as Arc<dyn LocationStore>),
            clock: Arc::new(ManualClock::new(1_000)),
            resolver: None,
            callbacks: Arc::new(ContactCallbacks::new()),
        };
        let domain = Domain::new("location", Arc::new(ctx)).unwrap();
        let stats = preload_domain(&domain).await.unwrap();

        assert_eq!(stats.loaded, 5);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.pages, 4);
        assert_eq!(domain.users(), 5);

        let record = domain.snapshot("user3").await.unwrap().unwrap();
        assert_eq!(record.contacts()[0].state(), ContactState::Sync);
        assert_eq!(record.contacts()[0].ruid, "r3");
    }
}

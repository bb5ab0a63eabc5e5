//! Process-wide domain registry

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{LocationConfig, SyncPolicy};
use crate::error::{RegistrarError, Result};
use crate::events::ContactCallbacks;
use crate::registrar::domain::{Domain, DomainContext};
use crate::registrar::preload::{preload_domain, PreloadStats};
use crate::registrar::timer::{sweep_all, ExpiryManager, SweepStats};
use crate::storage::LocationStore;
use crate::types::{Clock, SocketResolver, SystemClock};

/// Owner of every domain table, the lock pools and the sweep workers.
///
/// Build it once with [`LocationRegistry::init`] before any traffic is
/// handled, and call [`LocationRegistry::shutdown`] after the last caller.
pub struct LocationRegistry {
    ctx: Arc<DomainContext>,
    domains: Arc<DashMap<String, Arc<Domain>>>,
    expiry: ExpiryManager,
}

/// Collaborators handed to [`LocationRegistry::init`]
pub struct RegistryParts {
    pub store: Option<Arc<dyn LocationStore>>,
    pub resolver: Option<Arc<dyn SocketResolver>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for RegistryParts {
    fn default() -> Self {
        Self {
            store: None,
            resolver: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl RegistryParts {
    pub fn with_store(mut self, store: Arc<dyn LocationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SocketResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl LocationRegistry {
    /// Validate the configuration, register the configured domains and,
    /// for caching store policies, preload them.
    pub async fn init(config: LocationConfig, parts: RegistryParts) -> Result<Self> {
        let registry = Self::new(config, parts)?;
        if registry.config().sync_policy.preloads() {
            registry.preload().await?;
        }
        Ok(registry)
    }

    /// Build the registry and its domains without touching the store
    pub fn new(config: LocationConfig, parts: RegistryParts) -> Result<Self> {
        config.validate()?;
        if config.sync_policy.uses_store() && parts.store.is_none() {
            return Err(RegistrarError::Config(format!(
                "sync policy {:?} requires a backing store",
                config.sync_policy
            )));
        }

        let names = config.domains.clone();
        let period = config.timer_period();
        let workers = config.timer_workers;
        let ctx = Arc::new(DomainContext {
            config,
            store: parts.store,
            clock: parts.clock,
            resolver: parts.resolver,
            callbacks: Arc::new(ContactCallbacks::new()),
        });
        let domains = Arc::new(DashMap::new());
        let registry = Self {
            expiry: ExpiryManager::new(domains.clone(), period, workers),
            ctx,
            domains,
        };
        for name in &names {
            registry.register_domain(name)?;
        }
        info!(
            policy = ?registry.config().sync_policy,
            domains = names.len(),
            "location registry initialized"
        );
        Ok(registry)
    }

    pub fn config(&self) -> &LocationConfig {
        &self.ctx.config
    }

    pub fn callbacks(&self) -> &ContactCallbacks {
        &self.ctx.callbacks
    }

    pub fn now(&self) -> i64 {
        self.ctx.clock.now()
    }

    /// Domain `name`, created on first use
    pub fn register_domain(&self, name: &str) -> Result<Arc<Domain>> {
        if name.is_empty() {
            return Err(RegistrarError::Config("empty domain name".to_string()));
        }
        if let Some(existing) = self.domains.get(name) {
            return Ok(existing.clone());
        }
        let domain = Arc::new(Domain::new(name, self.ctx.clone())?);
        let domain = self
            .domains
            .entry(name.to_string())
            .or_insert(domain)
            .clone();
        info!(domain = name, size = domain.size(), "domain registered");
        Ok(domain)
    }

    /// Registered domain `name`
    pub fn get_domain(&self, name: &str) -> Result<Arc<Domain>> {
        self.domains
            .get(name)
            .map(|d| d.clone())
            .ok_or_else(|| RegistrarError::DomainNotFound(name.to_string()))
    }

    /// Every registered domain
    pub fn domains(&self) -> Vec<Arc<Domain>> {
        self.domains.iter().map(|e| e.value().clone()).collect()
    }

    /// Preload every registered domain from the store
    pub async fn preload(&self) -> Result<Vec<(String, PreloadStats)>> {
        let mut out = Vec::new();
        for domain in self.domains() {
            let stats = preload_domain(&domain).await?;
            out.push((domain.name().to_string(), stats));
        }
        Ok(out)
    }

    /// Start the periodic sweep
    pub async fn start_timer(&self) -> Result<()> {
        self.expiry.start().await
    }

    pub async fn stop_timer(&self) -> Result<()> {
        self.expiry.stop().await
    }

    /// One immediate sweep of every domain
    pub async fn sweep(&self) -> SweepStats {
        self.expiry.run_once().await
    }

    /// Write pending write-back contacts to the store now
    pub async fn flush(&self) -> SweepStats {
        if self.config().sync_policy != SyncPolicy::WriteBack {
            debug!("flush requested without write-back, nothing to do");
            return SweepStats::default();
        }
        sweep_all(&self.domains).await
    }

    /// Stop the sweep, flush write-back state and drop every domain
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_timer().await?;
        let stats = self.flush().await;
        if stats.flush_failures > 0 {
            warn!(failures = stats.flush_failures, "contacts left unflushed at shutdown");
        }
        self.domains.clear();
        info!("location registry shut down");
        Ok(())
    }
}

impl std::fmt::Debug for LocationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationRegistry")
            .field("context", &self.ctx)
            .field("domains", &self.domains.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::ManualClock;

    fn parts() -> RegistryParts {
        RegistryParts::default().with_clock(Arc::new(ManualClock::new(1_000)))
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let config = LocationConfig {
            sync_policy: SyncPolicy::None,
            ..Default::default()
        };
        let registry = LocationRegistry::init(config, parts()).await.unwrap();
        let a = registry.register_domain("location").unwrap();
        let b = registry.register_domain("location").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.domains().len(), 1);
        assert!(matches!(
            registry.get_domain("aliases"),
            Err(RegistrarError::DomainNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_policies_require_store() {
        let config = LocationConfig {
            sync_policy: SyncPolicy::WriteThrough,
            ..Default::default()
        };
        assert!(matches!(
            LocationRegistry::init(config, parts()).await,
            Err(RegistrarError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let config = LocationConfig {
            hash_size: 1000,
            sync_policy: SyncPolicy::None,
            ..Default::default()
        };
        assert!(LocationRegistry::init(config, parts()).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_write_back() {
        let store = Arc::new(MemoryStore::new());
        let registry = LocationRegistry::init(
            LocationConfig::default(),
            parts().with_store(store.clone()),
        )
        .await
        .unwrap();
        let domain = registry.get_domain("location").unwrap();
        {
            let mut guard = domain.lock("alice").await;
            let mut record = guard.insert_record("alice").await.unwrap();
            record
                .insert_contact("sip:a@1", &crate::types::ContactInfo::new(0, "cid", 1))
                .await
                .unwrap();
        }
        registry.start_timer().await.unwrap();
        registry.shutdown().await.unwrap();
        assert_eq!(store.row_count("location").await, 1);
        assert!(registry.domains().is_empty());
    }
}

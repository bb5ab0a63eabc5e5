//! Synchronization policies
//!
//! Each [`SyncPolicy`] maps to a [`ContactSync`] implementation that decides
//! what a contact mutation does to the backing store and which state the
//! contact ends up in.
//!
//! | Policy | insert | update | delete | sweep |
//! |---|---|---|---|---|
//! | none | memory only | memory only | free | expire |
//! | write-through | write, `Sync` | write, `Sync` | store delete, free | expire + retry pending |
//! | write-back | `New` | `Sync` -> `Dirty` | mark expired | expire + flush |
//! | store-only | write | write | store delete | one store delete per domain |

use async_trait::async_trait;
use tracing::{error, warn};

use crate::config::SyncPolicy;
use crate::error::{RegistrarError, Result};
use crate::registrar::persist::ContactTable;
use crate::types::{Contact, ContactState, EXPIRED_TIME};

/// What to do with a contact after its delete hook ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    /// Unlink and free now
    RemoveNow,
    /// Leave in place, the next sweep removes it
    Deferred,
}

/// Result of sweeping one contact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Nothing to do
    Keep,
    /// Expired; unlink it
    Expired,
    /// Written to the store and now `Sync`
    Inserted,
    Updated,
    /// Flush failed, retried next sweep
    FlushFailed,
}

/// Store-side behavior of one synchronization policy
#[async_trait]
pub trait ContactSync: Send + Sync {
    /// Policy this implementation stands for
    fn policy(&self) -> SyncPolicy;

    /// Called once a new contact is linked into its record
    async fn on_insert(&self, table: Option<ContactTable<'_>>, contact: &mut Contact) -> Result<()>;

    /// Called after new info was merged into `contact`
    async fn on_update(&self, table: Option<ContactTable<'_>>, contact: &mut Contact) -> Result<()>;

    /// Called before `contact` is removed
    async fn on_delete(
        &self,
        table: Option<ContactTable<'_>>,
        contact: &mut Contact,
    ) -> Result<DeleteAction>;

    /// Called by the maintenance sweep for every cached contact
    async fn on_sweep(&self, table: Option<ContactTable<'_>>, contact: &mut Contact, now: i64)
        -> SweepAction;
}

/// Implementation backing `policy`
pub fn sync_for(policy: SyncPolicy) -> &'static dyn ContactSync {
    match policy {
        SyncPolicy::None => &NoSync,
        SyncPolicy::WriteThrough => &WriteThrough,
        SyncPolicy::WriteBack => &WriteBack,
        SyncPolicy::StoreOnly => &StoreOnly,
    }
}

fn require<'t>(policy: SyncPolicy, table: Option<ContactTable<'t>>) -> Result<ContactTable<'t>> {
    table.ok_or_else(|| {
        RegistrarError::InvalidState(format!("{:?} policy used without a backing store", policy))
    })
}

/// Promote a persisted contact to `Dirty`; `New` never regresses
fn mark_dirty(contact: &mut Contact) {
    if contact.state == ContactState::Sync {
        contact.state = ContactState::Dirty;
    }
}

/// Write a pending contact, promoting it to `Sync` on success
async fn write_pending(table: ContactTable<'_>, contact: &mut Contact) -> Result<SweepAction> {
    match contact.state {
        ContactState::Sync => Ok(SweepAction::Keep),
        ContactState::New => {
            table.insert(contact).await?;
            contact.state = ContactState::Sync;
            Ok(SweepAction::Inserted)
        }
        ContactState::Dirty => {
            table.update(contact).await?;
            contact.state = ContactState::Sync;
            Ok(SweepAction::Updated)
        }
    }
}

/// Store delete for an expired cached contact; failures are only logged
async fn expire_row(table: Option<ContactTable<'_>>, contact: &Contact) {
    if !contact.state.is_persisted() {
        return;
    }
    if let Some(table) = table {
        if let Err(e) = table.delete(contact).await {
            warn!(aor = %contact.aor, ruid = %contact.ruid, "failed to delete expired contact row: {}", e);
        }
    }
}

/// Memory-only registry
#[derive(Debug, Clone, Copy)]
pub struct NoSync;

#[async_trait]
impl ContactSync for NoSync {
    fn policy(&self) -> SyncPolicy {
        SyncPolicy::None
    }

    async fn on_insert(&self, _table: Option<ContactTable<'_>>, _contact: &mut Contact) -> Result<()> {
        Ok(())
    }

    async fn on_update(&self, _table: Option<ContactTable<'_>>, _contact: &mut Contact) -> Result<()> {
        Ok(())
    }

    async fn on_delete(
        &self,
        _table: Option<ContactTable<'_>>,
        _contact: &mut Contact,
    ) -> Result<DeleteAction> {
        Ok(DeleteAction::RemoveNow)
    }

    async fn on_sweep(
        &self,
        _table: Option<ContactTable<'_>>,
        contact: &mut Contact,
        now: i64,
    ) -> SweepAction {
        if contact.is_expired(now) {
            SweepAction::Expired
        } else {
            SweepAction::Keep
        }
    }
}

/// Synchronous writes with an in-memory cache
#[derive(Debug, Clone, Copy)]
pub struct WriteThrough;

#[async_trait]
impl ContactSync for WriteThrough {
    fn policy(&self) -> SyncPolicy {
        SyncPolicy::WriteThrough
    }

    async fn on_insert(&self, table: Option<ContactTable<'_>>, contact: &mut Contact) -> Result<()> {
        let table = require(self.policy(), table)?;
        if let Err(e) = table.insert(contact).await {
            error!(aor = %contact.aor, ruid = %contact.ruid, "write-through insert failed: {}", e);
            return Err(e);
        }
        contact.state = ContactState::Sync;
        Ok(())
    }

    async fn on_update(&self, table: Option<ContactTable<'_>>, contact: &mut Contact) -> Result<()> {
        let table = require(self.policy(), table)?;
        mark_dirty(contact);
        if let Err(e) = write_pending(table, contact).await {
            error!(aor = %contact.aor, ruid = %contact.ruid, "write-through update failed: {}", e);
            return Err(e);
        }
        Ok(())
    }

    async fn on_delete(
        &self,
        table: Option<ContactTable<'_>>,
        contact: &mut Contact,
    ) -> Result<DeleteAction> {
        if contact.state.is_persisted() {
            let table = require(self.policy(), table)?;
            if let Err(e) = table.delete(contact).await {
                error!(aor = %contact.aor, ruid = %contact.ruid, "write-through delete failed: {}", e);
                return Err(e);
            }
        }
        Ok(DeleteAction::RemoveNow)
    }

    async fn on_sweep(
        &self,
        table: Option<ContactTable<'_>>,
        contact: &mut Contact,
        now: i64,
    ) -> SweepAction {
        if contact.is_expired(now) {
            expire_row(table, contact).await;
            return SweepAction::Expired;
        }
        let Some(table) = table else {
            return SweepAction::Keep;
        };
        match write_pending(table, contact).await {
            Ok(action) => action,
            Err(e) => {
                warn!(aor = %contact.aor, ruid = %contact.ruid, "write-through retry failed: {}", e);
                SweepAction::FlushFailed
            }
        }
    }
}

/// Cache with timer-driven flushes
#[derive(Debug, Clone, Copy)]
pub struct WriteBack;

#[async_trait]
impl ContactSync for WriteBack {
    fn policy(&self) -> SyncPolicy {
        SyncPolicy::WriteBack
    }

    async fn on_insert(&self, _table: Option<ContactTable<'_>>, _contact: &mut Contact) -> Result<()> {
        Ok(())
    }

    async fn on_update(&self, _table: Option<ContactTable<'_>>, contact: &mut Contact) -> Result<()> {
        mark_dirty(contact);
        Ok(())
    }

    async fn on_delete(
        &self,
        _table: Option<ContactTable<'_>>,
        contact: &mut Contact,
    ) -> Result<DeleteAction> {
        if !contact.state.is_persisted() {
            return Ok(DeleteAction::RemoveNow);
        }
        contact.expires = EXPIRED_TIME;
        Ok(DeleteAction::Deferred)
    }

    async fn on_sweep(
        &self,
        table: Option<ContactTable<'_>>,
        contact: &mut Contact,
        now: i64,
    ) -> SweepAction {
        if contact.is_expired(now) {
            expire_row(table, contact).await;
            return SweepAction::Expired;
        }
        let Some(table) = table else {
            return SweepAction::Keep;
        };
        let previous = contact.state;
        match write_pending(table, contact).await {
            Ok(action) => action,
            Err(e) => {
                contact.state = previous;
                warn!(aor = %contact.aor, ruid = %contact.ruid, state = ?previous, "write-back flush failed: {}", e);
                SweepAction::FlushFailed
            }
        }
    }
}

/// No cache; the store is the registry
#[derive(Debug, Clone, Copy)]
pub struct StoreOnly;

#[async_trait]
impl ContactSync for StoreOnly {
    fn policy(&self) -> SyncPolicy {
        SyncPolicy::StoreOnly
    }

    async fn on_insert(&self, table: Option<ContactTable<'_>>, contact: &mut Contact) -> Result<()> {
        let table = require(self.policy(), table)?;
        if let Err(e) = table.insert(contact).await {
            error!(aor = %contact.aor, ruid = %contact.ruid, "store insert failed: {}", e);
            return Err(e);
        }
        contact.state = ContactState::Sync;
        Ok(())
    }

    async fn on_update(&self, table: Option<ContactTable<'_>>, contact: &mut Contact) -> Result<()> {
        let table = require(self.policy(), table)?;
        if let Err(e) = table.update(contact).await {
            error!(aor = %contact.aor, ruid = %contact.ruid, "store update failed: {}", e);
            return Err(e);
        }
        contact.state = ContactState::Sync;
        Ok(())
    }

    async fn on_delete(
        &self,
        table: Option<ContactTable<'_>>,
        contact: &mut Contact,
    ) -> Result<DeleteAction> {
        let table = require(self.policy(), table)?;
        if let Err(e) = table.delete(contact).await {
            error!(aor = %contact.aor, ruid = %contact.ruid, "store delete failed: {}", e);
            return Err(e);
        }
        Ok(DeleteAction::RemoveNow)
    }

    async fn on_sweep(
        &self,
        _table: Option<ContactTable<'_>>,
        _contact: &mut Contact,
        _now: i64,
    ) -> SweepAction {
        // expiry is a single store-side delete per domain
        SweepAction::Keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationConfig;
    use crate::registrar::contact::new_contact;
    use crate::storage::memory::StoreOpKind;
    use crate::storage::MemoryStore;
    use crate::types::ContactInfo;

    fn contact(expires: i64) -> Contact {
        new_contact(
            "location",
            "alice",
            "sip:alice@10.0.0.1",
            &ContactInfo::new(expires, "cid", 1).with_ruid("r1"),
        )
        .unwrap()
    }

    fn table<'a>(store: &'a MemoryStore, config: &'a LocationConfig) -> ContactTable<'a> {
        ContactTable {
            table: "location",
            store,
            config,
            resolver: None,
        }
    }

    #[tokio::test]
    async fn test_write_back_transitions() {
        let store = MemoryStore::new();
        let config = LocationConfig::default();
        let wb = sync_for(SyncPolicy::WriteBack);
        let mut c = contact(1_000);

        wb.on_insert(Some(table(&store, &config)), &mut c).await.unwrap();
        assert_eq!(c.state(), ContactState::New);
        wb.on_update(Some(table(&store, &config)), &mut c).await.unwrap();
        assert_eq!(c.state(), ContactState::New);

        let action = wb.on_sweep(Some(table(&store, &config)), &mut c, 500).await;
        assert_eq!(action, SweepAction::Inserted);
        assert_eq!(c.state(), ContactState::Sync);

        wb.on_update(Some(table(&store, &config)), &mut c).await.unwrap();
        assert_eq!(c.state(), ContactState::Dirty);

        store.set_fail_writes(true);
        let action = wb.on_sweep(Some(table(&store, &config)), &mut c, 500).await;
        assert_eq!(action, SweepAction::FlushFailed);
        assert_eq!(c.state(), ContactState::Dirty);
        store.set_fail_writes(false);

        let action = wb.on_delete(Some(table(&store, &config)), &mut c).await.unwrap();
        assert_eq!(action, DeleteAction::Deferred);
        assert_eq!(c.expires, EXPIRED_TIME);
        let action = wb.on_sweep(Some(table(&store, &config)), &mut c, 500).await;
        assert_eq!(action, SweepAction::Expired);
        assert_eq!(store.count_ops(StoreOpKind::Delete).await, 1);
    }

    #[tokio::test]
    async fn test_write_through_surfaces_failures() {
        let store = MemoryStore::new();
        let config = LocationConfig::default();
        let wt = sync_for(SyncPolicy::WriteThrough);
        let mut c = contact(1_000);

        store.set_fail_writes(true);
        assert!(wt.on_insert(Some(table(&store, &config)), &mut c).await.is_err());
        assert_eq!(c.state(), ContactState::New);

        store.set_fail_writes(false);
        let action = wt.on_sweep(Some(table(&store, &config)), &mut c, 10).await;
        assert_eq!(action, SweepAction::Inserted);

        wt.on_update(Some(table(&store, &config)), &mut c).await.unwrap();
        assert_eq!(c.state(), ContactState::Sync);
        assert_eq!(store.count_ops(StoreOpKind::Update).await, 1);

        store.set_fail_writes(true);
        assert!(wt.on_delete(Some(table(&store, &config)), &mut c).await.is_err());
    }

    #[tokio::test]
    async fn test_new_contacts_skip_the_store_on_delete() {
        let store = MemoryStore::new();
        let config = LocationConfig::default();
        for policy in [SyncPolicy::WriteThrough, SyncPolicy::WriteBack] {
            let mut c = contact(1_000);
            let action = sync_for(policy)
                .on_delete(Some(table(&store, &config)), &mut c)
                .await
                .unwrap();
            assert_eq!(action, DeleteAction::RemoveNow);
        }
        assert!(store.operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_contacts_survive_sweeps() {
        let store = MemoryStore::new();
        let config = LocationConfig::default();
        for policy in [SyncPolicy::None, SyncPolicy::WriteThrough, SyncPolicy::WriteBack] {
            let mut c = contact(0);
            let action = sync_for(policy)
                .on_sweep(Some(table(&store, &config)), &mut c, i64::MAX)
                .await;
            assert_ne!(action, SweepAction::Expired);
        }
    }

    #[tokio::test]
    async fn test_store_policies_need_a_store() {
        let mut c = contact(1_000);
        let err = sync_for(SyncPolicy::StoreOnly).on_insert(None, &mut c).await;
        assert!(matches!(err, Err(RegistrarError::InvalidState(_))));
    }
}

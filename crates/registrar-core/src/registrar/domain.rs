//! Domain hash tables
//!
//! A [`Domain`] is a fixed array of slots addressed by `aor_hash & (size - 1)`.
//! Slots are grouped into lock stripes: stripe `k` owns every slot `i` with
//! `i % lock_count == k` and the slot data lives inside that stripe's mutex,
//! so a chain can only be reached through a [`SlotGuard`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::LocationConfig;
use crate::error::{RegistrarError, Result};
use crate::events::ContactCallbacks;
use crate::registrar::contact::{insert_sorted, new_contact};
use crate::registrar::hash::{aor_hash, slot_index};
use crate::registrar::persist::ContactTable;
use crate::registrar::policy::{sync_for, ContactSync};
use crate::registrar::record::{Record, RecordHandle};
use crate::storage::LocationStore;
use crate::types::{Clock, Contact, ContactState, SocketResolver};

/// Collaborators shared by every domain of a registry
pub struct DomainContext {
    pub config: LocationConfig,
    pub store: Option<Arc<dyn LocationStore>>,
    pub clock: Arc<dyn Clock>,
    pub resolver: Option<Arc<dyn SocketResolver>>,
    pub callbacks: Arc<ContactCallbacks>,
}

impl std::fmt::Debug for DomainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainContext")
            .field("sync_policy", &self.config.sync_policy)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

/// Collision chain of records sharing a slot index
#[derive(Debug)]
pub struct Slot {
    pub(crate) index: usize,
    pub(crate) records: Vec<Record>,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            records: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Position of `aor`; the hash is compared first, then the string
    pub(crate) fn position(&self, hash: u32, aor: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.aor_hash() == hash && r.aor() == aor)
    }
}

#[derive(Debug)]
struct Stripe {
    slots: Vec<Slot>,
}

/// One named location table
pub struct Domain {
    name: String,
    size: usize,
    lock_count: usize,
    stripes: Vec<Mutex<Stripe>>,
    ctx: Arc<DomainContext>,
    sync: &'static dyn ContactSync,
    users: AtomicUsize,
    contacts: AtomicUsize,
    expired: AtomicU64,
}

impl Domain {
    /// Allocate an empty table with every slot and lock stripe in place
    pub fn new(name: impl Into<String>, ctx: Arc<DomainContext>) -> Result<Self> {
        let name = name.into();
        let size = ctx.config.hash_size;
        if size == 0 || !size.is_power_of_two() {
            return Err(RegistrarError::Config(format!(
                "domain {}: hash size {} is not a power of two",
                name, size
            )));
        }
        let lock_count = ctx.config.effective_lock_count();
        let stripes = (0..lock_count)
            .map(|k| {
                Mutex::new(Stripe {
                    slots: (k..size).step_by(lock_count).map(Slot::new).collect(),
                })
            })
            .collect();
        debug!(domain = %name, size, lock_count, "domain table allocated");

        Ok(Self {
            name,
            size,
            lock_count,
            stripes,
            sync: sync_for(ctx.config.sync_policy),
            ctx,
            users: AtomicUsize::new(0),
            contacts: AtomicUsize::new(0),
            expired: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn lock_count(&self) -> usize {
        self.lock_count
    }

    pub fn config(&self) -> &LocationConfig {
        &self.ctx.config
    }

    pub fn now(&self) -> i64 {
        self.ctx.clock.now()
    }

    pub fn callbacks(&self) -> &ContactCallbacks {
        &self.ctx.callbacks
    }

    pub(crate) fn sync(&self) -> &'static dyn ContactSync {
        self.sync
    }

    /// Location table of this domain, when a store is attached
    pub fn table(&self) -> Option<ContactTable<'_>> {
        let store = self.ctx.store.as_deref()?;
        Some(ContactTable {
            table: &self.name,
            store,
            config: &self.ctx.config,
            resolver: self.ctx.resolver.as_deref(),
        })
    }

    /// Whether records live in this table rather than only in the store
    pub fn caches(&self) -> bool {
        self.ctx.config.sync_policy.caches()
    }

    /// Slot index of `aor`
    pub fn slot_of(&self, aor: &str) -> usize {
        slot_index(aor_hash(aor), self.size)
    }

    /// Lock the slot `aor` hashes to
    pub async fn lock(&self, aor: &str) -> SlotGuard<'_> {
        self.lock_slot(self.slot_of(aor)).await
    }

    /// Lock the slot selected by an AOR hash
    pub async fn lock_hash(&self, hash: u32) -> SlotGuard<'_> {
        self.lock_slot(slot_index(hash, self.size)).await
    }

    /// Lock slot `index`. Indexes past the table wrap around, as in
    /// `index & (size - 1)`, the same way hashes are reduced.
    pub async fn lock_slot(&self, index: usize) -> SlotGuard<'_> {
        let index = index & (self.size - 1);
        let guard = self.stripes[index % self.lock_count].lock().await;
        SlotGuard {
            domain: self,
            guard,
            pos: index / self.lock_count,
        }
    }

    /// Copy of the record of `aor`
    pub async fn snapshot(&self, aor: &str) -> Result<Option<Record>> {
        let mut guard = self.lock(aor).await;
        let record = guard.get_record(aor).await?;
        Ok(record.map(|r| (*r).clone()))
    }

    /// Copy of the contact carrying `ruid` in the slot of `hash`
    pub async fn get_by_ruid(&self, hash: u32, ruid: &str) -> Result<Option<Contact>> {
        let mut guard = self.lock_hash(hash).await;
        let record = guard.get_by_ruid(hash, ruid).await?;
        Ok(record.and_then(|r| r.contact(ruid).cloned()))
    }

    /// Number of records cached
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Relaxed)
    }

    /// Number of contacts cached
    pub fn contacts(&self) -> usize {
        self.contacts.load(Ordering::Relaxed)
    }

    /// Contacts removed by the sweep since start
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub(crate) fn record_added(&self) {
        self.users.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removed(&self) {
        let _ = self
            .users
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn contact_added(&self) {
        self.contacts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn contact_removed(&self) {
        let _ = self
            .contacts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn contact_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("lock_count", &self.lock_count)
            .field("users", &self.users())
            .field("contacts", &self.contacts())
            .finish()
    }
}

/// Exclusive access to one slot; the lock is released on drop
pub struct SlotGuard<'a> {
    domain: &'a Domain,
    guard: MutexGuard<'a, Stripe>,
    pos: usize,
}

impl<'a> SlotGuard<'a> {
    pub fn domain(&self) -> &'a Domain {
        self.domain
    }

    pub fn slot(&self) -> &Slot {
        &self.guard.slots[self.pos]
    }

    pub(crate) fn slot_mut(&mut self) -> &mut Slot {
        &mut self.guard.slots[self.pos]
    }

    pub fn index(&self) -> usize {
        self.slot().index
    }

    /// Records cached in this slot
    pub fn records(&self) -> &[Record] {
        &self.slot().records
    }

    fn check_owner(&self, aor: &str) -> Result<()> {
        let wanted = self.domain.slot_of(aor);
        if wanted != self.index() {
            return Err(RegistrarError::Internal(format!(
                "aor {} belongs to slot {}, not {}",
                aor,
                wanted,
                self.index()
            )));
        }
        Ok(())
    }

    /// Look up `aor`. Under store-only the record is read from the store
    /// and handed out as a transient copy.
    pub async fn get_record(&mut self, aor: &str) -> Result<Option<RecordHandle<'_>>> {
        self.check_owner(aor)?;
        let domain = self.domain;
        if !domain.caches() {
            let record = load_transient(domain, aor).await?;
            return Ok(record
                .filter(|r| !r.is_empty())
                .map(|r| RecordHandle::transient(domain, r)));
        }
        let hash = aor_hash(aor);
        let slot = self.slot_mut();
        let pos = slot.position(hash, aor);
        Ok(pos.map(move |pos| RecordHandle::cached(domain, slot, pos)))
    }

    /// Record of `aor`, created empty when absent
    pub async fn insert_record(&mut self, aor: &str) -> Result<RecordHandle<'_>> {
        self.check_owner(aor)?;
        let domain = self.domain;
        if !domain.caches() {
            let record = load_transient(domain, aor)
                .await?
                .unwrap_or_else(|| Record::new(domain.name(), aor, domain.size()));
            return Ok(RecordHandle::transient(domain, record));
        }
        let hash = aor_hash(aor);
        let slot = self.slot_mut();
        let pos = match slot.position(hash, aor) {
            Some(pos) => pos,
            None => {
                slot.records.push(Record::new(domain.name(), aor, domain.size()));
                domain.record_added();
                debug!(domain = %domain.name(), aor, "record created");
                slot.records.len() - 1
            }
        };
        Ok(RecordHandle::cached(domain, slot, pos))
    }

    /// Delete every contact of `aor`; the record goes once it is empty
    pub async fn delete_record(&mut self, aor: &str) -> Result<()> {
        match self.get_record(aor).await? {
            Some(mut record) => record.delete_all().await,
            None => Ok(()),
        }
    }

    /// Record in this slot holding the contact `ruid`
    pub async fn get_by_ruid(&mut self, hash: u32, ruid: &str) -> Result<Option<RecordHandle<'_>>> {
        let domain = self.domain;
        let wanted = slot_index(hash, domain.size());
        if wanted != self.index() {
            return Err(RegistrarError::Internal(format!(
                "hash {:#x} belongs to slot {}, not {}",
                hash,
                wanted,
                self.index()
            )));
        }
        if !domain.caches() {
            let Some(table) = domain.table() else {
                return Ok(None);
            };
            let Some(loaded) = table.load_by_ruid(ruid).await? else {
                return Ok(None);
            };
            if aor_hash(&loaded.aor) != hash {
                return Ok(None);
            }
            return self.get_record(&loaded.aor).await;
        }
        let slot = self.slot_mut();
        let pos = slot
            .records
            .iter()
            .position(|r| r.aor_hash() == hash && r.contact(ruid).is_some());
        Ok(pos.map(move |pos| RecordHandle::cached(domain, slot, pos)))
    }
}

/// Build a record from the store rows of `aor`
async fn load_transient(domain: &Domain, aor: &str) -> Result<Option<Record>> {
    let Some(table) = domain.table() else {
        return Err(RegistrarError::InvalidState(format!(
            "domain {} has no backing store",
            domain.name()
        )));
    };
    let rows = table.load_aor(aor).await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut record = Record::new(domain.name(), aor, domain.size());
    let order = domain.config().contact_order;
    for (uri, info) in rows {
        match new_contact(domain.name(), aor, &uri, &info) {
            Ok(mut contact) => {
                contact.state = ContactState::Sync;
                insert_sorted(&mut record.contacts, contact, order);
            }
            Err(e) => warn!(domain = %domain.name(), aor, "skipping stored contact: {}", e),
        }
    }
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncPolicy;
    use crate::types::{ContactInfo, ManualClock};

    fn context(policy: SyncPolicy, store: Option<Arc<dyn LocationStore>>) -> Arc<DomainContext> {
        Arc::new(DomainContext {
            config: LocationConfig {
                sync_policy: policy,
                hash_size: 16,
                lock_count: 4,
                ..Default::default()
            },
            store,
            clock: Arc::new(ManualClock::new(1_000)),
            resolver: None,
            callbacks: Arc::new(ContactCallbacks::new()),
        })
    }

    #[test]
    fn test_stripe_layout() {
        let domain = Domain::new("location", context(SyncPolicy::None, None)).unwrap();
        assert_eq!(domain.stripes.len(), 4);
        for stripe in &domain.stripes {
            let stripe = stripe.try_lock().unwrap();
            assert_eq!(stripe.slots.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_guard_reaches_the_right_slot() {
        let domain = Domain::new("location", context(SyncPolicy::None, None)).unwrap();
        for i in 0..16 {
            let guard = domain.lock_slot(i).await;
            assert_eq!(guard.index(), i);
        }
        let aor = "alice@example.com";
        let guard = domain.lock(aor).await;
        assert_eq!(guard.index(), slot_index(aor_hash(aor), 16));
    }

    #[tokio::test]
    async fn test_insert_get_and_release() {
        let domain = Domain::new("location", context(SyncPolicy::None, None)).unwrap();
        let aor = "alice@example.com";
        let mut guard = domain.lock(aor).await;
        {
            let mut record = guard.insert_record(aor).await.unwrap();
            record
                .insert_contact("sip:alice@10.0.0.1", &ContactInfo::new(2_000, "cid", 1))
                .await
                .unwrap();
        }
        {
            let record = guard.get_record(aor).await.unwrap().unwrap();
            assert_eq!(record.aor(), aor);
            assert_eq!(record.aor_hash(), aor_hash(aor));
            assert_eq!(record.slot_index(), domain.slot_of(aor));
        }
        let stranger = (0..64)
            .map(|i| format!("user{}@example.com", i))
            .find(|a| domain.slot_of(a) != guard.index())
            .unwrap();
        assert!(matches!(
            guard.insert_record(&stranger).await,
            Err(RegistrarError::Internal(_))
        ));
        drop(guard);

        // an empty record vanishes once its handle is released
        let bob = "bob@example.com";
        let mut guard = domain.lock(bob).await;
        guard.insert_record(bob).await.unwrap().release();
        assert!(guard.get_record(bob).await.unwrap().is_none());
        assert_eq!(domain.users(), 1);
        assert_eq!(domain.contacts(), 1);
    }

    #[tokio::test]
    async fn test_lock_slot_wraps_past_the_table() {
        let domain = Domain::new("location", context(SyncPolicy::None, None)).unwrap();
        assert_eq!(domain.lock_slot(16 + 3).await.index(), 3);
        assert_eq!(domain.lock_slot(usize::MAX).await.index(), 15);
    }

    #[tokio::test]
    async fn test_get_by_ruid_checks_slot() {
        let domain = Domain::new("location", context(SyncPolicy::None, None)).unwrap();
        let aor = "alice@example.com";
        let hash = aor_hash(aor);
        let mut guard = domain.lock(aor).await;
        guard
            .insert_record(aor)
            .await
            .unwrap()
            .insert_contact("sip:alice@10.0.0.1", &ContactInfo::new(0, "cid", 1).with_ruid("r-1"))
            .await
            .unwrap();

        {
            let record = guard.get_by_ruid(hash, "r-1").await.unwrap().unwrap();
            assert_eq!(record.aor(), aor);
        }
        assert!(guard.get_by_ruid(hash, "r-2").await.unwrap().is_none());

        let stranger = (0..64)
            .map(|i| format!("user{}@example.com", i))
            .find(|a| domain.slot_of(a) != guard.index())
            .unwrap();
        assert!(matches!(
            guard.get_by_ruid(aor_hash(&stranger), "r-1").await,
            Err(RegistrarError::Internal(_))
        ));
        drop(guard);

        let contact = domain.get_by_ruid(hash, "r-1").await.unwrap().unwrap();
        assert_eq!(contact.uri, "sip:alice@10.0.0.1");
    }

    #[test]
    fn test_rejects_bad_size() {
        let ctx = Arc::new(DomainContext {
            config: LocationConfig {
                hash_size: 100,
                ..Default::default()
            },
            store: None,
            clock: Arc::new(ManualClock::new(0)),
            resolver: None,
            callbacks: Arc::new(ContactCallbacks::new()),
        });
        assert!(matches!(
            Domain::new("location", ctx),
            Err(RegistrarError::Config(_))
        ));
    }
}

//! Address-of-record entries and their handles

use std::ops::Deref;
use tracing::debug;

use crate::error::{RegistrarError, Result};
use crate::events::ContactEventKind;
use crate::registrar::contact::{insert_sorted, merge_info, new_contact, reposition};
use crate::registrar::domain::{Domain, Slot};
use crate::registrar::hash::{aor_hash, slot_index};
use crate::registrar::matching::{self, CseqWindow, MatchRequest};
use crate::registrar::policy::DeleteAction;
use crate::types::{Contact, ContactInfo, ContactState, MatchOutcome};

/// One AOR's ordered contact list
#[derive(Debug, Clone)]
pub struct Record {
    domain: String,
    aor: String,
    aor_hash: u32,
    slot: usize,
    pub(crate) contacts: Vec<Contact>,
}

impl Record {
    pub(crate) fn new(domain: &str, aor: &str, size: usize) -> Self {
        let hash = aor_hash(aor);
        Self {
            domain: domain.to_string(),
            aor: aor.to_string(),
            aor_hash: hash,
            slot: slot_index(hash, size),
            contacts: Vec::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn aor(&self) -> &str {
        &self.aor
    }

    pub fn aor_hash(&self) -> u32 {
        self.aor_hash
    }

    /// Index of the slot owning this record
    pub fn slot_index(&self) -> usize {
        self.slot
    }

    /// Contacts in configured order
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn contact(&self, ruid: &str) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.ruid == ruid)
    }

    /// Contacts usable for routing at `now`
    pub fn valid_contacts(&self, now: i64) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(move |c| c.is_valid(now))
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    fn index_of(&self, ruid: &str) -> Result<usize> {
        self.contacts
            .iter()
            .position(|c| c.ruid == ruid)
            .ok_or_else(|| RegistrarError::ContactNotFound {
                aor: self.aor.clone(),
                contact: ruid.to_string(),
            })
    }
}

enum Held<'g> {
    /// Lives in a locked slot
    Cached { slot: &'g mut Slot, pos: usize },
    /// Built from the store for this lookup only
    Transient(Record),
}

/// Access to a record while its slot lock is held.
///
/// Dropping the handle releases the record: a cached record left without
/// contacts is unlinked from its slot, a transient one is freed.
pub struct RecordHandle<'g> {
    domain: &'g Domain,
    held: Held<'g>,
}

impl<'g> RecordHandle<'g> {
    pub(crate) fn cached(domain: &'g Domain, slot: &'g mut Slot, pos: usize) -> Self {
        Self {
            domain,
            held: Held::Cached { slot, pos },
        }
    }

    pub(crate) fn transient(domain: &'g Domain, record: Record) -> Self {
        Self {
            domain,
            held: Held::Transient(record),
        }
    }

    /// Whether the record lives in the domain cache
    pub fn is_cached(&self) -> bool {
        matches!(self.held, Held::Cached { .. })
    }

    fn record_mut(&mut self) -> &mut Record {
        match &mut self.held {
            Held::Cached { slot, pos } => &mut slot.records[*pos],
            Held::Transient(record) => record,
        }
    }

    /// Explicit release; same as dropping the handle
    pub fn release(self) {}

    fn window(&self) -> CseqWindow {
        CseqWindow {
            delay: self.domain.config().cseq_delay as i64,
            now: self.domain.now(),
        }
    }

    /// Match a request with the configured strategy
    pub fn match_request(&self, req: &MatchRequest<'_>) -> MatchOutcome {
        matching::match_contact(
            &self.contacts,
            self.domain.config().matching_mode,
            req,
            self.window(),
        )
    }

    /// Match `uri` and registration info; instance-aware when `info` has one
    pub fn match_contact(&self, uri: &str, info: &ContactInfo) -> MatchOutcome {
        let req = MatchRequest::from_info(uri, info);
        matching::match_by_instance(
            &self.contacts,
            self.domain.config().matching_mode,
            &req,
            info.instance.as_deref(),
            info.reg_id,
            self.window(),
        )
    }

    /// Link a new contact and apply the insert policy.
    ///
    /// Under write-through a failed write is returned while the contact stays
    /// cached as `New` for the sweep to retry.
    pub async fn insert_contact(&mut self, uri: &str, info: &ContactInfo) -> Result<&Contact> {
        let domain = self.domain;
        let cached = self.is_cached();
        let mut contact = new_contact(domain.name(), self.aor(), uri, info)?;
        if contact.last_modified == 0 {
            contact.last_modified = domain.now();
        }

        let record = self.record_mut();
        let idx = insert_sorted(&mut record.contacts, contact, domain.config().contact_order);
        if cached {
            domain.contact_added();
        }
        if let Err(e) = domain.sync().on_insert(domain.table(), &mut record.contacts[idx]).await {
            if !cached {
                record.contacts.remove(idx);
            }
            return Err(e);
        }

        let contact = &record.contacts[idx];
        debug!(domain = %domain.name(), aor = %contact.aor, ruid = %contact.ruid, "contact inserted");
        domain.callbacks().run(ContactEventKind::Insert, contact);
        Ok(contact)
    }

    /// Link a contact read from the store as `Sync`, bypassing policy and callbacks
    pub(crate) fn load_contact(&mut self, uri: &str, info: &ContactInfo) -> Result<()> {
        let domain = self.domain;
        let mut contact = new_contact(domain.name(), self.aor(), uri, info)?;
        contact.state = ContactState::Sync;
        let record = self.record_mut();
        insert_sorted(&mut record.contacts, contact, domain.config().contact_order);
        if self.is_cached() {
            domain.contact_added();
        }
        Ok(())
    }

    /// Merge `info` into contact `ruid`, reorder it and apply the update policy
    pub async fn update_contact(&mut self, ruid: &str, info: &ContactInfo) -> Result<&Contact> {
        let domain = self.domain;
        let order = domain.config().contact_order;
        let now = domain.now();
        let record = self.record_mut();
        let idx = record.index_of(ruid)?;

        merge_info(&mut record.contacts[idx], info);
        if record.contacts[idx].last_modified == 0 {
            record.contacts[idx].last_modified = now;
        }
        let idx = reposition(&mut record.contacts, idx, order);
        domain.sync().on_update(domain.table(), &mut record.contacts[idx]).await?;

        let contact = &record.contacts[idx];
        debug!(domain = %domain.name(), aor = %contact.aor, ruid, state = ?contact.state, "contact updated");
        domain.callbacks().run(ContactEventKind::Update, contact);
        Ok(contact)
    }

    /// Remove contact `ruid`. Persisted write-back contacts are only marked
    /// expired and leave with the next sweep.
    pub async fn delete_contact(&mut self, ruid: &str) -> Result<()> {
        let domain = self.domain;
        let cached = self.is_cached();
        let record = self.record_mut();
        let idx = record.index_of(ruid)?;

        let action = domain
            .sync()
            .on_delete(domain.table(), &mut record.contacts[idx])
            .await?;
        domain.callbacks().run(ContactEventKind::Delete, &record.contacts[idx]);
        if action == DeleteAction::RemoveNow {
            record.contacts.remove(idx);
            if cached {
                domain.contact_removed();
            }
        }
        debug!(domain = %domain.name(), aor = %record.aor, ruid, ?action, "contact deleted");
        Ok(())
    }

    /// Delete every contact; stops at the first failure
    pub async fn delete_all(&mut self) -> Result<()> {
        if !self.is_cached() {
            return self.delete_stored().await;
        }
        let ruids: Vec<String> = self.contacts.iter().map(|c| c.ruid.clone()).collect();
        for ruid in ruids {
            self.delete_contact(&ruid).await?;
        }
        Ok(())
    }

    /// Store-only removal: notify per contact, one store delete for the AOR
    async fn delete_stored(&mut self) -> Result<()> {
        let domain = self.domain;
        let table = domain.table().ok_or_else(|| {
            RegistrarError::InvalidState(format!("domain {} has no backing store", domain.name()))
        })?;
        let record = self.record_mut();
        for contact in &record.contacts {
            domain.callbacks().run(ContactEventKind::Delete, contact);
        }
        table.delete_aor(&record.aor).await?;
        record.contacts.clear();
        Ok(())
    }
}

impl Deref for RecordHandle<'_> {
    type Target = Record;

    fn deref(&self) -> &Record {
        match &self.held {
            Held::Cached { slot, pos } => &slot.records[*pos],
            Held::Transient(record) => record,
        }
    }
}

impl Drop for RecordHandle<'_> {
    fn drop(&mut self) {
        if let Held::Cached { slot, pos } = &mut self.held {
            if slot.records[*pos].is_empty() {
                let record = slot.records.swap_remove(*pos);
                self.domain.record_removed();
                debug!(domain = %self.domain.name(), aor = %record.aor, "empty record released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContactOrder, LocationConfig, SyncPolicy};
    use crate::events::ContactCallbacks;
    use crate::registrar::domain::DomainContext;
    use crate::storage::{LocationStore, MemoryStore};
    use crate::types::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn domain(policy: SyncPolicy, store: Option<Arc<MemoryStore>>) -> Domain {
        let ctx = DomainContext {
            config: LocationConfig {
                sync_policy: policy,
                hash_size: 64,
                lock_count: 8,
                ..Default::default()
            },
            store: store.map(|s| s as Arc<dyn LocationStore>),
            clock: Arc::new(ManualClock::new(1_000)),
            resolver: None,
            callbacks: Arc::new(ContactCallbacks::new()),
        };
        Domain::new("location", Arc::new(ctx)).unwrap()
    }

    #[tokio::test]
    async fn test_contact_lifecycle_in_memory() {
        let domain = domain(SyncPolicy::None, None);
        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        domain.callbacks().register(
            &[
                ContactEventKind::Insert,
                ContactEventKind::Update,
                ContactEventKind::Delete,
            ],
            move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );

        let aor = "alice@example.com";
        let mut guard = domain.lock(aor).await;
        let mut record = guard.insert_record(aor).await.unwrap();
        let ruid = record
            .insert_contact("sip:alice@10.0.0.1", &ContactInfo::new(2_000, "cid", 1))
            .await
            .unwrap()
            .ruid
            .clone();
        assert_eq!(record.len(), 1);
        assert_eq!(record.contacts()[0].last_modified, 1_000);

        let updated = record
            .update_contact(&ruid, &ContactInfo::new(3_000, "cid", 2).with_q(0.3))
            .await
            .unwrap();
        assert_eq!(updated.expires, 3_000);
        assert_eq!(updated.state(), ContactState::New);

        record.delete_contact(&ruid).await.unwrap();
        assert!(record.is_empty());
        assert_eq!(events.load(Ordering::SeqCst), 3);

        assert!(matches!(
            record.delete_contact(&ruid).await,
            Err(RegistrarError::ContactNotFound { .. })
        ));
        drop(record);
        assert!(guard.get_record(aor).await.unwrap().is_none());
        assert_eq!(domain.users(), 0);
    }

    #[tokio::test]
    async fn test_update_reorders_by_q() {
        let domain = domain(SyncPolicy::None, None);
        assert_eq!(domain.config().contact_order, ContactOrder::QValue);
        let aor = "carol@example.com";
        let mut guard = domain.lock(aor).await;
        let mut record = guard.insert_record(aor).await.unwrap();
        let first = record
            .insert_contact("sip:c@1", &ContactInfo::new(0, "a", 1).with_q(0.5))
            .await
            .unwrap()
            .ruid
            .clone();
        record
            .insert_contact("sip:c@2", &ContactInfo::new(0, "b", 1).with_q(0.7))
            .await
            .unwrap();

        record
            .update_contact(&first, &ContactInfo::new(0, "a", 2).with_q(0.8))
            .await
            .unwrap();
        let order: Vec<_> = record.contacts().iter().map(|c| c.uri.as_str()).collect();
        assert_eq!(order, ["sip:c@2", "sip:c@1"]);
    }

    #[tokio::test]
    async fn test_write_back_delete_is_deferred() {
        let store = Arc::new(MemoryStore::new());
        let domain = domain(SyncPolicy::WriteBack, Some(store));
        let aor = "dave@example.com";
        let mut guard = domain.lock(aor).await;
        let mut record = guard.insert_record(aor).await.unwrap();
        let ruid = record
            .insert_contact("sip:d@1", &ContactInfo::new(5_000, "cid", 1))
            .await
            .unwrap()
            .ruid
            .clone();
        record.record_mut().contacts[0].state = ContactState::Sync;

        record.delete_contact(&ruid).await.unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record.contacts()[0].expires, crate::types::EXPIRED_TIME);
    }

    #[tokio::test]
    async fn test_valid_contacts_view() {
        let domain = domain(SyncPolicy::None, None);
        let aor = "erin@example.com";
        let mut guard = domain.lock(aor).await;
        let mut record = guard.insert_record(aor).await.unwrap();
        record
            .insert_contact("sip:e@1", &ContactInfo::new(900, "a", 1))
            .await
            .unwrap();
        record
            .insert_contact("sip:e@2", &ContactInfo::new(0, "b", 1))
            .await
            .unwrap();
        let valid: Vec<_> = record.valid_contacts(1_000).map(|c| c.uri.clone()).collect();
        assert_eq!(valid, ["sip:e@2"]);
    }
}

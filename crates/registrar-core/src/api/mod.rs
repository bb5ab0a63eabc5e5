//! High-level location service
//!
//! Wraps the lock/record/contact primitives into the operations a registrar
//! and an operator need: saving a REGISTER binding, routing lookups and
//! administrative maintenance.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{RegistrarError, Result};
use crate::registrar::matching::MatchRequest;
use crate::registrar::{Domain, LocationRegistry, Record, SweepStats};
use crate::types::{Contact, ContactInfo, MatchOutcome};

/// Call-ID of contacts added through the admin surface
pub const ADMIN_CALLID: &str = "dfjrewr12386fd6-343@rvoip.admin";
/// Path used when matching admin-managed contacts
pub const ADMIN_PATH: &str = "dummypath";
/// CSeq of contacts added through the admin surface
pub const ADMIN_CSEQ: u32 = 1;
const ADMIN_USER_AGENT: &str = "rvoip registrar - admin";

/// Result of saving a binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// New contact, by ruid
    Inserted(String),
    /// Existing contact refreshed, by ruid
    Updated(String),
    /// Retransmission of the last accepted request
    Retransmission,
    /// Out-of-order CSeq, reject the request
    OutOfOrder,
}

/// Registrar-facing API over a [`LocationRegistry`]
#[derive(Debug, Clone)]
pub struct LocationService {
    registry: Arc<LocationRegistry>,
}

impl LocationService {
    pub fn new(registry: Arc<LocationRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<LocationRegistry> {
        &self.registry
    }

    fn domain(&self, table: &str) -> Result<Arc<Domain>> {
        self.registry.get_domain(table)
    }

    /// Key under which `aor` is stored: lowercased, and reduced to its user
    /// part unless domains are kept. Every entry point applies it.
    pub fn fix_aor(&self, aor: &str) -> Result<String> {
        let aor = if self.registry.config().use_domain {
            if !aor.contains('@') {
                return Err(RegistrarError::InvalidContact(format!(
                    "domain missing in aor {}",
                    aor
                )));
            }
            aor
        } else {
            aor.split('@').next().unwrap_or(aor)
        };
        Ok(aor.to_lowercase())
    }

    /// Match-or-insert for one REGISTER contact
    pub async fn save(
        &self,
        table: &str,
        aor: &str,
        uri: &str,
        info: &ContactInfo,
    ) -> Result<SaveOutcome> {
        let aor = self.fix_aor(aor)?;
        let domain = self.domain(table)?;
        let mut guard = domain.lock(&aor).await;
        let mut record = guard.insert_record(&aor).await?;

        match record.match_contact(uri, info) {
            MatchOutcome::Found(ruid) => {
                let contact = record.update_contact(&ruid, info).await?;
                Ok(SaveOutcome::Updated(contact.ruid.clone()))
            }
            MatchOutcome::NotFound => {
                let contact = record.insert_contact(uri, info).await?;
                Ok(SaveOutcome::Inserted(contact.ruid.clone()))
            }
            MatchOutcome::Skip => {
                debug!(aor = %aor, uri, "retransmitted registration");
                Ok(SaveOutcome::Retransmission)
            }
            MatchOutcome::Invalid => {
                debug!(aor = %aor, uri, cseq = info.cseq, "out of order registration");
                Ok(SaveOutcome::OutOfOrder)
            }
        }
    }

    /// Remove the binding a de-registration refers to; false when none matched
    pub async fn unregister(
        &self,
        table: &str,
        aor: &str,
        uri: &str,
        info: &ContactInfo,
    ) -> Result<bool> {
        let aor = self.fix_aor(aor)?;
        let domain = self.domain(table)?;
        let mut guard = domain.lock(&aor).await;
        let Some(mut record) = guard.get_record(&aor).await? else {
            return Ok(false);
        };
        match record.match_contact(uri, info) {
            MatchOutcome::Found(ruid) => {
                record.delete_contact(&ruid).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Contacts usable for routing `aor` now
    pub async fn lookup(&self, table: &str, aor: &str) -> Result<Vec<Contact>> {
        let aor = self.fix_aor(aor)?;
        let domain = self.domain(table)?;
        let now = domain.now();
        let mut guard = domain.lock(&aor).await;
        let contacts = match guard.get_record(&aor).await? {
            Some(record) => record.valid_contacts(now).cloned().collect(),
            None => Vec::new(),
        };
        Ok(contacts)
    }

    /// Full record of `aor`, expired contacts included
    pub async fn show(&self, table: &str, aor: &str) -> Result<Record> {
        let aor = self.fix_aor(aor)?;
        let domain = self.domain(table)?;
        match domain.snapshot(&aor).await? {
            Some(record) => Ok(record),
            None => Err(RegistrarError::RecordNotFound(aor)),
        }
    }

    /// Copy of every cached record, slot by slot
    pub async fn dump(&self, table: &str) -> Result<Vec<Record>> {
        let domain = self.domain(table)?;
        if !domain.caches() {
            return Err(RegistrarError::InvalidState(
                "dump needs an in-memory cache".to_string(),
            ));
        }
        let mut records = Vec::with_capacity(domain.users());
        for index in 0..domain.size() {
            let guard = domain.lock_slot(index).await;
            records.extend(guard.records().iter().cloned());
        }
        Ok(records)
    }

    /// Add or refresh a contact by hand. `info.expires` is relative, 0 keeps
    /// the contact permanently.
    pub async fn add_contact(
        &self,
        table: &str,
        aor: &str,
        uri: &str,
        mut info: ContactInfo,
    ) -> Result<String> {
        let aor = self.fix_aor(aor)?;
        let domain = self.domain(table)?;
        let now = domain.now();
        info.callid = Some(ADMIN_CALLID.to_string());
        info.cseq = ADMIN_CSEQ;
        info.user_agent = ADMIN_USER_AGENT.to_string();
        info.ruid = None;
        if info.expires != 0 {
            info.expires += now;
        }

        let mut guard = domain.lock(&aor).await;
        let mut record = guard.insert_record(&aor).await?;
        let req = MatchRequest::new(uri, Some(ADMIN_CALLID), Some(ADMIN_PATH), ADMIN_CSEQ + 1);
        let ruid = match record.match_request(&req) {
            MatchOutcome::Found(ruid) => record.update_contact(&ruid, &info).await?.ruid.clone(),
            _ => record.insert_contact(uri, &info).await?.ruid.clone(),
        };
        info!(table, aor = %aor, uri, "contact added by admin");
        Ok(ruid)
    }

    /// Delete every contact of `aor`
    pub async fn remove_aor(&self, table: &str, aor: &str) -> Result<()> {
        let aor = self.fix_aor(aor)?;
        let domain = self.domain(table)?;
        let mut guard = domain.lock(&aor).await;
        if guard.get_record(&aor).await?.is_none() {
            return Err(RegistrarError::RecordNotFound(aor));
        }
        guard.delete_record(&aor).await?;
        info!(table, aor = %aor, "aor removed by admin");
        Ok(())
    }

    /// Delete one contact of `aor` by its URI
    pub async fn remove_contact(&self, table: &str, aor: &str, uri: &str) -> Result<()> {
        let aor = self.fix_aor(aor)?;
        let domain = self.domain(table)?;
        let mut guard = domain.lock(&aor).await;
        let Some(mut record) = guard.get_record(&aor).await? else {
            return Err(RegistrarError::RecordNotFound(aor));
        };
        let req = MatchRequest::new(uri, Some(ADMIN_CALLID), Some(ADMIN_PATH), ADMIN_CSEQ + 1);
        match record.match_request(&req) {
            MatchOutcome::Found(ruid) => record.delete_contact(&ruid).await,
            _ => Err(RegistrarError::ContactNotFound {
                aor: aor.clone(),
                contact: uri.to_string(),
            }),
        }
    }

    /// Write pending write-back state now
    pub async fn flush(&self) -> SweepStats {
        self.registry.flush().await
    }

    fn require_store(&self, table: &str) -> Result<Arc<Domain>> {
        let domain = self.domain(table)?;
        if !self.registry.config().sync_policy.uses_store() || domain.table().is_none() {
            return Err(RegistrarError::InvalidState(
                "command needs a backing store".to_string(),
            ));
        }
        Ok(domain)
    }

    /// Distinct AORs with unexpired rows in the store
    pub async fn db_users(&self, table: &str) -> Result<usize> {
        let domain = self.require_store(table)?;
        let now = domain.now();
        match domain.table() {
            Some(t) => t.count_active_users(now).await,
            None => Ok(0),
        }
    }

    /// Unexpired rows in the store
    pub async fn db_contacts(&self, table: &str) -> Result<usize> {
        let domain = self.require_store(table)?;
        let now = domain.now();
        match domain.table() {
            Some(t) => t.count_active_contacts(now).await,
            None => Ok(0),
        }
    }

    /// Expired rows still in the store
    pub async fn db_expired_contacts(&self, table: &str) -> Result<usize> {
        let domain = self.require_store(table)?;
        let now = domain.now();
        match domain.table() {
            Some(t) => t.count_expired(now).await,
            None => Ok(0),
        }
    }
}

//! Contact lifecycle notifications
//!
//! Collaborators subscribe at startup and are called synchronously, while the
//! slot lock of the affected record is held. Callbacks observe only; they
//! cannot veto or alter the operation that triggered them.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::trace;

use crate::types::Contact;

/// Kind of contact lifecycle event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContactEventKind {
    /// Contact created
    Insert,
    /// Contact refreshed or changed
    Update,
    /// Contact removed by the maintenance sweep
    Expire,
    /// Contact explicitly removed
    Delete,
}

impl ContactEventKind {
    fn bit(self) -> u8 {
        match self {
            ContactEventKind::Insert => 1,
            ContactEventKind::Update => 2,
            ContactEventKind::Expire => 4,
            ContactEventKind::Delete => 8,
        }
    }
}

type Callback = Box<dyn Fn(ContactEventKind, &Contact) + Send + Sync>;

/// Registry of contact event subscribers
#[derive(Default)]
pub struct ContactCallbacks {
    entries: RwLock<Vec<(u8, Callback)>>,
}

impl ContactCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `handler` to the listed event kinds
    pub fn register<F>(&self, kinds: &[ContactEventKind], handler: F)
    where
        F: Fn(ContactEventKind, &Contact) + Send + Sync + 'static,
    {
        let mask = kinds.iter().fold(0u8, |m, k| m | k.bit());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push((mask, Box::new(handler)));
    }

    /// Whether anyone listens for `kind`
    pub fn has(&self, kind: ContactEventKind) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().any(|(mask, _)| mask & kind.bit() != 0)
    }

    pub fn run(&self, kind: ContactEventKind, contact: &Contact) {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        for (mask, handler) in entries.iter() {
            if mask & kind.bit() != 0 {
                trace!(aor = %contact.aor, ruid = %contact.ruid, ?kind, "running contact callback");
                handler(kind, contact);
            }
        }
    }
}

impl std::fmt::Debug for ContactCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.entries.read().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("ContactCallbacks")
            .field("subscribers", &count)
            .finish()
    }
}

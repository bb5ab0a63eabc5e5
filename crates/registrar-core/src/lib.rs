//! # Registrar Core
//!
//! The user-location registry of the rvoip SIP registrar.
//!
//! This crate provides:
//! - Hash-partitioned domain tables of address-of-record bindings
//! - Per-slot locking through scoped guards
//! - Contact matching with CSeq retransmission and ordering checks
//! - Four synchronization policies toward a backing store
//!   (none, write-through, write-back, store-only)
//! - A periodic sweep that expires and flushes contacts
//! - Startup preload and an administrative service API

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod registrar;
pub mod storage;
pub mod types;

pub use storage::LocationStore;

// Re-exports for convenience
pub use api::{LocationService, SaveOutcome};
pub use config::{ColumnNames, ContactOrder, LocationConfig, MatchingMode, SyncPolicy};
pub use error::{RegistrarError, Result};
pub use events::{ContactCallbacks, ContactEventKind};
pub use registrar::{
    Domain, LocationRegistry, Record, RecordHandle, RegistryParts, SlotGuard, SweepStats,
};
pub use types::{
    Clock, Contact, ContactInfo, ContactState, ManualClock, MatchOutcome, SocketInfo,
    SocketRef, SocketResolver, StaticSocketResolver, SystemClock, Transport,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

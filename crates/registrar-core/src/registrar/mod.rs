//! User-location registry
//!
//! Domains are hash tables of records; records hold the contacts of one
//! address-of-record. Every access goes through a [`domain::SlotGuard`], and
//! the configured [`crate::config::SyncPolicy`] decides how mutations reach
//! the backing store.

pub mod contact;
pub mod domain;
pub mod hash;
pub mod matching;
pub mod persist;
pub mod policy;
pub mod preload;
pub mod record;
pub mod registry;
pub mod timer;

pub use domain::{Domain, DomainContext, Slot, SlotGuard};
pub use matching::MatchRequest;
pub use policy::{ContactSync, DeleteAction, SweepAction};
pub use preload::PreloadStats;
pub use record::{Record, RecordHandle};
pub use registry::{LocationRegistry, RegistryParts};
pub use timer::{ExpiryManager, SweepStats};

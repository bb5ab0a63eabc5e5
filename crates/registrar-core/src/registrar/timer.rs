//! Maintenance sweep
//!
//! Walks every slot of every domain, one slot lock at a time: expired
//! contacts are removed (with their store rows where the policy persisted
//! them), pending contacts are flushed and empty records unlinked. Several
//! workers may run side by side, worker `w` owning the slots with
//! `index % workers == w`.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::events::ContactEventKind;
use crate::registrar::domain::Domain;
use crate::registrar::policy::SweepAction;

/// Statistics from a sweep run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepStats {
    pub slots_visited: usize,
    pub contacts_checked: usize,
    pub expired: usize,
    pub inserted: usize,
    pub updated: usize,
    pub flush_failures: usize,
    pub records_removed: usize,
    /// Rows removed by store-side expiry (store-only)
    pub store_expired: u64,
    pub duration: Duration,
}

impl SweepStats {
    pub fn merge(&mut self, other: &SweepStats) {
        self.slots_visited += other.slots_visited;
        self.contacts_checked += other.contacts_checked;
        self.expired += other.expired;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.flush_failures += other.flush_failures;
        self.records_removed += other.records_removed;
        self.store_expired += other.store_expired;
        self.duration += other.duration;
    }
}

/// Sweep slot `index` of `domain` at logical time `now`
pub async fn sweep_slot(domain: &Domain, index: usize, now: i64, stats: &mut SweepStats) {
    let mut guard = domain.lock_slot(index).await;
    let sync = domain.sync();
    let table = domain.table();
    let slot = guard.slot_mut();
    stats.slots_visited += 1;

    let mut r = 0;
    while r < slot.records.len() {
        let record = &mut slot.records[r];
        let mut c = 0;
        while c < record.contacts.len() {
            stats.contacts_checked += 1;
            let contact = &mut record.contacts[c];
            if contact.is_expired(now) {
                domain.callbacks().run(ContactEventKind::Expire, contact);
            }
            match sync.on_sweep(table, contact, now).await {
                SweepAction::Expired => {
                    let gone = record.contacts.remove(c);
                    debug!(domain = %domain.name(), aor = %gone.aor, ruid = %gone.ruid, "contact expired");
                    domain.contact_removed();
                    domain.contact_expired();
                    stats.expired += 1;
                    continue;
                }
                SweepAction::Inserted => stats.inserted += 1,
                SweepAction::Updated => stats.updated += 1,
                SweepAction::FlushFailed => stats.flush_failures += 1,
                SweepAction::Keep => {}
            }
            c += 1;
        }
        if record.contacts.is_empty() {
            slot.records.swap_remove(r);
            domain.record_removed();
            stats.records_removed += 1;
        } else {
            r += 1;
        }
    }
}

/// Sweep the stripe of `domain` owned by `worker`
pub async fn sweep_domain(domain: &Domain, worker: usize, workers: usize) -> SweepStats {
    let start = Instant::now();
    let mut stats = SweepStats::default();
    let now = domain.now();
    let workers = workers.max(1);

    if !domain.caches() {
        // store-only: a single store-side delete, issued by the first worker
        if worker == 0 {
            if let Some(table) = domain.table() {
                match table.delete_expired(now).await {
                    Ok(n) => stats.store_expired = n,
                    Err(e) => warn!(domain = %domain.name(), "store expiry failed: {}", e),
                }
            }
        }
        stats.duration = start.elapsed();
        return stats;
    }

    for index in (worker..domain.size()).step_by(workers) {
        sweep_slot(domain, index, now, &mut stats).await;
    }
    stats.duration = start.elapsed();
    stats
}

/// Snapshot of the registered domains; no map reference is held across awaits
fn domain_list(domains: &DashMap<String, Arc<Domain>>) -> Vec<Arc<Domain>> {
    domains.iter().map(|entry| entry.value().clone()).collect()
}

/// One full sweep of every domain by a single caller
pub async fn sweep_all(domains: &DashMap<String, Arc<Domain>>) -> SweepStats {
    let mut total = SweepStats::default();
    for domain in domain_list(domains) {
        let stats = sweep_domain(&domain, 0, 1).await;
        total.merge(&stats);
    }
    total
}

/// Periodic sweep workers
pub struct ExpiryManager {
    domains: Arc<DashMap<String, Arc<Domain>>>,
    period: Duration,
    workers: usize,
    is_running: Arc<RwLock<bool>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ExpiryManager {
    pub fn new(domains: Arc<DashMap<String, Arc<Domain>>>, period: Duration, workers: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            domains,
            period,
            workers: workers.max(1),
            is_running: Arc::new(RwLock::new(false)),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Spawn the sweep workers
    pub async fn start(&self) -> Result<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Ok(());
        }
        self.shutdown.send_replace(false);

        let mut handles = self.handles.lock().await;
        for worker in 0..self.workers {
            let domains = self.domains.clone();
            let period = self.period;
            let workers = self.workers;
            let mut stop = self.shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // the first tick completes immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let mut total = SweepStats::default();
                            for domain in domain_list(&domains) {
                                total.merge(&sweep_domain(&domain, worker, workers).await);
                            }
                            debug!(worker, ?total, "sweep finished");
                        }
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!(worker, "sweep worker exiting");
            }));
        }

        *is_running = true;
        info!(workers = self.workers, period = ?self.period, "expiry manager started");
        Ok(())
    }

    /// Stop the workers and wait for them to finish their current slot
    pub async fn stop(&self) -> Result<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }
        self.shutdown.send_replace(true);

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("sweep worker failed: {}", e);
            }
        }
        *is_running = false;
        info!("expiry manager stopped");
        Ok(())
    }

    /// Run one sweep over all domains now
    pub async fn run_once(&self) -> SweepStats {
        sweep_all(&self.domains).await
    }
}

impl std::fmt::Debug for ExpiryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryManager")
            .field("period", &self.period)
            .field("workers", &self.workers)
            .finish()
    }
}

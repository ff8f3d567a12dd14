use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::{Claim, ClaimOutcome, SlotStore, StoreError};

pub type SharedSlot = Arc<RwLock<Slot>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL and batches appends: block for one append, drain whatever else is
/// queued, then fsync once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so half-buffered bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Apply a slot-level event to one slot. Index maintenance is the caller's job.
fn apply_to_slot(slot: &mut Slot, event: &Event) {
    match event {
        Event::SlotClaimed { patient_id, .. } => slot.patient_id = Some(*patient_id),
        Event::SlotReleased { .. } => slot.patient_id = None,
        Event::SlotReassigned {
            from,
            to,
            patient_id,
        } => {
            if slot.id == *to {
                slot.patient_id = Some(*patient_id);
            } else if slot.id == *from {
                slot.patient_id = None;
            }
        }
        Event::SlotCheckedOut { at, .. } => slot.checked_out_at = Some(*at),
        Event::SiteCreated { .. } | Event::SiteUpdated { .. } | Event::SlotCreated { .. } => {}
    }
}

fn validate_span(span: &Span) -> Result<(), StoreError> {
    if span.start >= span.end {
        return Err(StoreError::LimitExceeded("slot must end after it starts"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(StoreError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(StoreError::LimitExceeded("slot too long"));
    }
    Ok(())
}

/// Holds a patient's write lock. The map entry goes away once no one else holds it.
struct PatientGuard<'a> {
    locks: &'a DashMap<Ulid, Arc<Mutex<()>>>,
    patient_id: Ulid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PatientGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.patient_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// In-memory slot store backed by a write-ahead log.
///
/// Each slot sits behind its own `RwLock`; a patient's writes are serialised by a
/// per-patient mutex and provisioning by a store-wide one. Lock order is write gate,
/// provisioning or patient, then slots by ascending id.
pub struct MemoryStore {
    sites: DashMap<Ulid, Site>,
    slots: DashMap<Ulid, SharedSlot>,
    /// Site → `(start, slot id)` sorted by start.
    site_slots: DashMap<Ulid, Vec<(Ms, Ulid)>>,
    /// Patient → ids of slots assigned to them.
    patient_slots: DashMap<Ulid, Vec<Ulid>>,
    patient_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    provision: Mutex<()>,
    /// Mutations share it; compaction takes it exclusively so its snapshot matches the log.
    write_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl MemoryStore {
    /// Replay the WAL at `path` and start its writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut sites: HashMap<Ulid, Site> = HashMap::new();
        let mut slots: HashMap<Ulid, Slot> = HashMap::new();
        for event in &events {
            match event {
                Event::SiteCreated {
                    id,
                    name,
                    active,
                    enabled_for_reschedule,
                }
                | Event::SiteUpdated {
                    id,
                    name,
                    active,
                    enabled_for_reschedule,
                } => {
                    sites.insert(
                        *id,
                        Site {
                            id: *id,
                            name: name.clone(),
                            active: *active,
                            enabled_for_reschedule: *enabled_for_reschedule,
                        },
                    );
                }
                Event::SlotCreated {
                    id,
                    site_id,
                    span,
                    active,
                    follow_up_for_dose,
                } => {
                    let mut slot = Slot::new(*id, *site_id, *span, *follow_up_for_dose);
                    slot.active = *active;
                    slots.insert(*id, slot);
                }
                Event::SlotReassigned { from, to, .. } => {
                    for id in [from, to] {
                        if let Some(slot) = slots.get_mut(id) {
                            apply_to_slot(slot, event);
                        }
                    }
                }
                Event::SlotClaimed { id, .. }
                | Event::SlotReleased { id, .. }
                | Event::SlotCheckedOut { id, .. } => {
                    if let Some(slot) = slots.get_mut(id) {
                        apply_to_slot(slot, event);
                    }
                }
            }
        }

        let store = Self {
            sites: DashMap::new(),
            slots: DashMap::new(),
            site_slots: DashMap::new(),
            patient_slots: DashMap::new(),
            patient_locks: DashMap::new(),
            provision: Mutex::new(()),
            write_gate: RwLock::new(()),
            wal_tx,
        };
        for (id, site) in sites {
            store.sites.insert(id, site);
        }
        for (id, slot) in slots {
            store.index_slot(slot.site_id, slot.span.start, id);
            if let Some(pid) = slot.patient_id {
                store.patient_slots.entry(pid).or_default().push(id);
            }
            store.slots.insert(id, Arc::new(RwLock::new(slot)));
        }
        if !events.is_empty() {
            info!(
                "replayed {} events: {} sites, {} slots",
                events.len(),
                store.sites.len(),
                store.slots.len()
            );
        }
        Ok(store)
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    fn slot_handle(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    async fn lock_patient(&self, patient_id: Ulid) -> PatientGuard<'_> {
        let lock = self.patient_locks.entry(patient_id).or_default().value().clone();
        PatientGuard {
            locks: &self.patient_locks,
            patient_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn site_is_active(&self, site_id: &Ulid) -> bool {
        self.sites.get(site_id).is_some_and(|s| s.active)
    }

    fn index_slot(&self, site_id: Ulid, start: Ms, slot_id: Ulid) {
        let mut index = self.site_slots.entry(site_id).or_default();
        let pos = index.partition_point(|(s, _)| *s <= start);
        index.insert(pos, (start, slot_id));
    }

    fn index_assign(&self, patient_id: Ulid, slot_id: Ulid) {
        self.patient_slots.entry(patient_id).or_default().push(slot_id);
    }

    fn index_unassign(&self, patient_id: Ulid, slot_id: Ulid) {
        self.patient_slots.remove_if_mut(&patient_id, |_, held| {
            held.retain(|id| *id != slot_id);
            held.is_empty()
        });
    }

    /// Slots held by the patient. Caller holds the patient lock.
    async fn held_locked(&self, patient_id: Ulid) -> Vec<Slot> {
        let ids = self
            .patient_slots
            .get(&patient_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut held = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = self.slot_handle(&id) {
                let slot = handle.read().await;
                if slot.patient_id == Some(patient_id) {
                    held.push(slot.clone());
                }
            }
        }
        held.sort_by_key(|s| s.span.start);
        held
    }

    // ── Provisioning ─────────────────────────────────────────

    pub async fn create_site(&self, site: Site) -> Result<(), StoreError> {
        if site.name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("site name too long"));
        }
        let _gate = self.write_gate.read().await;
        let _provision = self.provision.lock().await;
        if self.sites.len() >= MAX_SITES {
            return Err(StoreError::LimitExceeded("too many sites"));
        }
        if self.sites.contains_key(&site.id) {
            return Err(StoreError::AlreadyExists(site.id));
        }
        let event = Event::SiteCreated {
            id: site.id,
            name: site.name.clone(),
            active: site.active,
            enabled_for_reschedule: site.enabled_for_reschedule,
        };
        self.wal_append(&event).await?;
        self.sites.insert(site.id, site);
        Ok(())
    }

    /// Replace a site's metadata, e.g. to deactivate it.
    pub async fn update_site(&self, site: Site) -> Result<(), StoreError> {
        if site.name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("site name too long"));
        }
        let _gate = self.write_gate.read().await;
        let _provision = self.provision.lock().await;
        if !self.sites.contains_key(&site.id) {
            return Err(StoreError::NotFound(site.id));
        }
        let event = Event::SiteUpdated {
            id: site.id,
            name: site.name.clone(),
            active: site.active,
            enabled_for_reschedule: site.enabled_for_reschedule,
        };
        self.wal_append(&event).await?;
        self.sites.insert(site.id, site);
        Ok(())
    }

    /// Provision a free slot.
    pub async fn create_slot(
        &self,
        id: Ulid,
        site_id: Ulid,
        span: Span,
        follow_up_for_dose: bool,
    ) -> Result<Slot, StoreError> {
        validate_span(&span)?;
        let _gate = self.write_gate.read().await;
        let _provision = self.provision.lock().await;
        if !self.sites.contains_key(&site_id) {
            return Err(StoreError::NotFound(site_id));
        }
        if self
            .site_slots
            .get(&site_id)
            .is_some_and(|idx| idx.len() >= MAX_SLOTS_PER_SITE)
        {
            return Err(StoreError::LimitExceeded("too many slots at site"));
        }
        if self.slots.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }

        let slot = Slot::new(id, site_id, span, follow_up_for_dose);
        let event = Event::SlotCreated {
            id,
            site_id,
            span,
            active: slot.active,
            follow_up_for_dose,
        };
        self.wal_append(&event).await?;
        self.slots.insert(id, Arc::new(RwLock::new(slot.clone())));
        self.index_slot(site_id, span.start, id);
        Ok(slot)
    }

    /// Mark an assigned slot fulfilled. Terminal.
    pub async fn check_out(&self, slot_id: Ulid, at: Ms) -> Result<Slot, StoreError> {
        let handle = self
            .slot_handle(&slot_id)
            .ok_or(StoreError::NotFound(slot_id))?;
        let _gate = self.write_gate.read().await;
        let mut slot = handle.write().await;
        if slot.is_checked_out() {
            return Err(StoreError::CheckedOut(slot_id));
        }
        if slot.patient_id.is_none() {
            return Err(StoreError::Unassigned(slot_id));
        }
        let event = Event::SlotCheckedOut { id: slot_id, at };
        self.wal_append(&event).await?;
        apply_to_slot(&mut slot, &event);
        info!("checked out slot {slot_id}");
        Ok(slot.clone())
    }

    /// Every slot of a site in start order, whatever its state.
    pub async fn list_slots(&self, site_id: Ulid) -> Vec<Slot> {
        let ids: Vec<Ulid> = self
            .site_slots
            .get(&site_id)
            .map(|idx| idx.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = self.slot_handle(&id) {
                out.push(handle.read().await.clone());
            }
        }
        out
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate.write().await;

        let mut events = Vec::new();
        for entry in self.sites.iter() {
            let site = entry.value();
            events.push(Event::SiteCreated {
                id: site.id,
                name: site.name.clone(),
                active: site.active,
                enabled_for_reschedule: site.enabled_for_reschedule,
            });
        }

        let handles: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let slot = handle.read().await;
            events.push(Event::SlotCreated {
                id: slot.id,
                site_id: slot.site_id,
                span: slot.span,
                active: slot.active,
                follow_up_for_dose: slot.follow_up_for_dose,
            });
            if let Some(patient_id) = slot.patient_id {
                events.push(Event::SlotClaimed {
                    id: slot.id,
                    patient_id,
                });
            }
            if let Some(at) = slot.checked_out_at {
                events.push(Event::SlotCheckedOut { id: slot.id, at });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    /// Patients with an index entry and with a live write lock.
    #[cfg(test)]
    pub(crate) fn tracked_patients(&self) -> (usize, usize) {
        (self.patient_slots.len(), self.patient_locks.len())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Claim-new and release-old under both slot locks, taken in id order.
    async fn reassign(
        &self,
        claim: Claim,
        old_id: Ulid,
        new_handle: SharedSlot,
    ) -> Result<ClaimOutcome, StoreError> {
        let old_handle = self
            .slot_handle(&old_id)
            .ok_or(StoreError::NotFound(old_id))?;
        let (mut new_slot, mut old_slot): (OwnedRwLockWriteGuard<Slot>, OwnedRwLockWriteGuard<Slot>) =
            if claim.slot_id < old_id {
                let n = new_handle.write_owned().await;
                let o = old_handle.write_owned().await;
                (n, o)
            } else {
                let o = old_handle.write_owned().await;
                let n = new_handle.write_owned().await;
                (n, o)
            };

        if !new_slot.is_unassigned() || !self.site_is_active(&new_slot.site_id) {
            return Ok(ClaimOutcome::Taken);
        }
        if old_slot.patient_id != Some(claim.patient_id) || old_slot.is_checked_out() {
            return Ok(ClaimOutcome::HolderChanged);
        }

        let event = Event::SlotReassigned {
            from: old_id,
            to: claim.slot_id,
            patient_id: claim.patient_id,
        };
        self.wal_append(&event).await?;
        apply_to_slot(&mut old_slot, &event);
        apply_to_slot(&mut new_slot, &event);
        self.index_unassign(claim.patient_id, old_id);
        self.index_assign(claim.patient_id, claim.slot_id);
        info!(
            "patient {} moved from slot {old_id} to slot {}",
            claim.patient_id, claim.slot_id
        );
        Ok(ClaimOutcome::Claimed(new_slot.clone()))
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn site(&self, id: Ulid) -> Result<Option<Site>, StoreError> {
        Ok(self.sites.get(&id).map(|e| e.value().clone()))
    }

    async fn sites(&self) -> Result<Vec<Site>, StoreError> {
        Ok(self.sites.iter().map(|e| e.value().clone()).collect())
    }

    async fn slot(&self, id: Ulid) -> Result<Option<Slot>, StoreError> {
        match self.slot_handle(&id) {
            Some(handle) => Ok(Some(handle.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn free_slots_in_range(
        &self,
        site_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Slot>, StoreError> {
        if to < from {
            return Ok(Vec::new());
        }
        let ids: Vec<Ulid> = match self.site_slots.get(&site_id) {
            Some(index) => {
                let lo = index.partition_point(|(start, _)| *start < from);
                let hi = index.partition_point(|(start, _)| *start <= to);
                index[lo..hi].iter().map(|(_, id)| *id).collect()
            }
            None => return Ok(Vec::new()),
        };

        let mut free = Vec::new();
        for id in ids {
            if let Some(handle) = self.slot_handle(&id) {
                let slot = handle.read().await;
                if slot.is_unassigned() {
                    free.push(slot.clone());
                }
            }
        }
        Ok(free)
    }

    async fn held_slots(&self, patient_id: Ulid) -> Result<Vec<Slot>, StoreError> {
        if !self.patient_slots.contains_key(&patient_id) {
            return Ok(Vec::new());
        }
        let _patient = self.lock_patient(patient_id).await;
        Ok(self.held_locked(patient_id).await)
    }

    async fn try_claim(&self, claim: Claim) -> Result<ClaimOutcome, StoreError> {
        let new_handle = self
            .slot_handle(&claim.slot_id)
            .ok_or(StoreError::NotFound(claim.slot_id))?;

        let _gate = self.write_gate.read().await;
        let _patient = self.lock_patient(claim.patient_id).await;

        let current: Vec<Ulid> = self
            .held_locked(claim.patient_id)
            .await
            .into_iter()
            .filter(|s| s.is_current(claim.current_since))
            .map(|s| s.id)
            .collect();
        let expected: Vec<Ulid> = claim.replacing.into_iter().collect();
        if current != expected {
            debug!(
                "claim by patient {} rejected: holdings changed",
                claim.patient_id
            );
            return Ok(ClaimOutcome::HolderChanged);
        }

        match claim.replacing {
            Some(old_id) if old_id == claim.slot_id => Ok(ClaimOutcome::Taken),
            Some(old_id) => self.reassign(claim, old_id, new_handle).await,
            None => {
                let mut slot = new_handle.write().await;
                if !slot.is_unassigned() || !self.site_is_active(&slot.site_id) {
                    return Ok(ClaimOutcome::Taken);
                }
                let event = Event::SlotClaimed {
                    id: claim.slot_id,
                    patient_id: claim.patient_id,
                };
                self.wal_append(&event).await?;
                apply_to_slot(&mut slot, &event);
                self.index_assign(claim.patient_id, claim.slot_id);
                info!("slot {} claimed by patient {}", claim.slot_id, claim.patient_id);
                Ok(ClaimOutcome::Claimed(slot.clone()))
            }
        }
    }

    async fn release(&self, slot_id: Ulid, patient_id: Ulid) -> Result<Slot, StoreError> {
        let handle = self
            .slot_handle(&slot_id)
            .ok_or(StoreError::NotFound(slot_id))?;

        let _gate = self.write_gate.read().await;
        let _patient = self.lock_patient(patient_id).await;
        let mut slot = handle.write().await;

        if slot.patient_id != Some(patient_id) {
            return Err(StoreError::NotHolder {
                slot_id,
                patient_id,
            });
        }
        if slot.is_checked_out() {
            return Err(StoreError::CheckedOut(slot_id));
        }

        let event = Event::SlotReleased {
            id: slot_id,
            patient_id,
        };
        self.wal_append(&event).await?;
        apply_to_slot(&mut slot, &event);
        self.index_unassign(patient_id, slot_id);
        info!("slot {slot_id} released by patient {patient_id}");
        Ok(slot.clone())
    }
}

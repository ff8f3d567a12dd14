mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Ms, Site, Slot};

#[derive(Debug)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The slot was checked out and can no longer change.
    CheckedOut(Ulid),
    NotHolder { slot_id: Ulid, patient_id: Ulid },
    /// Checkout requires an assigned slot.
    Unassigned(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::CheckedOut(id) => write!(f, "slot {id} is checked out"),
            StoreError::NotHolder {
                slot_id,
                patient_id,
            } => write!(f, "slot {slot_id} is not held by patient {patient_id}"),
            StoreError::Unassigned(id) => write!(f, "slot {id} has no patient"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A request to assign `slot_id` to `patient_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub slot_id: Ulid,
    pub patient_id: Ulid,
    /// The patient's current slot as the caller last saw it; released in the same step.
    pub replacing: Option<Ulid>,
    /// Holdings ending at or before this instant are not current.
    pub current_since: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(Slot),
    /// Somebody else holds the slot, or it was checked out.
    Taken,
    /// The patient's current slot is no longer `Claim::replacing`.
    HolderChanged,
}

/// Data-access collaborator of the engine.
///
/// Reads return snapshots and may be stale by the time a claim runs; `try_claim`
/// and `release` are linearizable per slot.
#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn site(&self, id: Ulid) -> Result<Option<Site>, StoreError>;

    async fn sites(&self) -> Result<Vec<Site>, StoreError>;

    async fn slot(&self, id: Ulid) -> Result<Option<Slot>, StoreError>;

    /// Unassigned, non-checked-out slots of `site_id` starting in `[from, to]`, ascending by start.
    async fn free_slots_in_range(
        &self,
        site_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Slot>, StoreError>;

    /// Every slot currently assigned to the patient, checked out or not.
    async fn held_slots(&self, patient_id: Ulid) -> Result<Vec<Slot>, StoreError>;

    async fn try_claim(&self, claim: Claim) -> Result<ClaimOutcome, StoreError>;

    /// Clear the assignment. Only the holder may release, and never after checkout.
    async fn release(&self, slot_id: Ulid, patient_id: Ulid) -> Result<Slot, StoreError>;
}

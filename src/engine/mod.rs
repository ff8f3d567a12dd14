mod booking;
mod cancel;
mod catalog;
pub mod eligibility;
mod error;
mod horizon;

pub use booking::{Booking, ResultCode, ScheduleOutcome, ScheduleRequest};
pub use catalog::SiteSlots;
pub use eligibility::PatientStatus;
pub use error::EngineError;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::model::*;
use crate::store::SlotStore;

/// Source of "now" for every engine operation.
#[derive(Debug)]
pub enum Clock {
    System,
    /// Settable instant, for tests and replays.
    Fixed(AtomicI64),
}

impl Clock {
    pub fn fixed(at: Ms) -> Self {
        Clock::Fixed(AtomicI64::new(at))
    }

    pub fn now_ms(&self) -> Ms {
        match self {
            Clock::System => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as Ms)
                .unwrap_or(0),
            Clock::Fixed(at) => at.load(Ordering::SeqCst),
        }
    }

    /// No-op on the system clock.
    pub fn set(&self, to: Ms) {
        if let Clock::Fixed(at) = self {
            at.store(to, Ordering::SeqCst);
        }
    }

    pub fn advance(&self, by: Ms) {
        if let Clock::Fixed(at) = self {
            at.fetch_add(by, Ordering::SeqCst);
        }
    }
}

/// Start of the local day containing `t`.
pub fn day_start(t: Ms, utc_offset: Ms) -> Ms {
    (t + utc_offset).div_euclid(DAY) * DAY - utc_offset
}

/// Last millisecond of the local day containing `t`.
pub fn day_end(t: Ms, utc_offset: Ms) -> Ms {
    day_start(t, utc_offset) + DAY - 1
}

/// The slot-scheduling engine.
///
/// Holds no mutable state of its own: every assignment lives in the store, and
/// the only serialisation point is the store's per-slot claim.
pub struct Engine {
    store: Arc<dyn SlotStore>,
    config: SchedulerConfig,
    clock: Clock,
}

impl Engine {
    pub fn new(store: Arc<dyn SlotStore>, config: SchedulerConfig) -> Result<Self, EngineError> {
        Self::with_clock(store, config, Clock::System)
    }

    pub fn with_clock(
        store: Arc<dyn SlotStore>,
        config: SchedulerConfig,
        clock: Clock,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        Ok(Self {
            store,
            config,
            clock,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn SlotStore> {
        &self.store
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Inclusive `[earliest, latest]` range of starts a booking may target.
    pub fn booking_window(&self, now: Ms) -> (Ms, Ms) {
        let earliest = now + self.config.earliest_allowed_offset;
        let latest = day_end(now + self.config.latest_allowed_offset, self.config.utc_offset);
        (earliest, latest)
    }

    /// Inclusive bounds of the local day `days` after today.
    pub(crate) fn day_window(&self, now: Ms, days: u32) -> (Ms, Ms) {
        let t = now + days as Ms * DAY;
        (
            day_start(t, self.config.utc_offset),
            day_end(t, self.config.utc_offset),
        )
    }

    /// Holdings ending before today began are no longer current.
    pub(crate) fn current_since(&self, now: Ms) -> Ms {
        day_start(now, self.config.utc_offset)
    }

    /// The patient's current slot: assigned, not checked out, not over before today.
    pub async fn current_slot(&self, patient_id: Ulid) -> Result<Option<Slot>, EngineError> {
        let since = self.current_since(self.now());
        self.current_slot_since(patient_id, since).await
    }

    pub(crate) async fn current_slot_since(
        &self,
        patient_id: Ulid,
        since: Ms,
    ) -> Result<Option<Slot>, EngineError> {
        let mut current: Vec<Slot> = self
            .store
            .held_slots(patient_id)
            .await?
            .into_iter()
            .filter(|s| s.is_current(since))
            .collect();
        if current.len() > 1 {
            return Err(EngineError::InconsistentCurrentSlots {
                patient_id,
                count: current.len(),
            });
        }
        Ok(current.pop())
    }

    /// Sites the patient may book at: reschedule-eligible sites once dosed,
    /// otherwise the union of the patient's condition sites.
    pub async fn allowed_site_ids(&self, patient: &Patient) -> Result<Vec<Ulid>, EngineError> {
        if patient.has_doses() {
            let mut ids: Vec<Ulid> = self
                .store
                .sites()
                .await?
                .into_iter()
                .filter(|s| s.enabled_for_reschedule)
                .map(|s| s.id)
                .collect();
            ids.sort();
            return Ok(ids);
        }
        let mut ids: Vec<Ulid> = Vec::new();
        for id in patient.conditions.iter().flat_map(|c| c.site_ids.iter()) {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        Ok(ids)
    }
}

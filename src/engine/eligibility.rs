//! Who may book, cancel, or reschedule.
//!
//! The rules are pure functions over the patient and their current slot so the
//! booking and cancellation paths can re-run them right before they mutate.

use crate::model::*;

use super::{Engine, EngineError};

/// A new booking is possible: no profile update pending, not fully vaccinated,
/// and no current slot held.
pub fn can_schedule(patient: &Patient, current: Option<&Slot>) -> bool {
    !patient.force_user_update && !patient.vaccinated && current.is_none()
}

/// Whether the current slot may be given up.
///
/// A dosed patient depends solely on the upstream reschedule policy. An undosed
/// patient may always let go, except of a follow-up-for-dose slot whose start
/// is still ahead.
pub fn can_cancel_or_reschedule(patient: &Patient, current: Option<&Slot>, now: Ms) -> bool {
    if patient.has_doses() {
        return patient.reschedule_condition;
    }
    match current {
        Some(slot) => !(slot.follow_up_for_dose && now < slot.start()),
        None => true,
    }
}

/// Guard for `Engine::schedule`. Holding a current slot turns the booking into a
/// replacement, which needs the cancel/reschedule rule as well.
pub(crate) fn can_book(patient: &Patient, current: Option<&Slot>, reschedule: bool, now: Ms) -> bool {
    if patient.force_user_update || patient.vaccinated {
        return false;
    }
    if reschedule || current.is_some() {
        return can_cancel_or_reschedule(patient, current, now);
    }
    can_schedule(patient, current)
}

/// What the patient's landing view should offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientStatus {
    ProfileUpdateRequired,
    Vaccinated,
    Booked {
        slot: Slot,
        can_cancel_or_reschedule: bool,
        change_reschedule_after: Option<Ms>,
    },
    CanBook {
        open_slots: usize,
    },
}

impl Engine {
    pub async fn can_schedule(&self, patient: &Patient) -> Result<bool, EngineError> {
        let current = self.current_slot(patient.id).await?;
        Ok(can_schedule(patient, current.as_ref()))
    }

    pub async fn can_cancel_or_reschedule(&self, patient: &Patient) -> Result<bool, EngineError> {
        let now = self.now();
        let current = self
            .current_slot_since(patient.id, self.current_since(now))
            .await?;
        Ok(can_cancel_or_reschedule(patient, current.as_ref(), now))
    }

    pub async fn patient_status(&self, patient: &Patient) -> Result<PatientStatus, EngineError> {
        if patient.force_user_update {
            return Ok(PatientStatus::ProfileUpdateRequired);
        }
        if patient.vaccinated {
            return Ok(PatientStatus::Vaccinated);
        }

        let now = self.now();
        let current = self
            .current_slot_since(patient.id, self.current_since(now))
            .await?;
        if let Some(slot) = current {
            let can_change = can_cancel_or_reschedule(patient, Some(&slot), now);
            return Ok(PatientStatus::Booked {
                slot,
                can_cancel_or_reschedule: can_change,
                change_reschedule_after: patient.change_reschedule_after,
            });
        }

        let allowed = self.allowed_site_ids(patient).await?;
        let (from, to) = self.booking_window(now);
        let open_slots = self
            .count_open_slots(from, to, &allowed, patient.has_doses())
            .await?;
        Ok(PatientStatus::CanBook { open_slots })
    }
}

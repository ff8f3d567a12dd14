use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::store::StoreError;

use super::eligibility::can_cancel_or_reschedule;
use super::{Engine, EngineError};

impl Engine {
    /// Release the patient's current slot back to the free pool.
    pub async fn cancel(&self, patient: &Patient, slot_id: Ulid) -> Result<Slot, EngineError> {
        let result = self.cancel_inner(patient, slot_id).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(EngineError::NotCancelable(_)) => "not_cancelable",
            Err(_) => "error",
        };
        metrics::counter!(observability::CANCEL_TOTAL, "status" => status).increment(1);
        result
    }

    async fn cancel_inner(&self, patient: &Patient, slot_id: Ulid) -> Result<Slot, EngineError> {
        let now = self.now();
        let current = self
            .current_slot_since(patient.id, self.current_since(now))
            .await?;
        let Some(current) = current.filter(|s| s.id == slot_id) else {
            debug!("slot {slot_id} is not the current slot of patient {}", patient.id);
            return Err(EngineError::NotCancelable(slot_id));
        };
        if !can_cancel_or_reschedule(patient, Some(&current), now) {
            debug!("patient {} may not give up slot {slot_id}", patient.id);
            return Err(EngineError::NotCancelable(slot_id));
        }

        match self.store.release(slot_id, patient.id).await {
            Ok(slot) => {
                info!("patient {} canceled slot {slot_id}", patient.id);
                Ok(slot)
            }
            Err(StoreError::NotHolder { .. } | StoreError::CheckedOut(_)) => {
                Err(EngineError::NotCancelable(slot_id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

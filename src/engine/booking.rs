use std::collections::HashSet;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;
use crate::observability;
use crate::store::{Claim, ClaimOutcome};

use super::eligibility::can_book;
use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    NoSlots,
    ConditionsUnmet,
}

/// A committed assignment, with what the caller asked for alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub slot: Slot,
    pub desired_start: Option<Ms>,
    /// Booked start is further than the rounding tolerance from `desired_start`.
    pub time_changed: bool,
    /// The slot released in the same step, if this replaced a current one.
    pub replaced: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Success(Booking),
    NoSlots,
    ConditionsUnmet,
}

impl ScheduleOutcome {
    pub fn code(&self) -> ResultCode {
        match self {
            ScheduleOutcome::Success(_) => ResultCode::Success,
            ScheduleOutcome::NoSlots => ResultCode::NoSlots,
            ScheduleOutcome::ConditionsUnmet => ResultCode::ConditionsUnmet,
        }
    }

    pub fn booking(&self) -> Option<&Booking> {
        match self {
            ScheduleOutcome::Success(b) => Some(b),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<&Slot> {
        self.booking().map(|b| &b.slot)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleRequest {
    /// Requested site. With a dose-linked reschedule, anything but the last dose's site yields no slots.
    pub site_id: Option<Ulid>,
    /// Preferred start; `None` means the earliest free slot.
    pub desired_start: Option<Ms>,
    pub reschedule: bool,
    /// Sites the caller permits for this patient, usually `Engine::allowed_site_ids`.
    pub allowed_site_ids: Vec<Ulid>,
}

impl ScheduleRequest {
    pub fn new(allowed_site_ids: Vec<Ulid>) -> Self {
        Self {
            allowed_site_ids,
            ..Default::default()
        }
    }

    pub fn at_site(mut self, site_id: Ulid) -> Self {
        self.site_id = Some(site_id);
        self
    }

    pub fn desired(mut self, start: Ms) -> Self {
        self.desired_start = Some(start);
        self
    }

    pub fn rescheduling(mut self) -> Self {
        self.reschedule = true;
        self
    }
}

/// Closest start to `desired` (ties: earlier start, then lower id), or the earliest slot.
pub(crate) fn choose_candidate<I>(slots: I, desired: Option<Ms>) -> Option<Slot>
where
    I: IntoIterator<Item = Slot>,
{
    match desired {
        Some(d) => slots
            .into_iter()
            .min_by_key(|s| (s.start().abs_diff(d), s.start(), s.id)),
        None => slots.into_iter().min_by_key(|s| (s.start(), s.id)),
    }
}

impl Engine {
    /// Assign the patient a free slot, releasing their current one in the same step.
    ///
    /// Eligibility is re-evaluated before every claim attempt. Lost races are retried
    /// up to `max_claim_attempts` times and then reported as `NoSlots`; only store
    /// faults come back as `Err`.
    pub async fn schedule(
        &self,
        patient: &Patient,
        request: &ScheduleRequest,
    ) -> Result<ScheduleOutcome, EngineError> {
        let started = std::time::Instant::now();
        let result = self.schedule_inner(patient, request).await;
        let label = match &result {
            Ok(outcome) => observability::outcome_label(outcome),
            Err(_) => "error",
        };
        metrics::counter!(observability::SCHEDULE_TOTAL, "result" => label).increment(1);
        metrics::histogram!(observability::SCHEDULE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn schedule_inner(
        &self,
        patient: &Patient,
        request: &ScheduleRequest,
    ) -> Result<ScheduleOutcome, EngineError> {
        let now = self.now();
        let since = self.current_since(now);
        let (earliest, latest) = self.booking_window(now);
        let sites = self.target_sites(patient, request).await?;
        // A desired time outside the valid timestamp range is no preference.
        let desired = request
            .desired_start
            .filter(|d| (MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(d));
        let mut excluded: HashSet<Ulid> = HashSet::new();

        for attempt in 1..=self.config.max_claim_attempts {
            let current = self.current_slot_since(patient.id, since).await?;
            if !can_book(patient, current.as_ref(), request.reschedule, now) {
                debug!("patient {} does not meet booking conditions", patient.id);
                return Ok(ScheduleOutcome::ConditionsUnmet);
            }

            let mut free = Vec::new();
            for site in &sites {
                free.extend(
                    self.store
                        .free_slots_in_range(site.id, earliest, latest)
                        .await?
                        .into_iter()
                        .filter(|s| !excluded.contains(&s.id)),
                );
            }
            let Some(candidate) = choose_candidate(free, desired) else {
                return Ok(ScheduleOutcome::NoSlots);
            };

            let replacing = current.as_ref().map(|s| s.id);
            let claim = Claim {
                slot_id: candidate.id,
                patient_id: patient.id,
                replacing,
                current_since: since,
            };
            match self.store.try_claim(claim).await? {
                ClaimOutcome::Claimed(slot) => {
                    let time_changed = desired.is_some_and(|d| {
                        slot.start().abs_diff(d) > self.config.rounding_tolerance.unsigned_abs()
                    });
                    info!(
                        "patient {} booked slot {} at site {}",
                        patient.id, slot.id, slot.site_id
                    );
                    return Ok(ScheduleOutcome::Success(Booking {
                        slot,
                        desired_start: desired,
                        time_changed,
                        replaced: replacing,
                    }));
                }
                ClaimOutcome::Taken => {
                    metrics::counter!(observability::CLAIM_CONFLICTS_TOTAL).increment(1);
                    debug!(
                        "slot {} taken before patient {} could claim it (attempt {attempt})",
                        candidate.id, patient.id
                    );
                    excluded.insert(candidate.id);
                }
                ClaimOutcome::HolderChanged => {
                    metrics::counter!(observability::CLAIM_CONFLICTS_TOTAL).increment(1);
                    debug!(
                        "holdings of patient {} changed during claim (attempt {attempt})",
                        patient.id
                    );
                }
            }
        }

        warn!(
            "patient {} gave up after {} claim attempts",
            patient.id, self.config.max_claim_attempts
        );
        Ok(ScheduleOutcome::NoSlots)
    }

    /// Sites a booking may land on. A dose-linked reschedule is pinned to the
    /// site of the last dose.
    async fn target_sites(
        &self,
        patient: &Patient,
        request: &ScheduleRequest,
    ) -> Result<Vec<Site>, EngineError> {
        let mut sites = self
            .candidate_sites(&request.allowed_site_ids, request.reschedule)
            .await?;
        let pinned = if request.reschedule {
            patient.last_dose().map(|d| d.site_id)
        } else {
            None
        };
        match (pinned, request.site_id) {
            (Some(pin), Some(asked)) if pin != asked => {
                debug!(
                    "patient {} asked for site {asked}, reschedule is pinned to {pin}",
                    patient.id
                );
                sites.clear();
            }
            (Some(only), _) | (None, Some(only)) => sites.retain(|s| s.id == only),
            (None, None) => {}
        }
        Ok(sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_at(start: Ms) -> Slot {
        Slot::new(Ulid::new(), Ulid::new(), Span::new(start, start + 10 * MINUTE), false)
    }

    #[test]
    fn earliest_without_preference() {
        let base = 1_788_480_000_000;
        let slots = vec![slot_at(base + 3 * HOUR), slot_at(base + HOUR), slot_at(base + 2 * HOUR)];
        let picked = choose_candidate(slots, None).map(|s| s.start());
        assert_eq!(picked, Some(base + HOUR));
    }

    #[test]
    fn nearest_to_desired_either_side() {
        let base = 1_788_480_000_000;
        let slots = vec![slot_at(base), slot_at(base + 50 * MINUTE), slot_at(base + 2 * HOUR)];
        let picked = choose_candidate(slots, Some(base + 40 * MINUTE)).map(|s| s.start());
        assert_eq!(picked, Some(base + 50 * MINUTE));
    }

    #[test]
    fn equal_distance_prefers_earlier() {
        let base = 1_788_480_000_000;
        let slots = vec![slot_at(base + 20 * MINUTE), slot_at(base)];
        let picked = choose_candidate(slots, Some(base + 10 * MINUTE)).map(|s| s.start());
        assert_eq!(picked, Some(base));
    }

    #[test]
    fn extreme_desired_time_does_not_overflow() {
        let base = 1_788_480_000_000;
        let slots = vec![slot_at(base + HOUR), slot_at(base)];
        let picked = choose_candidate(slots.clone(), Some(i64::MIN)).map(|s| s.start());
        assert_eq!(picked, Some(base));
        let picked = choose_candidate(slots, Some(i64::MAX)).map(|s| s.start());
        assert_eq!(picked, Some(base + HOUR));
    }

    #[test]
    fn nothing_to_choose() {
        assert!(choose_candidate(Vec::new(), Some(0)).is_none());
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(ScheduleOutcome::NoSlots.code(), ResultCode::NoSlots);
        assert_eq!(ScheduleOutcome::ConditionsUnmet.code(), ResultCode::ConditionsUnmet);
        assert!(ScheduleOutcome::NoSlots.booking().is_none());

        let booking = Booking {
            slot: slot_at(1_788_480_000_000),
            desired_start: None,
            time_changed: false,
            replaced: None,
        };
        let ok = ScheduleOutcome::Success(booking.clone());
        assert_eq!(ok.code(), ResultCode::Success);
        assert_eq!(ok.slot(), Some(&booking.slot));
    }

    #[test]
    fn request_builder() {
        let site = Ulid::new();
        let req = ScheduleRequest::new(vec![site])
            .at_site(site)
            .desired(42)
            .rescheduling();
        assert_eq!(req.site_id, Some(site));
        assert_eq!(req.desired_start, Some(42));
        assert!(req.reschedule);
        assert_eq!(req.allowed_site_ids, vec![site]);
    }
}

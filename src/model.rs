use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// A physical vaccination site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: Ulid,
    pub name: String,
    /// Inactive sites offer no slots.
    pub active: bool,
    /// Only these sites take reschedule traffic.
    pub enabled_for_reschedule: bool,
}

/// Where a slot sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Assigned(Ulid),
    /// Terminal. The appointment was fulfilled.
    CheckedOut(Ulid),
}

/// A bookable time range at one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub site_id: Ulid,
    pub span: Span,
    pub patient_id: Option<Ulid>,
    pub active: bool,
    pub checked_out_at: Option<Ms>,
    /// Reserved for the follow-up dose of a specific series rather than first-dose capacity.
    pub follow_up_for_dose: bool,
}

impl Slot {
    pub fn new(id: Ulid, site_id: Ulid, span: Span, follow_up_for_dose: bool) -> Self {
        Self {
            id,
            site_id,
            span,
            patient_id: None,
            active: true,
            checked_out_at: None,
            follow_up_for_dose,
        }
    }

    pub fn start(&self) -> Ms {
        self.span.start
    }

    pub fn state(&self) -> SlotState {
        match (self.patient_id, self.checked_out_at) {
            (Some(pid), Some(_)) => SlotState::CheckedOut(pid),
            (Some(pid), None) => SlotState::Assigned(pid),
            (None, _) => SlotState::Free,
        }
    }

    pub fn is_checked_out(&self) -> bool {
        self.checked_out_at.is_some()
    }

    /// Unassigned and not checked out. Site activity is checked by the catalog.
    pub fn is_unassigned(&self) -> bool {
        self.patient_id.is_none() && self.checked_out_at.is_none()
    }

    /// Still relevant as somebody's current appointment: not checked out and not over before `since`.
    pub fn is_current(&self, since: Ms) -> bool {
        !self.is_checked_out() && self.span.end > since
    }
}

/// One administered vaccination in a patient's series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dose {
    pub id: Ulid,
    pub sequence_number: u32,
    /// Appointment at which the dose was given.
    pub appointment_id: Option<Ulid>,
    pub site_id: Ulid,
    pub vaccine: String,
    pub applied_at: Ms,
}

/// Eligibility grouping from admin data, granting access to a set of sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub id: Ulid,
    pub name: String,
    pub site_ids: Vec<Ulid>,
}

/// The patient as resolved by the caller. Read-only input to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Patient {
    pub id: Ulid,
    pub doses: Vec<Dose>,
    pub conditions: Vec<Condition>,
    pub vaccinated: bool,
    /// A mandatory profile update blocks any scheduling.
    pub force_user_update: bool,
    /// Reschedule policy (minimum inter-dose interval, dose type) as computed upstream.
    pub reschedule_condition: bool,
    /// When the reschedule policy starts allowing changes, for display.
    pub change_reschedule_after: Option<Ms>,
}

impl Patient {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn has_doses(&self) -> bool {
        !self.doses.is_empty()
    }

    /// Highest sequence number wins; the vector is not assumed sorted.
    pub fn last_dose(&self) -> Option<&Dose> {
        self.doses.iter().max_by_key(|d| d.sequence_number)
    }

    pub fn doses_in_order(&self) -> Vec<&Dose> {
        let mut doses: Vec<&Dose> = self.doses.iter().collect();
        doses.sort_by_key(|d| d.sequence_number);
        doses
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SiteCreated {
        id: Ulid,
        name: String,
        active: bool,
        enabled_for_reschedule: bool,
    },
    SiteUpdated {
        id: Ulid,
        name: String,
        active: bool,
        enabled_for_reschedule: bool,
    },
    SlotCreated {
        id: Ulid,
        site_id: Ulid,
        span: Span,
        active: bool,
        follow_up_for_dose: bool,
    },
    SlotClaimed {
        id: Ulid,
        patient_id: Ulid,
    },
    /// Claim of `to` and release of `from` as one record.
    SlotReassigned {
        from: Ulid,
        to: Ulid,
        patient_id: Ulid,
    },
    SlotReleased {
        id: Ulid,
        patient_id: Ulid,
    },
    SlotCheckedOut {
        id: Ulid,
        at: Ms,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot_at(start: Ms) -> Slot {
        Slot::new(Ulid::new(), Ulid::new(), Span::new(start, start + 10 * MINUTE), false)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn slot_state_transitions() {
        let mut slot = slot_at(DAY);
        assert_eq!(slot.state(), SlotState::Free);
        assert!(slot.is_unassigned());

        let pid = Ulid::new();
        slot.patient_id = Some(pid);
        assert_eq!(slot.state(), SlotState::Assigned(pid));
        assert!(!slot.is_unassigned());

        slot.checked_out_at = Some(DAY + MINUTE);
        assert_eq!(slot.state(), SlotState::CheckedOut(pid));
        assert!(slot.is_checked_out());
    }

    #[test]
    fn slot_current_ends_after_since() {
        let slot = slot_at(DAY);
        assert!(slot.is_current(DAY));
        assert!(slot.is_current(DAY + 9 * MINUTE));
        assert!(!slot.is_current(DAY + 10 * MINUTE));
    }

    #[test]
    fn checked_out_slot_is_never_current() {
        let mut slot = slot_at(DAY);
        slot.patient_id = Some(Ulid::new());
        slot.checked_out_at = Some(DAY);
        assert!(!slot.is_current(0));
    }

    #[test]
    fn last_dose_uses_sequence_number() {
        let site_a = Ulid::new();
        let site_b = Ulid::new();
        let mut p = Patient::new(Ulid::new());
        assert!(!p.has_doses());
        assert!(p.last_dose().is_none());

        p.doses.push(Dose {
            id: Ulid::new(),
            sequence_number: 2,
            appointment_id: None,
            site_id: site_b,
            vaccine: "coronavac".into(),
            applied_at: 2 * DAY,
        });
        p.doses.push(Dose {
            id: Ulid::new(),
            sequence_number: 1,
            appointment_id: None,
            site_id: site_a,
            vaccine: "coronavac".into(),
            applied_at: DAY,
        });

        assert!(p.has_doses());
        assert_eq!(p.last_dose().map(|d| d.site_id), Some(site_b));
        let ordered: Vec<u32> = p.doses_in_order().iter().map(|d| d.sequence_number).collect();
        assert_eq!(ordered, vec![1, 2]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SlotReassigned {
            from: Ulid::new(),
            to: Ulid::new(),
            patient_id: Ulid::new(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}

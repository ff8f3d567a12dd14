//! Metric names. Values are emitted through the `metrics` facade; installing a
//! recorder or exporter is up to the embedding application.

use crate::engine::ScheduleOutcome;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: schedule calls. Labels: result.
pub const SCHEDULE_TOTAL: &str = "vaxslot_schedule_total";

/// Histogram: schedule latency in seconds.
pub const SCHEDULE_DURATION_SECONDS: &str = "vaxslot_schedule_duration_seconds";

/// Counter: claim attempts lost to another caller or a changed holding.
pub const CLAIM_CONFLICTS_TOTAL: &str = "vaxslot_claim_conflicts_total";

/// Counter: cancel calls. Labels: status.
pub const CANCEL_TOTAL: &str = "vaxslot_cancel_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "vaxslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "vaxslot_wal_flush_batch_size";

/// Map a schedule outcome to a short label for metrics.
pub fn outcome_label(outcome: &ScheduleOutcome) -> &'static str {
    match outcome {
        ScheduleOutcome::Success(_) => "success",
        ScheduleOutcome::NoSlots => "no_slots",
        ScheduleOutcome::ConditionsUnmet => "conditions_unmet",
    }
}

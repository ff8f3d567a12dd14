use crate::limits::*;
use crate::model::{DAY, HOUR, MINUTE, Ms};

/// Immutable engine configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Bookings cannot target a start before `now + earliest_allowed_offset`.
    pub earliest_allowed_offset: Ms,
    /// Booking window ceiling: end of the day containing `now + latest_allowed_offset`.
    pub latest_allowed_offset: Ms,
    /// HorizonSearch looks at day offsets `0..=max_horizon_days`.
    pub max_horizon_days: u32,
    /// A booked start this close to the desired start counts as the same time.
    pub rounding_tolerance: Ms,
    /// Default visibility window for free-slot listings.
    pub slots_window_days: u32,
    /// Claim attempts per `schedule` call before giving up with `NoSlots`.
    pub max_claim_attempts: u32,
    /// Offset of the local day from UTC; day windows and "today" use it.
    pub utc_offset: Ms,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            earliest_allowed_offset: HOUR,
            latest_allowed_offset: 7 * DAY,
            max_horizon_days: 7,
            rounding_tolerance: 15 * MINUTE,
            slots_window_days: 7,
            max_claim_attempts: 3,
            utc_offset: 0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl SchedulerConfig {
    /// Build from `VAXSLOT_*` environment variables. Absent or unparseable values keep defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let slots_window_days = env_parse("VAXSLOT_SLOTS_WINDOW_DAYS")
            .or_else(|| env_parse("SLOTS_WINDOW_IN_DAYS"))
            .unwrap_or(d.slots_window_days);
        Self {
            earliest_allowed_offset: env_parse::<i64>("VAXSLOT_EARLIEST_ALLOWED_HOURS")
                .and_then(|h| h.checked_mul(HOUR))
                .unwrap_or(d.earliest_allowed_offset),
            latest_allowed_offset: env_parse::<i64>("VAXSLOT_LATEST_ALLOWED_DAYS")
                .and_then(|days| days.checked_mul(DAY))
                .unwrap_or(d.latest_allowed_offset),
            max_horizon_days: env_parse("VAXSLOT_MAX_HORIZON_DAYS").unwrap_or(d.max_horizon_days),
            rounding_tolerance: env_parse::<i64>("VAXSLOT_ROUNDING_MINUTES")
                .and_then(|m| m.checked_mul(MINUTE))
                .unwrap_or(d.rounding_tolerance),
            slots_window_days,
            max_claim_attempts: env_parse("VAXSLOT_MAX_CLAIM_ATTEMPTS")
                .unwrap_or(d.max_claim_attempts),
            utc_offset: env_parse::<i64>("VAXSLOT_UTC_OFFSET_MINUTES")
                .and_then(|m| m.checked_mul(MINUTE))
                .unwrap_or(d.utc_offset),
        }
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_claim_attempts == 0 {
            return Err("max_claim_attempts must be at least 1");
        }
        if self.max_claim_attempts > MAX_CLAIM_ATTEMPTS {
            return Err("max_claim_attempts too large");
        }
        if self.max_horizon_days > MAX_HORIZON_DAYS {
            return Err("max_horizon_days too large");
        }
        if self.slots_window_days > MAX_HORIZON_DAYS {
            return Err("slots_window_days too large");
        }
        if self.earliest_allowed_offset < 0 || self.rounding_tolerance < 0 {
            return Err("offsets must not be negative");
        }
        if self.latest_allowed_offset > MAX_WINDOW_OFFSET_MS
            || self.rounding_tolerance > MAX_WINDOW_OFFSET_MS
        {
            return Err("offset beyond the booking horizon");
        }
        if self.latest_allowed_offset < self.earliest_allowed_offset {
            return Err("latest_allowed_offset is before earliest_allowed_offset");
        }
        if self.utc_offset.abs() >= DAY {
            return Err("utc_offset must be less than a day");
        }
        Ok(())
    }

    /// Whole days covered by the booking window, used to clamp listing pages.
    pub fn latest_allowed_days(&self) -> u32 {
        (self.latest_allowed_offset / DAY).max(0) as u32
    }
}

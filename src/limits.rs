use crate::model::{DAY, Ms};

pub const MAX_SITES: usize = 10_000;
pub const MAX_SLOTS_PER_SITE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;

/// Sanity bounds for slot timestamps (2000-01-01 .. 2100-01-01).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single slot never lasts longer than a day.
pub const MAX_SLOT_DURATION_MS: Ms = DAY;

/// Widest window a catalog query may cover.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY;

pub const MAX_HORIZON_DAYS: u32 = 366;
/// Ceiling for configured window offsets.
pub const MAX_WINDOW_OFFSET_MS: Ms = MAX_HORIZON_DAYS as Ms * DAY;
pub const MAX_CLAIM_ATTEMPTS: u32 = 32;
pub const MAX_ALLOWED_SITES: usize = 1_000;

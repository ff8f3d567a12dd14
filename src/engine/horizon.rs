use tracing::debug;
use ulid::Ulid;

use super::{Engine, EngineError};

impl Engine {
    /// Smallest day offset in `0..=max_horizon_days` whose local day has a free slot
    /// inside the booking window at one of the allowed sites.
    pub async fn days_ahead_with_open_slot(
        &self,
        allowed: &[Ulid],
        reschedule: bool,
    ) -> Result<u32, EngineError> {
        let now = self.now();
        let (earliest, latest) = self.booking_window(now);
        let sites = self.candidate_sites(allowed, reschedule).await?;
        let max_days = self.config.max_horizon_days;

        if !sites.is_empty() {
            for day in 0..=max_days {
                let (from, to) = self.day_window(now, day);
                let (from, to) = (from.max(earliest), to.min(latest));
                if from > latest {
                    break;
                }
                if self.any_free(&sites, from, to).await? {
                    debug!("first open slot {day} days ahead");
                    return Ok(day);
                }
            }
        }
        Err(EngineError::HorizonExhausted { max_days })
    }

    /// Listing page to show: the requested page, or the first day with an open slot,
    /// clamped to `0..=latest_allowed_days`. An exhausted horizon lands on day 0.
    pub async fn visible_day(
        &self,
        page: Option<i64>,
        allowed: &[Ulid],
        reschedule: bool,
    ) -> Result<u32, EngineError> {
        let last = self.config.latest_allowed_days();
        let day = match page {
            Some(p) => p.clamp(0, last as i64) as u32,
            None => match self.days_ahead_with_open_slot(allowed, reschedule).await {
                Ok(d) => d,
                Err(EngineError::HorizonExhausted { .. }) => 0,
                Err(e) => return Err(e),
            },
        };
        Ok(day.min(last))
    }
}

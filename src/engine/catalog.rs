use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Free slots at one site, ascending by start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteSlots {
    pub site: Site,
    pub slots: Vec<Slot>,
}

impl Engine {
    /// Active sites inside `allowed`; with `reschedule`, only reschedule-eligible ones.
    pub(super) async fn candidate_sites(
        &self,
        allowed: &[Ulid],
        reschedule: bool,
    ) -> Result<Vec<Site>, EngineError> {
        if allowed.len() > MAX_ALLOWED_SITES {
            return Err(EngineError::LimitExceeded("too many allowed sites"));
        }
        let mut sites: Vec<Site> = self
            .store
            .sites()
            .await?
            .into_iter()
            .filter(|s| s.active && allowed.contains(&s.id))
            .filter(|s| !reschedule || s.enabled_for_reschedule)
            .collect();
        sites.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(sites)
    }

    /// Free slots per site with starts in `[from, to]`. Sites without any are left out.
    pub(super) async fn free_by_site(
        &self,
        sites: &[Site],
        from: Ms,
        to: Ms,
    ) -> Result<Vec<SiteSlots>, EngineError> {
        let mut out = Vec::new();
        if from > to {
            return Ok(out);
        }
        for site in sites {
            let slots = self.store.free_slots_in_range(site.id, from, to).await?;
            if !slots.is_empty() {
                out.push(SiteSlots {
                    site: site.clone(),
                    slots,
                });
            }
        }
        Ok(out)
    }

    pub(super) async fn any_free(&self, sites: &[Site], from: Ms, to: Ms) -> Result<bool, EngineError> {
        if from > to {
            return Ok(false);
        }
        for site in sites {
            if !self
                .store
                .free_slots_in_range(site.id, from, to)
                .await?
                .is_empty()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Free slots per allowed site with starts in `[from, to]`, clamped to the booking window.
    ///
    /// Sites come back ordered by name. Fails with `NoFreeSlotsAhead` when not just this
    /// window but the whole booking window has nothing free for these sites.
    pub async fn open_slots_by_site(
        &self,
        from: Ms,
        to: Ms,
        allowed: &[Ulid],
        reschedule: bool,
    ) -> Result<Vec<SiteSlots>, EngineError> {
        if to - from > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let now = self.now();
        let (earliest, latest) = self.booking_window(now);
        let sites = self.candidate_sites(allowed, reschedule).await?;

        let open = self
            .free_by_site(&sites, from.max(earliest), to.min(latest))
            .await?;
        if open.is_empty() && !self.any_free(&sites, earliest, latest).await? {
            return Err(EngineError::NoFreeSlotsAhead);
        }
        Ok(open)
    }

    /// `open_slots_by_site` for one whole local day, `day` days from today.
    pub async fn open_slots_for_day(
        &self,
        day: u32,
        allowed: &[Ulid],
        reschedule: bool,
    ) -> Result<Vec<SiteSlots>, EngineError> {
        let (from, to) = self.day_window(self.now(), day);
        self.open_slots_by_site(from, to, allowed, reschedule).await
    }

    /// Number of free slots in `[from, to]` ∩ booking window across the allowed sites.
    pub async fn count_open_slots(
        &self,
        from: Ms,
        to: Ms,
        allowed: &[Ulid],
        reschedule: bool,
    ) -> Result<usize, EngineError> {
        let (earliest, latest) = self.booking_window(self.now());
        let sites = self.candidate_sites(allowed, reschedule).await?;
        let open = self
            .free_by_site(&sites, from.max(earliest), to.min(latest))
            .await?;
        Ok(open.iter().map(|s| s.slots.len()).sum())
    }

    /// Free slots from now to the end of the configured visibility window.
    pub async fn open_slots_in_window(
        &self,
        allowed: &[Ulid],
        reschedule: bool,
    ) -> Result<Vec<SiteSlots>, EngineError> {
        let now = self.now();
        let (_, to) = self.day_window(now, self.config.slots_window_days);
        let sites = self.candidate_sites(allowed, reschedule).await?;
        self.free_by_site(&sites, now, to).await
    }
}

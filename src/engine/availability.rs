use chrono::NaiveDate;

use crate::limits::{SMART_MIN_GAP_MINUTES, SMART_SCAN_STEP_MINUTES};
use crate::model::{Booking, BookingStatus, Business, SlotPolicy};
use crate::store::BookingStore;
use crate::time::{LocalInstant, Minutes, Span, TimeOfDay};

use super::grid::build_grid;
use super::occupancy::OccupancyIndex;
use super::{ConfigError, EngineError};

// ── Availability Algorithm ────────────────────────────────────────

/// Tuning for the smart scan. Independent of any business's slot gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmartScan {
    pub step_minutes: Minutes,
    pub min_gap_minutes: Minutes,
}

impl Default for SmartScan {
    fn default() -> Self {
        Self {
            step_minutes: SMART_SCAN_STEP_MINUTES,
            min_gap_minutes: SMART_MIN_GAP_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AvailabilityEngine {
    smart: SmartScan,
}

impl AvailabilityEngine {
    pub fn new(smart: SmartScan) -> Self {
        Self { smart }
    }

    /// Bookable start times for `duration` on `date`, reading live occupancy.
    pub async fn free_slots(
        &self,
        store: &dyn BookingStore,
        business: &Business,
        duration: Minutes,
        date: NaiveDate,
        now: LocalInstant,
    ) -> Result<Vec<TimeOfDay>, EngineError> {
        if !business.is_open_on(date) || date < now.date || duration == 0 {
            return Ok(Vec::new());
        }
        let bookings = store
            .find(&business.id, date, &BookingStatus::ACTIVE)
            .await?;
        Ok(self.free_slots_in(business, duration, date, &bookings, now)?)
    }

    /// Pure variant of [`free_slots`](Self::free_slots) over already-loaded
    /// bookings for `date`.
    ///
    /// Non-working days, closed dates, past dates and days where nothing fits
    /// all yield an empty list. On `now.date`, slots that already started are
    /// dropped.
    pub fn free_slots_in(
        &self,
        business: &Business,
        duration: Minutes,
        date: NaiveDate,
        bookings: &[Booking],
        now: LocalInstant,
    ) -> Result<Vec<TimeOfDay>, ConfigError> {
        let day = business.hours.day_span()?;
        if !business.is_open_on(date) || date < now.date || duration == 0 {
            return Ok(Vec::new());
        }

        let occupancy = OccupancyIndex::from_bookings(bookings.iter().filter(|b| b.date == date));
        let windows = occupancy.free_windows(day);

        let candidates = match business.slot_policy {
            SlotPolicy::Grid => build_grid(
                business.hours.opening_time,
                business.hours.closing_time,
                business.hours.slot_gap_minutes,
            )?,
            SlotPolicy::Smart => scan(day, self.smart.step_minutes),
        };

        let slots = candidates
            .into_iter()
            .filter(|t| !now.has_passed(date, *t))
            .filter(|t| self.fits(business.slot_policy, &windows, day, *t, duration))
            .collect();
        Ok(slots)
    }

    fn fits(
        &self,
        policy: SlotPolicy,
        windows: &[Span],
        day: Span,
        start: TimeOfDay,
        duration: Minutes,
    ) -> bool {
        let Some(slot) = start.span(duration) else {
            return false;
        };
        let Some(window) = containing_window(windows, &slot) else {
            return false;
        };
        match policy {
            SlotPolicy::Grid => true,
            SlotPolicy::Smart => {
                leaves_usable_gap(window, &slot, day.end, self.smart.min_gap_minutes)
            }
        }
    }
}

/// Every `step` minutes from opening that still leaves room before closing.
fn scan(day: Span, step: Minutes) -> Vec<TimeOfDay> {
    let step = step.max(1);
    (day.start..day.end)
        .step_by(step as usize)
        .map(TimeOfDay::saturating)
        .collect()
}

fn containing_window<'a>(windows: &'a [Span], slot: &Span) -> Option<&'a Span> {
    let idx = windows.partition_point(|w| w.end < slot.end);
    windows.get(idx).filter(|w| w.contains_span(slot))
}

/// A window ending before closing ends where the next booking starts. The
/// slot must either touch that booking or leave at least `min_gap` before it.
fn leaves_usable_gap(window: &Span, slot: &Span, closing: Minutes, min_gap: Minutes) -> bool {
    if window.end >= closing {
        return true;
    }
    let gap = window.end - slot.end;
    gap == 0 || gap >= min_gap
}

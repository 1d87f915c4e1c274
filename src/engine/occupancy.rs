use crate::model::{Booking, BookingId};
use crate::time::Span;

/// Intervals consumed by active bookings on one date, sorted by start.
#[derive(Debug, Clone, Default)]
pub struct OccupancyIndex {
    spans: Vec<(Span, BookingId)>,
}

impl OccupancyIndex {
    /// Index the pending/confirmed bookings among `bookings`.
    pub fn from_bookings<'a>(bookings: impl IntoIterator<Item = &'a Booking>) -> Self {
        Self::from_bookings_except(bookings, None)
    }

    /// Like [`from_bookings`](Self::from_bookings) but ignores `exclude`,
    /// for moving a booking without colliding with itself.
    pub fn from_bookings_except<'a>(
        bookings: impl IntoIterator<Item = &'a Booking>,
        exclude: Option<BookingId>,
    ) -> Self {
        let mut spans: Vec<(Span, BookingId)> = bookings
            .into_iter()
            .filter(|b| b.is_active() && Some(b.id) != exclude)
            .map(|b| (b.span(), b.id))
            .collect();
        spans.sort_by_key(|(s, _)| s.start);
        Self { spans }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Entries whose span overlaps `query`.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &(Span, BookingId)> {
        let right_bound = self.spans.partition_point(|(s, _)| s.start < query.end);
        self.spans[..right_bound]
            .iter()
            .filter(move |(s, _)| s.end > query.start)
    }

    pub fn first_conflict(&self, span: &Span) -> Option<BookingId> {
        self.overlapping(span).next().map(|(_, id)| *id)
    }

    pub fn is_free(&self, span: &Span) -> bool {
        self.first_conflict(span).is_none()
    }

    /// Maximal unoccupied sub-intervals of `within`.
    pub fn free_windows(&self, within: Span) -> Vec<Span> {
        let occupied: Vec<Span> = self.spans.iter().map(|(s, _)| *s).collect();
        subtract_intervals(&[within], &merge_overlapping(&occupied))
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

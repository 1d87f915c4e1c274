use chrono::NaiveDate;

use crate::conversation::ConversationState;
use crate::model::*;

use super::Store;

impl Store {
    /// Bookings on `date` whose status is in `statuses`, sorted by time.
    pub async fn bookings_on(&self, date: NaiveDate, statuses: &[BookingStatus]) -> Vec<Booking> {
        let Some(day) = self.existing_day(date) else {
            return Vec::new();
        };
        let guard = day.read().await;
        guard
            .bookings
            .iter()
            .filter(|b| statuses.contains(&b.status))
            .cloned()
            .collect()
    }

    /// Every booking of `phone` on or after `from`, in date and time order.
    pub async fn bookings_for_customer(&self, phone: &str, from: NaiveDate) -> Vec<Booking> {
        let mut days: Vec<_> = self
            .days
            .iter()
            .filter(|e| *e.key() >= from)
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(date, _)| *date);

        let mut found = Vec::new();
        for (_, day) in days {
            let guard = day.read().await;
            found.extend(guard.bookings.iter().filter(|b| b.phone == phone).cloned());
        }
        found
    }

    pub async fn booking(&self, id: BookingId) -> Option<Booking> {
        let date = *self.booking_dates.get(&id)?.value();
        let day = self.existing_day(date)?;
        let guard = day.read().await;
        guard.get(id).cloned()
    }

    pub async fn conversation(&self, phone: &str) -> Option<ConversationState> {
        let slot = self.conversations.get(phone)?.value().clone();
        let guard = slot.read().await;
        guard.clone()
    }

    pub fn booking_count(&self) -> usize {
        self.booking_dates.len()
    }
}

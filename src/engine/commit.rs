use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::model::*;
use crate::store::{BookingStore, StoreError};
use crate::time::{Clock, Minutes, TimeOfDay};

use super::EngineError;

/// Everything the conversation collected for a new booking.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    /// Minted once per booking attempt. Committing the same id twice yields
    /// the booking from the first commit.
    pub id: BookingId,
    pub phone: String,
    pub customer_name: String,
    pub notes: String,
    pub service_id: ServiceId,
    /// Taken when the service was selected; stored on the booking as is.
    pub snapshot: ServiceSnapshot,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub source: BookingSource,
}

/// Final write of a booking flow. The overlap check runs inside the store
/// under the day's write lock, so two commits for one slot can never both
/// succeed.
pub struct BookingCommitter {
    bookings: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
}

impl BookingCommitter {
    pub fn new(bookings: Arc<dyn BookingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { bookings, clock }
    }

    pub async fn commit(
        &self,
        business: &Business,
        request: BookingRequest,
    ) -> Result<Booking, EngineError> {
        if !business
            .service(&request.service_id)
            .is_some_and(Service::is_bookable)
        {
            return Err(EngineError::Stale(format!("service {}", request.service_id)));
        }
        self.check_slot(business, request.snapshot.duration, request.date, request.time)?;

        let created_at = self.clock.now();
        let booking = Booking {
            id: request.id,
            business_id: business.id.clone(),
            phone: request.phone,
            customer_name: request.customer_name,
            service_id: request.service_id,
            service: request.snapshot,
            date: request.date,
            time: request.time,
            status: business.initial_booking_status(),
            notes: request.notes,
            source: request.source,
            created_at,
        };

        match self.bookings.insert(booking).await {
            Ok(booking) if booking.created_at != created_at => {
                debug!(business = %business.id, booking = %booking.id, "commit replayed");
                Ok(booking)
            }
            Ok(booking) => {
                info!(
                    business = %business.id,
                    booking = %booking.id,
                    date = %booking.date,
                    time = %booking.time,
                    status = ?booking.status,
                    "booking created"
                );
                metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "kind" => "created")
                    .increment(1);
                Ok(booking)
            }
            Err(StoreError::Overlap(existing)) => {
                Err(self.conflict(business, request.date, request.time, existing))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move an active booking of `phone` to a new slot. The booking keeps its
    /// id, snapshot and status.
    pub async fn reschedule(
        &self,
        business: &Business,
        phone: &str,
        booking_id: BookingId,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<Booking, EngineError> {
        let stale = || EngineError::Stale(format!("booking {booking_id}"));
        let current = self
            .bookings
            .booking(&business.id, booking_id)
            .await?
            .filter(|b| b.phone == phone && b.is_active())
            .ok_or_else(stale)?;
        self.check_slot(business, current.service.duration, date, time)?;

        match self
            .bookings
            .reschedule(&business.id, booking_id, date, time)
            .await
        {
            Ok(booking) => {
                info!(
                    business = %business.id,
                    booking = %booking.id,
                    from_date = %current.date,
                    from_time = %current.time,
                    %date,
                    %time,
                    "booking rescheduled"
                );
                metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL, "kind" => "rescheduled")
                    .increment(1);
                Ok(booking)
            }
            Err(StoreError::Overlap(existing)) => Err(self.conflict(business, date, time, existing)),
            Err(StoreError::NotFound(_) | StoreError::Inactive(_)) => Err(stale()),
            Err(e) => Err(e.into()),
        }
    }

    /// The slot must still be inside today's hours on an open date and not
    /// already started. Occupancy is checked by the store.
    fn check_slot(
        &self,
        business: &Business,
        duration: Minutes,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<(), EngineError> {
        let day = business.hours.day_span()?;
        let now = business.local_now(self.clock.now());
        let unavailable = || EngineError::Conflict { date, time };

        if !business.is_open_on(date) || now.has_passed(date, time) {
            return Err(unavailable());
        }
        let slot = time.span(duration).ok_or_else(unavailable)?;
        if !day.contains_span(&slot) {
            return Err(unavailable());
        }
        Ok(())
    }

    fn conflict(
        &self,
        business: &Business,
        date: NaiveDate,
        time: TimeOfDay,
        existing: BookingId,
    ) -> EngineError {
        warn!(
            business = %business.id,
            %date,
            %time,
            overlaps = %existing,
            "slot taken at commit"
        );
        metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
        EngineError::Conflict { date, time }
    }
}

use chrono::NaiveDate;
use tokio::sync::oneshot;

use crate::conversation::ConversationState;
use crate::limits::*;
use crate::model::*;
use crate::time::TimeOfDay;

use super::{DayLedger, Store, StoreError, WalCommand};

/// A booking can be moved by another writer between the index lookup and the
/// day lock. After this many lookups the booking is reported missing.
const RESOLVE_ATTEMPTS: usize = 3;

impl Store {
    /// Insert a new booking. Inserting the same id again for the same phone
    /// and slot returns the stored booking, so a retried commit is a no-op.
    pub async fn insert_booking(&self, booking: Booking) -> Result<Booking, StoreError> {
        self.check_tenant(&booking.business_id)?;
        if booking.phone.len() > MAX_PHONE_LEN {
            return Err(StoreError::LimitExceeded("phone too long"));
        }
        if booking.customer_name.chars().count() > MAX_NAME_CHARS {
            return Err(StoreError::LimitExceeded("customer name too long"));
        }

        let _compaction = self.compaction.read().await;
        let day = self.day_entry(booking.date);
        let mut guard = day.write().await;
        if let Some(stored) = guard.get(booking.id) {
            return if stored.phone == booking.phone && stored.time == booking.time {
                Ok(stored.clone())
            } else {
                Err(StoreError::DuplicateId(booking.id))
            };
        }
        if self.booking_dates.contains_key(&booking.id) {
            return Err(StoreError::DuplicateId(booking.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(StoreError::LimitExceeded("too many bookings on date"));
        }
        if booking.is_active()
            && let Some(existing) = guard.occupancy_except(None).first_conflict(&booking.span())
        {
            return Err(StoreError::Overlap(existing));
        }

        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        self.booking_dates.insert(booking.id, booking.date);
        guard.insert(booking.clone());
        Ok(booking)
    }

    /// Move an active booking to `date` at `time`, keeping its id, snapshot and
    /// status. The booking never collides with its own old slot.
    pub async fn move_booking(
        &self,
        id: BookingId,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<Booking, StoreError> {
        let _compaction = self.compaction.read().await;

        for _ in 0..RESOLVE_ATTEMPTS {
            let from = *self
                .booking_dates
                .get(&id)
                .ok_or(StoreError::NotFound(id))?
                .value();

            if from == date {
                let day = self.day_entry(date);
                let mut guard = day.write().await;
                let Some(current) = guard.get(id).cloned() else {
                    continue;
                };
                let moved = self.check_move(&guard, current, date, time)?;
                let event = Event::BookingMoved { id, from, date, time };
                self.wal_append(&event).await?;
                guard.remove(id);
                guard.insert(moved.clone());
                return Ok(moved);
            }

            // Acquire write locks in date order to prevent deadlocks.
            let (lo, hi) = if from < date { (from, date) } else { (date, from) };
            let lo_guard = self.day_entry(lo).write_owned().await;
            let hi_guard = self.day_entry(hi).write_owned().await;
            let (mut from_guard, mut to_guard) = if from < date {
                (lo_guard, hi_guard)
            } else {
                (hi_guard, lo_guard)
            };

            let Some(current) = from_guard.get(id).cloned() else {
                continue;
            };
            if to_guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
                return Err(StoreError::LimitExceeded("too many bookings on date"));
            }
            let moved = self.check_move(&to_guard, current, date, time)?;
            let event = Event::BookingMoved { id, from, date, time };
            self.wal_append(&event).await?;
            from_guard.remove(id);
            to_guard.insert(moved.clone());
            self.booking_dates.insert(id, date);
            return Ok(moved);
        }

        Err(StoreError::NotFound(id))
    }

    fn check_move(
        &self,
        target: &DayLedger,
        current: Booking,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<Booking, StoreError> {
        if !current.is_active() {
            return Err(StoreError::Inactive(current.id));
        }
        let moved = Booking {
            date,
            time,
            ..current
        };
        if let Some(existing) = target
            .occupancy_except(Some(moved.id))
            .first_conflict(&moved.span())
        {
            return Err(StoreError::Overlap(existing));
        }
        Ok(moved)
    }

    /// Reactivating a cancelled booking re-checks overlap like an insert.
    pub async fn set_booking_status(
        &self,
        id: BookingId,
        status: BookingStatus,
    ) -> Result<Booking, StoreError> {
        let _compaction = self.compaction.read().await;

        for _ in 0..RESOLVE_ATTEMPTS {
            let date = *self
                .booking_dates
                .get(&id)
                .ok_or(StoreError::NotFound(id))?
                .value();
            let day = self.day_entry(date);
            let mut guard = day.write().await;
            let Some(current) = guard.get(id).cloned() else {
                continue;
            };
            if current.status == status {
                return Ok(current);
            }
            if !current.is_active()
                && status.is_active()
                && let Some(existing) = guard
                    .occupancy_except(Some(id))
                    .first_conflict(&current.span())
            {
                return Err(StoreError::Overlap(existing));
            }

            let event = Event::BookingStatusChanged { id, date, status };
            self.wal_append(&event).await?;
            let mut updated = current;
            updated.status = status;
            if let Some(slot) = guard.bookings.iter_mut().find(|b| b.id == id) {
                *slot = updated.clone();
            }
            return Ok(updated);
        }

        Err(StoreError::NotFound(id))
    }

    /// Optimistic save: `state.version` must equal the stored version (0 when
    /// nothing is stored yet).
    pub async fn save_conversation(
        &self,
        state: ConversationState,
    ) -> Result<ConversationState, StoreError> {
        self.check_tenant(&state.business_id)?;
        if state.phone.len() > MAX_PHONE_LEN {
            return Err(StoreError::LimitExceeded("phone too long"));
        }

        let _compaction = self.compaction.read().await;
        let slot = self.conversation_entry(&state.phone);
        let mut guard = slot.write().await;
        let found = guard.as_ref().map_or(0, |s| s.version);
        if found != state.version {
            return Err(StoreError::VersionConflict {
                expected: state.version,
                found,
            });
        }

        let saved = ConversationState {
            version: state.version + 1,
            ..state
        };
        let event = Event::ConversationSaved {
            state: saved.clone(),
        };
        self.wal_append(&event).await?;
        *guard = Some(saved.clone());
        Ok(saved)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state: one `BookingCreated` per booking as it stands now and
    /// the latest saved state of each conversation.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _exclusive = self.compaction.write().await;

        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(date, _)| *date);

        let mut events = Vec::new();
        for (_, day) in days {
            let guard = day.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
        }

        let conversations: Vec<_> = self.conversations.iter().map(|e| e.value().clone()).collect();
        for slot in conversations {
            if let Some(state) = slot.read().await.as_ref() {
                events.push(Event::ConversationSaved {
                    state: state.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

mod error;
mod mutations;
mod queries;

pub use error::StoreError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::conversation::ConversationState;
use crate::engine::OccupancyIndex;
use crate::model::*;
use crate::time::TimeOfDay;
use crate::wal::Wal;

pub type SharedDay = Arc<RwLock<DayLedger>>;
pub type SharedConversation = Arc<RwLock<Option<ConversationState>>>;

// ── Collaborator interfaces ──────────────────────────────

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find(
        &self,
        business_id: &BusinessId,
        date: NaiveDate,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, StoreError>;

    /// Bookings of one customer on or after `from`, ordered by date and time.
    async fn find_for_customer(
        &self,
        business_id: &BusinessId,
        phone: &str,
        from: NaiveDate,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn booking(
        &self,
        business_id: &BusinessId,
        id: BookingId,
    ) -> Result<Option<Booking>, StoreError>;

    /// Insert unless the booking overlaps an active booking on its date.
    /// Check and insert are one atomic step per business and date.
    async fn insert(&self, booking: Booking) -> Result<Booking, StoreError>;

    /// Move an active booking to a new slot, atomically with the overlap check.
    async fn reschedule(
        &self,
        business_id: &BusinessId,
        id: BookingId,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<Booking, StoreError>;

    async fn set_status(
        &self,
        business_id: &BusinessId,
        id: BookingId,
        status: BookingStatus,
    ) -> Result<Booking, StoreError>;
}

#[async_trait]
pub trait ConversationStateStore: Send + Sync {
    async fn load(
        &self,
        business_id: &BusinessId,
        phone: &str,
    ) -> Result<Option<ConversationState>, StoreError>;

    /// Save `state` if the stored version still equals `state.version`.
    /// Returns the saved state with its version bumped.
    async fn upsert(&self, state: ConversationState) -> Result<ConversationState, StoreError>;
}

// ── Day ledger ───────────────────────────────────────────

/// All bookings of one business on one date, sorted by start time.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub date: NaiveDate,
    pub bookings: Vec<Booking>,
}

impl DayLedger {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by time.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.time, |b| b.time)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn occupancy_except(&self, exclude: Option<BookingId>) -> OccupancyIndex {
        OccupancyIndex::from_bookings_except(&self.bookings, exclude)
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let failure = append_err.or(flush_err);
    for (_, tx) in batch.drain(..) {
        let r = match &failure {
            None => Ok(()),
            Some(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            flush_and_respond(wal, &mut vec![(event, response)]);
        }
    }
}

// ── Store ────────────────────────────────────────────────

/// Bookings and conversation states of one business, durable via its WAL.
pub struct Store {
    business_id: BusinessId,
    pub(super) days: DashMap<NaiveDate, SharedDay>,
    pub(super) conversations: DashMap<String, SharedConversation>,
    /// Reverse lookup: booking id → date partition.
    pub(super) booking_dates: DashMap<BookingId, NaiveDate>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared for their whole duration; compaction holds
    /// it exclusively so no append lands between snapshot and file swap.
    pub(super) compaction: RwLock<()>,
}

impl Store {
    pub fn open(business_id: BusinessId, wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            business_id,
            days: DashMap::new(),
            conversations: DashMap::new(),
            booking_dates: DashMap::new(),
            wal_tx,
            compaction: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never use blocking_write here: this runs inside async
        // contexts (lazy tenant creation).
        let replayed = events.len();
        for event in events {
            store.replay_event(event);
        }
        tracing::debug!(
            business = %store.business_id,
            events = replayed,
            bookings = store.booking_dates.len(),
            "store replayed"
        );

        Ok(store)
    }

    pub fn business_id(&self) -> &BusinessId {
        &self.business_id
    }

    fn replay_event(&self, event: Event) {
        match event {
            Event::BookingCreated { booking } => {
                let day = self.day_entry(booking.date);
                let mut guard = day.try_write().expect("replay: uncontended write");
                self.booking_dates.insert(booking.id, booking.date);
                guard.insert(booking);
            }
            Event::BookingMoved { id, from, date, time } => {
                let from_day = self.day_entry(from);
                let mut from_guard = from_day.try_write().expect("replay: uncontended write");
                let Some(mut booking) = from_guard.remove(id) else {
                    return;
                };
                booking.date = date;
                booking.time = time;
                if from == date {
                    from_guard.insert(booking);
                } else {
                    drop(from_guard);
                    let to_day = self.day_entry(date);
                    to_day
                        .try_write()
                        .expect("replay: uncontended write")
                        .insert(booking);
                }
                self.booking_dates.insert(id, date);
            }
            Event::BookingStatusChanged { id, date, status } => {
                let day = self.day_entry(date);
                let mut guard = day.try_write().expect("replay: uncontended write");
                if let Some(booking) = guard.bookings.iter_mut().find(|b| b.id == id) {
                    booking.status = status;
                }
            }
            Event::ConversationSaved { state } => {
                let slot = self.conversation_entry(&state.phone);
                *slot.try_write().expect("replay: uncontended write") = Some(state);
            }
        }
    }

    pub(super) fn day_entry(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(date))))
            .value()
            .clone()
    }

    pub(super) fn existing_day(&self, date: NaiveDate) -> Option<SharedDay> {
        self.days.get(&date).map(|e| e.value().clone())
    }

    pub(super) fn conversation_entry(&self, phone: &str) -> SharedConversation {
        self.conversations
            .entry(phone.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .value()
            .clone()
    }

    pub(super) fn check_tenant(&self, business_id: &BusinessId) -> Result<(), StoreError> {
        if business_id != &self.business_id {
            return Err(StoreError::WrongTenant {
                expected: self.business_id.to_string(),
                got: business_id.to_string(),
            });
        }
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::conversation::ConversationState;
use crate::engine::ConfigError;
use crate::limits::DEFAULT_BOOKING_HORIZON_DAYS;
use crate::time::{LocalInstant, Minutes, Span, TimeOfDay};

pub type BookingId = Ulid;
pub type ServiceId = String;

/// Tenant identifier. One business = one tenant = one WAL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessId(pub String);

impl BusinessId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BusinessId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The unique key of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub business_id: BusinessId,
    pub phone: String,
}

impl ConversationKey {
    pub fn new(business_id: &BusinessId, phone: &str) -> Self {
        Self {
            business_id: business_id.clone(),
            phone: phone.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    English,
    #[serde(rename = "ar")]
    Arabic,
}

/// Text keyed by language. Lookups fall back to English, then to any entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalizedText(pub BTreeMap<Language, String>);

impl LocalizedText {
    pub fn new(language: Language, text: impl Into<String>) -> Self {
        Self(BTreeMap::from([(language, text.into())]))
    }

    pub fn with(mut self, language: Language, text: impl Into<String>) -> Self {
        self.0.insert(language, text.into());
        self
    }

    pub fn get(&self, language: Language) -> &str {
        self.0
            .get(&language)
            .or_else(|| self.0.get(&Language::English))
            .or_else(|| self.0.values().next())
            .map(String::as_str)
            .unwrap_or("")
    }
}

// ── Business configuration ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: LocalizedText,
    pub price: Decimal,
    /// Minutes.
    pub duration: Minutes,
    #[serde(default = "default_true")]
    pub bookable: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl Service {
    pub fn is_bookable(&self) -> bool {
        self.bookable && self.is_active && self.duration > 0
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            name: self.name.clone(),
            price: self.price,
            duration: self.duration,
        }
    }
}

/// Immutable copy of a service taken when it was selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: LocalizedText,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub duration: Minutes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub working_days: Vec<Weekday>,
    pub opening_time: TimeOfDay,
    pub closing_time: TimeOfDay,
    pub slot_gap_minutes: Minutes,
}

impl OperatingHours {
    /// The bookable part of a working day.
    pub fn day_span(&self) -> Result<Span, ConfigError> {
        if self.opening_time >= self.closing_time {
            return Err(ConfigError::InvertedHours {
                opening: self.opening_time,
                closing: self.closing_time,
            });
        }
        Ok(Span::new(
            self.opening_time.minutes(),
            self.closing_time.minutes(),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotPolicy {
    /// Fixed-granularity slots from the business slot gap.
    #[default]
    Grid,
    /// Continuous scan that avoids leaving unusable idle gaps.
    Smart,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Business {
    pub id: BusinessId,
    #[serde(default)]
    pub name: String,
    pub hours: OperatingHours,
    #[serde(default)]
    pub closed_dates: BTreeSet<NaiveDate>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default = "default_booking_status")]
    pub default_booking_status: BookingStatus,
    #[serde(default)]
    pub slot_policy: SlotPolicy,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_horizon")]
    pub booking_horizon_days: u32,
}

fn default_booking_status() -> BookingStatus {
    BookingStatus::Pending
}

fn default_horizon() -> u32 {
    DEFAULT_BOOKING_HORIZON_DAYS
}

impl Business {
    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    /// Services offered in the booking menu, in configuration order.
    pub fn bookable_services(&self) -> impl Iterator<Item = &Service> {
        self.services.iter().filter(|s| s.is_bookable())
    }

    pub fn is_working_day(&self, weekday: Weekday) -> bool {
        self.hours.working_days.contains(&weekday)
    }

    pub fn is_open_on(&self, date: NaiveDate) -> bool {
        self.is_working_day(date.weekday()) && !self.closed_dates.contains(&date)
    }

    pub fn local_now(&self, now: DateTime<Utc>) -> LocalInstant {
        LocalInstant::at(now, self.utc_offset_minutes)
    }

    /// Last date customers may book, counting from `today`.
    pub fn horizon_end(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_add_days(chrono::Days::new(u64::from(self.booking_horizon_days)))
            .unwrap_or(NaiveDate::MAX)
    }

    /// Status given to freshly committed bookings. A misconfigured
    /// `cancelled` default falls back to `pending`.
    pub fn initial_booking_status(&self) -> BookingStatus {
        match self.default_booking_status {
            BookingStatus::Cancelled => BookingStatus::Pending,
            status => status,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hours.day_span().map(|_| ())
    }
}

// ── Bookings ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub const ACTIVE: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Confirmed];

    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingSource {
    Whatsapp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub business_id: BusinessId,
    pub phone: String,
    pub customer_name: String,
    pub service_id: ServiceId,
    pub service: ServiceSnapshot,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub status: BookingStatus,
    pub notes: String,
    pub source: BookingSource,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    /// `[time, time + duration)`. A zero-duration snapshot occupies one minute.
    pub fn span(&self) -> Span {
        let start = self.time.minutes();
        Span::new(start, start.saturating_add(self.service.duration.max(1)))
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingMoved {
        id: BookingId,
        from: NaiveDate,
        date: NaiveDate,
        time: TimeOfDay,
    },
    BookingStatusChanged {
        id: BookingId,
        date: NaiveDate,
        status: BookingStatus,
    },
    ConversationSaved {
        state: ConversationState,
    },
}

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::conversation::Rejection;
use crate::model::*;
use crate::time::{Minutes, TimeOfDay};

const CHANNEL_CAPACITY: usize = 256;

/// A structured reply. Rendering to text or templates happens downstream,
/// in `language`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub language: Language,
    pub content: Content,
}

impl OutboundMessage {
    pub fn new(language: Language, content: Content) -> Self {
        Self { language, content }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    LanguageOptions,
    Menu,
    ServiceOptions { options: Vec<ServiceOption> },
    /// Rendered with one extra trailing option for typing another date.
    DateOptions { dates: Vec<NaiveDate> },
    AskDate,
    TimeRangeOptions { date: NaiveDate, ranges: Vec<TimeRange> },
    TimeOptions { date: NaiveDate, slots: Vec<TimeOfDay> },
    AskName,
    AskNote,
    AppointmentOptions { options: Vec<BookingSummary> },
    BookingConfirmed { booking: BookingSummary },
    BookingRescheduled { booking: BookingSummary },
    NoServices,
    NoUpcomingDates,
    NoAppointments,
    NoSlots { date: NaiveDate },
    SlotTaken { date: NaiveDate, time: TimeOfDay },
    Invalid { rejection: Rejection },
    SelectionUnavailable,
    Cancelled,
    Apology,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOption {
    pub id: ServiceId,
    pub name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub duration: Minutes,
}

impl ServiceOption {
    pub fn of(service: &Service, language: Language) -> Self {
        Self {
            id: service.id.clone(),
            name: service.name.get(language).to_string(),
            price: service.price,
            duration: service.duration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: TimeOfDay,
    pub to: TimeOfDay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSummary {
    pub id: BookingId,
    pub service_name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub duration: Minutes,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub status: BookingStatus,
    pub customer_name: String,
}

impl BookingSummary {
    pub fn of(booking: &Booking, language: Language) -> Self {
        Self {
            id: booking.id,
            service_name: booking.service.name.get(language).to_string(),
            price: booking.service.price,
            duration: booking.service.duration,
            date: booking.date,
            time: booking.time,
            status: booking.status,
            customer_name: booking.customer_name.clone(),
        }
    }
}

/// One outbound message addressed to a customer. This is also the wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub business_id: BusinessId,
    pub phone: String,
    pub message: OutboundMessage,
}

/// Fire-and-forget delivery to a customer.
#[async_trait]
pub trait MessageOut: Send + Sync {
    async fn send(&self, business_id: &BusinessId, phone: &str, message: OutboundMessage);
}

/// Broadcast hub for outbound messages per business.
pub struct OutboxHub {
    channels: DashMap<BusinessId, broadcast::Sender<Envelope>>,
}

impl Default for OutboxHub {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboxHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to every message sent on behalf of a business. Creates the
    /// channel if needed.
    pub fn subscribe(&self, business_id: &BusinessId) -> broadcast::Receiver<Envelope> {
        let sender = self
            .channels
            .entry(business_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Drop the channel once nobody listens any more.
    pub fn prune(&self, business_id: &BusinessId) {
        self.channels
            .remove_if(business_id, |_, sender| sender.receiver_count() == 0);
    }
}

#[async_trait]
impl MessageOut for OutboxHub {
    /// No-op if nobody is listening.
    async fn send(&self, business_id: &BusinessId, phone: &str, message: OutboundMessage) {
        metrics::counter!(crate::observability::OUTBOUND_MESSAGES_TOTAL).increment(1);
        if let Some(sender) = self.channels.get(business_id) {
            let _ = sender.send(Envelope {
                business_id: business_id.clone(),
                phone: phone.to_string(),
                message,
            });
        }
    }
}

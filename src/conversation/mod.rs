mod dispatcher;
mod input;
mod steps;
#[cfg(test)]
mod tests;

pub use dispatcher::Dispatcher;
pub use input::{GlobalCommand, global_command, normalize_digits, parse_date, parse_selection};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{ConfigError, EngineError};
use crate::model::*;
use crate::outbox::OutboundMessage;
use crate::store::StoreError;
use crate::time::TimeOfDay;

/// Persisted per (business, phone). Created lazily on the first message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub business_id: BusinessId,
    pub phone: String,
    pub language: Language,
    pub step: Step,
    /// Optimistic concurrency counter. 0 means never saved.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(business_id: BusinessId, phone: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            business_id,
            phone: phone.into(),
            language: Language::default(),
            step: Step::LanguageSelect,
            version: 0,
            updated_at: now,
        }
    }
}

/// The booking in progress. Carries the snapshot taken when the service was
/// picked, so later edits to the service never leak into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub service_id: ServiceId,
    pub service: ServiceSnapshot,
    /// Set when the draft moves an existing booking instead of creating one.
    pub rescheduling: Option<BookingId>,
}

/// Where a conversation is, together with everything the next input needs.
///
/// Lists shown to the customer are stored as sent; a numeric reply always
/// indexes the stored list, never a freshly derived one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    LanguageSelect,
    Menu,
    SelectService {
        service_ids: Vec<ServiceId>,
    },
    SelectDateList {
        draft: Draft,
        /// The last option (`dates.len() + 1`) asks for a typed date.
        dates: Vec<NaiveDate>,
    },
    SelectDate {
        draft: Draft,
    },
    SelectTimeRange {
        draft: Draft,
        date: NaiveDate,
        ranges: Vec<Vec<TimeOfDay>>,
    },
    SelectTime {
        draft: Draft,
        date: NaiveDate,
        slots: Vec<TimeOfDay>,
    },
    EnterName {
        draft: Draft,
        date: NaiveDate,
        time: TimeOfDay,
    },
    EnterNote {
        draft: Draft,
        date: NaiveDate,
        time: TimeOfDay,
        customer_name: String,
        /// Id the booking is committed under. Kept in the step so a re-run
        /// of the final message finds the booking it already wrote.
        booking_id: BookingId,
    },
    RescheduleSelectAppointment {
        booking_ids: Vec<BookingId>,
    },
}

impl Step {
    /// Stable name for logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Step::LanguageSelect => "language_select",
            Step::Menu => "menu",
            Step::SelectService { .. } => "select_service",
            Step::SelectDateList { .. } => "select_date_list",
            Step::SelectDate { .. } => "select_date",
            Step::SelectTimeRange { .. } => "select_time_range",
            Step::SelectTime { .. } => "select_time",
            Step::EnterName { .. } => "enter_name",
            Step::EnterNote { .. } => "enter_note",
            Step::RescheduleSelectAppointment { .. } => "reschedule_select_appointment",
        }
    }
}

/// Result of one handled message, applied only after it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub language: Language,
    pub step: Step,
    pub messages: Vec<OutboundMessage>,
}

/// Why an input was not accepted. The step stays where it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    NotANumber,
    OutOfRange { max: usize },
    DateFormat,
    DateInPast,
    BeyondHorizon { last: NaiveDate },
    NotWorkingDay,
    ClosedDate,
    NoFreeSlots,
    NameTooShort { min: usize },
    NameTooLong { max: usize },
    NoteTooLong { max: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("invalid input: {0:?}")]
    Validation(Rejection),
    #[error("selection no longer available: {0}")]
    StaleSelection(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("slot {date} {time} was taken")]
    Conflict { date: NaiveDate, time: TimeOfDay },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<Rejection> for FlowError {
    fn from(r: Rejection) -> Self {
        FlowError::Validation(r)
    }
}

impl From<EngineError> for FlowError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Config(e) => FlowError::Config(e),
            EngineError::Conflict { date, time } => FlowError::Conflict { date, time },
            EngineError::Stale(what) => FlowError::StaleSelection(what),
            EngineError::Storage(e) => FlowError::Storage(e),
        }
    }
}

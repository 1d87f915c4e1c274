use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::directory::BusinessDirectory;
use crate::engine::{AvailabilityEngine, BookingCommitter};
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::outbox::{Content, MessageOut, OutboundMessage};
use crate::store::{BookingStore, ConversationStateStore, StoreError};
use crate::time::Clock;

use super::input::{GlobalCommand, global_command};
use super::steps::{self, StepContext};
use super::{ConversationState, FlowError, Rejection, Transition};

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("unknown business: {0}")]
    UnknownBusiness(BusinessId),
    #[error("invalid phone number")]
    InvalidPhone,
    #[error("message text exceeds {MAX_INBOUND_TEXT_LEN} bytes")]
    TextTooLong,
}

/// Entry point for inbound customer messages.
///
/// Messages for one (business, phone) are handled one at a time. Each
/// message either moves the conversation to a new, persisted step or leaves
/// it untouched; replies go out only after the new step is saved.
pub struct Dispatcher {
    directory: Arc<dyn BusinessDirectory>,
    bookings: Arc<dyn BookingStore>,
    conversations: Arc<dyn ConversationStateStore>,
    outbox: Arc<dyn MessageOut>,
    clock: Arc<dyn Clock>,
    availability: AvailabilityEngine,
    committer: BookingCommitter,
    locks: DashMap<ConversationKey, Arc<Mutex<()>>>,
}

/// How one message ended, for the `outcome` metric label.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Advanced,
    Rejected,
    Stale,
    Conflict,
    ConfigError,
    StorageError,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Advanced => "advanced",
            Outcome::Rejected => "rejected",
            Outcome::Stale => "stale",
            Outcome::Conflict => "conflict",
            Outcome::ConfigError => "config_error",
            Outcome::StorageError => "storage_error",
        }
    }
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn BusinessDirectory>,
        bookings: Arc<dyn BookingStore>,
        conversations: Arc<dyn ConversationStateStore>,
        outbox: Arc<dyn MessageOut>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            committer: BookingCommitter::new(bookings.clone(), clock.clone()),
            directory,
            bookings,
            conversations,
            outbox,
            clock,
            availability: AvailabilityEngine::default(),
            locks: DashMap::new(),
        }
    }

    pub fn with_availability(mut self, availability: AvailabilityEngine) -> Self {
        self.availability = availability;
        self
    }

    pub async fn handle_inbound_message(
        &self,
        business_id: &BusinessId,
        phone: &str,
        text: &str,
    ) -> Result<(), InboundError> {
        let Some(business) = self.directory.business(business_id).await else {
            warn!(business = %business_id, "message for unknown business dropped");
            return Err(InboundError::UnknownBusiness(business_id.clone()));
        };
        if phone.is_empty() || phone.len() > MAX_PHONE_LEN {
            return Err(InboundError::InvalidPhone);
        }
        if text.len() > MAX_INBOUND_TEXT_LEN {
            return Err(InboundError::TextTooLong);
        }

        let key = ConversationKey::new(business_id, phone);
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let started = Instant::now();
        let (step, outcome) = {
            let _guard = lock.lock().await;
            self.handle_locked(&business, phone, text).await
        };

        // Only the map and this task still hold the lock: nobody is waiting.
        self.locks
            .remove_if(&key, |_, l| Arc::strong_count(l) == 2);
        drop(lock);

        metrics::counter!(
            observability::MESSAGES_TOTAL,
            "step" => step,
            "outcome" => outcome.label()
        )
        .increment(1);
        metrics::histogram!(observability::MESSAGE_DURATION_SECONDS, "step" => step)
            .record(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Returns the label of the step the message was handled at.
    async fn handle_locked(
        &self,
        business: &Business,
        phone: &str,
        text: &str,
    ) -> (&'static str, Outcome) {
        let mut step = "unknown";
        for attempt in 1..=MAX_SAVE_ATTEMPTS {
            let state = match self.conversations.load(&business.id, phone).await {
                Ok(Some(state)) => state,
                Ok(None) => ConversationState::new(business.id.clone(), phone, self.clock.now()),
                Err(e) => {
                    error!(business = %business.id, "loading conversation failed: {e}");
                    self.apologize(business, phone, Language::default()).await;
                    return (step, Outcome::StorageError);
                }
            };
            step = state.step.label();

            let (transition, outcome) = match self.run_step(business, phone, &state, text).await {
                Ok(transition) => (transition, Outcome::Advanced),
                Err(FlowError::Validation(rejection)) if state.version > 0 => {
                    debug!(business = %business.id, step, ?rejection, "input rejected");
                    self.reprompt(business, phone, &state, rejection).await;
                    return (step, Outcome::Rejected);
                }
                // First contact: whatever was said, greet with the language menu.
                Err(FlowError::Validation(_)) => {
                    (steps::language_select(state.language), Outcome::Advanced)
                }
                Err(FlowError::StaleSelection(what)) => {
                    debug!(business = %business.id, step, "stale selection: {what}");
                    (
                        steps::menu(state.language, Some(Content::SelectionUnavailable)),
                        Outcome::Stale,
                    )
                }
                Err(FlowError::Conflict { date, time }) => (
                    steps::menu(state.language, Some(Content::SlotTaken { date, time })),
                    Outcome::Conflict,
                ),
                Err(FlowError::Config(e)) => {
                    error!(business = %business.id, step, "business misconfigured: {e}");
                    (
                        steps::menu(state.language, Some(Content::Apology)),
                        Outcome::ConfigError,
                    )
                }
                Err(FlowError::Storage(e)) => {
                    error!(business = %business.id, step, "storage failure: {e}");
                    self.apologize(business, phone, state.language).await;
                    return (step, Outcome::StorageError);
                }
            };

            let next = ConversationState {
                language: transition.language,
                step: transition.step,
                updated_at: self.clock.now(),
                ..state
            };
            match self.conversations.upsert(next).await {
                Ok(_) => {
                    self.send_all(business, phone, transition.messages).await;
                    return (step, outcome);
                }
                Err(StoreError::VersionConflict { expected, found }) if attempt < MAX_SAVE_ATTEMPTS => {
                    debug!(business = %business.id, expected, found, attempt, "conversation changed underneath, retrying");
                    metrics::counter!(observability::CONVERSATION_SAVE_RETRIES_TOTAL).increment(1);
                }
                Err(e) => {
                    error!(business = %business.id, step, "saving conversation failed: {e}");
                    self.apologize(business, phone, transition.language).await;
                    return (step, Outcome::StorageError);
                }
            }
        }
        (step, Outcome::StorageError)
    }

    /// Global commands first, then the step handler. A panicking handler is
    /// contained to this message.
    async fn run_step(
        &self,
        business: &Business,
        phone: &str,
        state: &ConversationState,
        text: &str,
    ) -> Result<Transition, FlowError> {
        if let Some(command) = global_command(text) {
            return Ok(match command {
                GlobalCommand::Menu => steps::menu(state.language, None),
                GlobalCommand::Cancel => steps::menu(state.language, Some(Content::Cancelled)),
                GlobalCommand::Restart => steps::language_select(state.language),
            });
        }

        let ctx = self.context(business, phone);
        match AssertUnwindSafe(steps::advance(&ctx, state, text))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(business = %business.id, step = state.step.label(), "step handler panicked");
                Ok(steps::menu(state.language, Some(Content::Apology)))
            }
        }
    }

    fn context<'a>(&'a self, business: &'a Business, phone: &'a str) -> StepContext<'a> {
        StepContext {
            business,
            phone,
            now: business.local_now(self.clock.now()),
            availability: &self.availability,
            bookings: self.bookings.as_ref(),
            committer: &self.committer,
        }
    }

    async fn reprompt(
        &self,
        business: &Business,
        phone: &str,
        state: &ConversationState,
        rejection: Rejection,
    ) {
        let mut messages = vec![OutboundMessage::new(
            state.language,
            Content::Invalid { rejection },
        )];
        let ctx = self.context(business, phone);
        match steps::prompt_for(&ctx, state.language, &state.step).await {
            Ok(prompt) => messages.extend(prompt),
            Err(e) => warn!(business = %business.id, "re-prompt unavailable: {e}"),
        }
        self.send_all(business, phone, messages).await;
    }

    async fn apologize(&self, business: &Business, phone: &str, language: Language) {
        self.send_all(
            business,
            phone,
            vec![OutboundMessage::new(language, Content::Apology)],
        )
        .await;
    }

    async fn send_all(&self, business: &Business, phone: &str, messages: Vec<OutboundMessage>) {
        for message in messages {
            self.outbox.send(&business.id, phone, message).await;
        }
    }
}

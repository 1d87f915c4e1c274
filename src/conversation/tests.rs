use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;

use super::*;
use crate::directory::InMemoryDirectory;
use crate::model::fixtures::*;
use crate::outbox::{Content, Envelope, OutboxHub};
use crate::store::{BookingStore, ConversationStateStore, StoreError};
use crate::tenant::TenantManager;
use crate::time::FixedClock;

fn test_data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("chatbook_test_conversation").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Friday 2026-02-27, 12:00 UTC.
fn friday_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 27, 12, 0, 0).unwrap()
}

struct Harness {
    dispatcher: Dispatcher,
    tenants: Arc<TenantManager>,
    directory: Arc<InMemoryDirectory>,
    outbox: broadcast::Receiver<Envelope>,
    id: BusinessId,
}

impl Harness {
    fn new(name: &str, business: Business, now: DateTime<Utc>) -> Self {
        Self::with_conversations(name, business, now, |tenants| tenants)
    }

    fn with_conversations(
        name: &str,
        business: Business,
        now: DateTime<Utc>,
        wrap: impl FnOnce(Arc<TenantManager>) -> Arc<dyn ConversationStateStore>,
    ) -> Self {
        let tenants = Arc::new(TenantManager::new(test_data_dir(name), 10_000));
        let directory = Arc::new(InMemoryDirectory::new());
        let hub = Arc::new(OutboxHub::new());
        let id = business.id.clone();
        directory.upsert(business);
        let outbox = hub.subscribe(&id);
        let dispatcher = Dispatcher::new(
            directory.clone(),
            tenants.clone(),
            wrap(tenants.clone()),
            hub,
            Arc::new(FixedClock(now)),
        );
        Self {
            dispatcher,
            tenants,
            directory,
            outbox,
            id,
        }
    }

    /// Send `text` from `phone` and collect what was sent back to them.
    async fn say(&mut self, phone: &str, text: &str) -> Vec<Content> {
        self.dispatcher
            .handle_inbound_message(&self.id, phone, text)
            .await
            .unwrap();
        let mut replies = Vec::new();
        while let Ok(envelope) = self.outbox.try_recv() {
            if envelope.phone == phone {
                replies.push(envelope.message.content);
            }
        }
        replies
    }

    async fn state(&self, phone: &str) -> Option<ConversationState> {
        self.tenants.load(&self.id, phone).await.unwrap()
    }

    /// Language, menu, first service, Monday 2026-03-02, first range, up to
    /// the name prompt at `time_choice`.
    async fn walk_to_name(&mut self, phone: &str, time_choice: &str) {
        self.say(phone, "hi").await;
        self.say(phone, "1").await;
        self.say(phone, "1").await;
        self.say(phone, "1").await;
        self.say(phone, "3").await;
        self.say(phone, "1").await;
        assert_eq!(self.say(phone, time_choice).await, vec![Content::AskName]);
    }
}

#[tokio::test]
async fn full_booking_flow() {
    let mut h = Harness::new("full_flow", business("salon"), friday_noon());
    let phone = "+1555";

    assert_eq!(h.say(phone, "hi").await, vec![Content::LanguageOptions]);
    assert_eq!(h.state(phone).await.unwrap().version, 1);

    assert_eq!(h.say(phone, "1").await, vec![Content::Menu]);
    assert_eq!(h.state(phone).await.unwrap().language, Language::English);

    let replies = h.say(phone, "1").await;
    let [Content::ServiceOptions { options }] = replies.as_slice() else {
        panic!("expected services, got {replies:?}");
    };
    assert_eq!(
        options.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
        ["Service cut", "Service color"]
    );

    let replies = h.say(phone, "1").await;
    let [Content::DateOptions { dates }] = replies.as_slice() else {
        panic!("expected dates, got {replies:?}");
    };
    // Today still has afternoon slots; Sunday is closed.
    assert_eq!(
        dates,
        &[
            date(2026, 2, 27),
            date(2026, 2, 28),
            date(2026, 3, 2),
            date(2026, 3, 3),
            date(2026, 3, 4),
            date(2026, 3, 5),
            date(2026, 3, 6),
        ]
    );

    // 35 free starts on Monday are bucketed into ranges of ten.
    let replies = h.say(phone, "3").await;
    let [Content::TimeRangeOptions { date: d, ranges }] = replies.as_slice() else {
        panic!("expected ranges, got {replies:?}");
    };
    assert_eq!(*d, date(2026, 3, 2));
    assert_eq!(ranges.len(), 4);
    assert_eq!((ranges[0].from, ranges[0].to), (hm(9, 0), hm(11, 15)));
    assert_eq!((ranges[3].from, ranges[3].to), (hm(16, 30), hm(17, 30)));

    let replies = h.say(phone, "1").await;
    let [Content::TimeOptions { slots, .. }] = replies.as_slice() else {
        panic!("expected times, got {replies:?}");
    };
    assert_eq!(slots.len(), 10);

    assert_eq!(h.say(phone, "5").await, vec![Content::AskName]);
    assert_eq!(h.say(phone, "  Layla  ").await, vec![Content::AskNote]);

    let replies = h.say(phone, "skip").await;
    let [Content::BookingConfirmed { booking }, Content::Menu] = replies.as_slice() else {
        panic!("expected confirmation, got {replies:?}");
    };
    assert_eq!(booking.date, date(2026, 3, 2));
    assert_eq!(booking.time, hm(10, 0));
    assert_eq!(booking.customer_name, "Layla");
    assert_eq!(booking.service_name, "Service cut");

    let stored = h.tenants.booking(&h.id, booking.id).await.unwrap().unwrap();
    assert_eq!(stored.phone, phone);
    assert_eq!(stored.notes, "");
    assert_eq!(stored.status, BookingStatus::Confirmed);
    assert_eq!(stored.created_at, friday_noon());
    assert_eq!(h.state(phone).await.unwrap().step, Step::Menu);
}

#[tokio::test]
async fn invalid_input_leaves_state_untouched() {
    let mut h = Harness::new("invalid_input", business("salon"), friday_noon());
    let phone = "+1555";
    h.say(phone, "hi").await;
    h.say(phone, "1").await;
    h.say(phone, "1").await;
    let before = h.state(phone).await.unwrap();

    let replies = h.say(phone, "9").await;
    assert_eq!(
        replies[0],
        Content::Invalid {
            rejection: Rejection::OutOfRange { max: 2 }
        }
    );
    assert!(matches!(replies[1], Content::ServiceOptions { .. }));
    assert_eq!(h.state(phone).await.unwrap(), before);

    let replies = h.say(phone, "the blue one").await;
    assert_eq!(
        replies[0],
        Content::Invalid {
            rejection: Rejection::NotANumber
        }
    );
    assert_eq!(h.state(phone).await.unwrap(), before);
}

#[tokio::test]
async fn invalid_name_and_note_reprompt() {
    let mut h = Harness::new("invalid_name", business("salon"), friday_noon());
    let phone = "+1555";
    h.walk_to_name(phone, "5").await;
    let before = h.state(phone).await.unwrap();

    assert_eq!(
        h.say(phone, " L ").await,
        vec![
            Content::Invalid {
                rejection: Rejection::NameTooShort { min: 2 }
            },
            Content::AskName
        ]
    );
    assert_eq!(h.state(phone).await.unwrap(), before);

    h.say(phone, "Layla").await;
    let replies = h.say(phone, &"x".repeat(501)).await;
    assert_eq!(
        replies,
        vec![
            Content::Invalid {
                rejection: Rejection::NoteTooLong { max: 500 }
            },
            Content::AskNote
        ]
    );
}

#[tokio::test]
async fn global_commands_work_from_any_step() {
    let mut h = Harness::new("global_commands", business("salon"), friday_noon());
    let phone = "+1555";
    h.walk_to_name(phone, "5").await;

    assert_eq!(
        h.say(phone, "Cancel").await,
        vec![Content::Cancelled, Content::Menu]
    );
    assert_eq!(h.state(phone).await.unwrap().step, Step::Menu);

    h.say(phone, "1").await;
    assert_eq!(h.say(phone, "menu").await, vec![Content::Menu]);

    assert_eq!(h.say(phone, "restart").await, vec![Content::LanguageOptions]);
    assert_eq!(h.state(phone).await.unwrap().step, Step::LanguageSelect);
}

#[tokio::test]
async fn arabic_digits_and_language() {
    let mut h = Harness::new("arabic", business("salon"), friday_noon());
    let phone = "+966500000000";
    h.say(phone, "مرحبا").await;

    assert_eq!(h.say(phone, "٢").await, vec![Content::Menu]);
    let state = h.state(phone).await.unwrap();
    assert_eq!(state.language, Language::Arabic);

    h.dispatcher
        .handle_inbound_message(&h.id, phone, "١")
        .await
        .unwrap();
    let envelope = h.outbox.try_recv().unwrap();
    assert_eq!(envelope.message.language, Language::Arabic);
    let Content::ServiceOptions { options } = envelope.message.content else {
        panic!("expected services");
    };
    assert_eq!(options[0].name, "خدمة cut");
}

#[tokio::test]
async fn stale_service_returns_to_menu() {
    let mut h = Harness::new("stale_service", business("salon"), friday_noon());
    let phone = "+1555";
    h.say(phone, "hi").await;
    h.say(phone, "1").await;
    h.say(phone, "1").await;

    let mut edited = business("salon");
    edited.services[0].is_active = false;
    h.directory.upsert(edited);

    assert_eq!(
        h.say(phone, "1").await,
        vec![Content::SelectionUnavailable, Content::Menu]
    );
    assert_eq!(h.state(phone).await.unwrap().step, Step::Menu);

    // The menu now offers only the remaining service.
    let replies = h.say(phone, "1").await;
    let [Content::ServiceOptions { options }] = replies.as_slice() else {
        panic!("expected services, got {replies:?}");
    };
    assert_eq!(options.len(), 1);
    assert_eq!(options[0].id, "color");
}

#[tokio::test]
async fn slot_taken_between_listing_and_commit() {
    let mut h = Harness::new("slot_taken", business("salon"), friday_noon());
    let (first, second) = ("+1111", "+2222");

    h.walk_to_name(first, "5").await;
    h.walk_to_name(second, "5").await;
    h.say(first, "Amal").await;
    h.say(second, "Basma").await;

    let replies = h.say(first, "-").await;
    assert!(matches!(replies[0], Content::BookingConfirmed { .. }));

    let replies = h.say(second, "no").await;
    assert_eq!(
        replies[0],
        Content::SlotTaken {
            date: date(2026, 3, 2),
            time: hm(10, 0)
        }
    );
    // 09:45, 10:00 and 10:15 are gone; 32 starts remain.
    let Content::TimeRangeOptions { ranges, .. } = &replies[1] else {
        panic!("expected fresh ranges, got {replies:?}");
    };
    assert_eq!(ranges.len(), 4);
    let state = h.state(second).await.unwrap();
    assert!(matches!(state.step, Step::SelectTimeRange { date: d, .. } if d == date(2026, 3, 2)));

    let active = h
        .tenants
        .find(&h.id, date(2026, 3, 2), &BookingStatus::ACTIVE)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].phone, first);
}

#[tokio::test]
async fn reschedule_flow() {
    let mut h = Harness::new("reschedule", business("salon"), friday_noon());
    let phone = "+1555";

    assert_eq!(h.say(phone, "hi").await, vec![Content::LanguageOptions]);
    h.say(phone, "1").await;
    assert_eq!(
        h.say(phone, "2").await,
        vec![Content::NoAppointments, Content::Menu]
    );

    h.say(phone, "1").await;
    h.say(phone, "1").await;
    h.say(phone, "3").await;
    h.say(phone, "1").await;
    h.say(phone, "5").await;
    h.say(phone, "Layla").await;
    let replies = h.say(phone, "skip").await;
    let Content::BookingConfirmed { booking } = &replies[0] else {
        panic!("expected confirmation, got {replies:?}");
    };
    let id = booking.id;

    let replies = h.say(phone, "2").await;
    let [Content::AppointmentOptions { options }] = replies.as_slice() else {
        panic!("expected appointments, got {replies:?}");
    };
    assert_eq!(options.len(), 1);
    assert_eq!(options[0].id, id);

    assert!(matches!(h.say(phone, "1").await[0], Content::DateOptions { .. }));
    // Same Monday: the booking's own 10:00 does not block 10:15.
    let replies = h.say(phone, "3").await;
    let Content::TimeRangeOptions { ranges, .. } = &replies[0] else {
        panic!("expected ranges, got {replies:?}");
    };
    assert_eq!(ranges.len(), 4);
    h.say(phone, "1").await;
    let replies = h.say(phone, "6").await;
    let [Content::BookingRescheduled { booking }, Content::Menu] = replies.as_slice() else {
        panic!("expected reschedule confirmation, got {replies:?}");
    };
    assert_eq!(booking.id, id);
    assert_eq!(booking.time, hm(10, 15));

    let stored = h.tenants.booking(&h.id, id).await.unwrap().unwrap();
    assert_eq!((stored.date, stored.time), (date(2026, 3, 2), hm(10, 15)));
}

#[tokio::test]
async fn today_dropped_after_last_slot() {
    let evening = Utc.with_ymd_and_hms(2026, 2, 27, 17, 45, 0).unwrap();
    let mut h = Harness::new("today_filter", business("salon"), evening);
    let phone = "+1555";
    h.say(phone, "hi").await;
    h.say(phone, "1").await;
    h.say(phone, "1").await;

    let replies = h.say(phone, "1").await;
    let [Content::DateOptions { dates }] = replies.as_slice() else {
        panic!("expected dates, got {replies:?}");
    };
    assert_eq!(dates[0], date(2026, 2, 28));
}

#[tokio::test]
async fn typed_dates_are_validated() {
    let mut h = Harness::new("typed_dates", business("salon"), friday_noon());
    let phone = "+1555";
    h.say(phone, "hi").await;
    h.say(phone, "1").await;
    h.say(phone, "1").await;
    h.say(phone, "1").await;

    assert_eq!(h.say(phone, "8").await, vec![Content::AskDate]);

    let cases = [
        ("2026-03-08", Rejection::NotWorkingDay),
        ("2026-02-20", Rejection::DateInPast),
        (
            "01/01/2027",
            Rejection::BeyondHorizon {
                last: date(2026, 4, 28),
            },
        ),
        ("soon", Rejection::DateFormat),
    ];
    for (text, rejection) in cases {
        assert_eq!(
            h.say(phone, text).await,
            vec![Content::Invalid { rejection }, Content::AskDate],
            "{text}"
        );
    }

    let replies = h.say(phone, "٣/٣").await;
    assert!(matches!(
        replies[0],
        Content::TimeRangeOptions { date: d, .. } if d == date(2026, 3, 3)
    ));
}

#[tokio::test]
async fn misconfigured_business_gets_apology() {
    let mut b = business("salon");
    b.hours.opening_time = hm(18, 0);
    b.hours.closing_time = hm(9, 0);
    let mut h = Harness::new("config_error", b, friday_noon());
    let phone = "+1555";
    h.say(phone, "hi").await;
    h.say(phone, "1").await;
    h.say(phone, "1").await;

    assert_eq!(
        h.say(phone, "1").await,
        vec![Content::Apology, Content::Menu]
    );
    assert_eq!(h.state(phone).await.unwrap().step, Step::Menu);
}

#[tokio::test]
async fn unknown_business_rejected() {
    let h = Harness::new("unknown_business", business("salon"), friday_noon());
    assert!(matches!(
        h.dispatcher
            .handle_inbound_message(&BusinessId::from("elsewhere"), "+1555", "hi")
            .await,
        Err(dispatcher::InboundError::UnknownBusiness(_))
    ));
}

/// Saves a competing write right before the first upsert goes through.
struct RacingWriter {
    inner: Arc<TenantManager>,
    armed: AtomicBool,
}

#[async_trait]
impl ConversationStateStore for RacingWriter {
    async fn load(
        &self,
        business_id: &BusinessId,
        phone: &str,
    ) -> Result<Option<ConversationState>, StoreError> {
        self.inner.load(business_id, phone).await
    }

    async fn upsert(&self, state: ConversationState) -> Result<ConversationState, StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let mut other = state.clone();
            other.step = Step::Menu;
            self.inner.upsert(other).await?;
        }
        self.inner.upsert(state).await
    }
}

#[tokio::test]
async fn version_conflict_reruns_message() {
    let mut h = Harness::with_conversations(
        "version_conflict",
        business("salon"),
        friday_noon(),
        |tenants| {
            Arc::new(RacingWriter {
                inner: tenants,
                armed: AtomicBool::new(true),
            })
        },
    );
    let phone = "+1555";

    // The competing write lands at Menu; the retry handles "hi" there.
    let replies = h.say(phone, "hi").await;
    assert_eq!(
        replies,
        vec![
            Content::Invalid {
                rejection: Rejection::NotANumber
            },
            Content::Menu
        ]
    );
    let state = h.state(phone).await.unwrap();
    assert_eq!(state.step, Step::Menu);
    assert_eq!(state.version, 1);
}

struct BrokenWrites;

#[async_trait]
impl ConversationStateStore for BrokenWrites {
    async fn load(&self, _: &BusinessId, _: &str) -> Result<Option<ConversationState>, StoreError> {
        Ok(None)
    }

    async fn upsert(&self, _: ConversationState) -> Result<ConversationState, StoreError> {
        Err(StoreError::Wal("disk full".into()))
    }
}

#[tokio::test]
async fn storage_failure_apologises_without_advancing() {
    let mut h = Harness::with_conversations(
        "storage_failure",
        business("salon"),
        friday_noon(),
        |_| Arc::new(BrokenWrites),
    );
    assert_eq!(h.say("+1555", "1").await, vec![Content::Apology]);
    assert!(h.state("+1555").await.is_none());
}

/// Fails the next save that would move the conversation back to the menu.
struct FailMenuSave {
    inner: Arc<TenantManager>,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl ConversationStateStore for FailMenuSave {
    async fn load(
        &self,
        business_id: &BusinessId,
        phone: &str,
    ) -> Result<Option<ConversationState>, StoreError> {
        self.inner.load(business_id, phone).await
    }

    async fn upsert(&self, state: ConversationState) -> Result<ConversationState, StoreError> {
        if state.step == Step::Menu && self.armed.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Wal("disk full".into()));
        }
        self.inner.upsert(state).await
    }
}

#[tokio::test]
async fn note_resent_after_failed_save_confirms_same_booking() {
    let armed = Arc::new(AtomicBool::new(false));
    let flag = armed.clone();
    let mut h = Harness::with_conversations(
        "commit_then_save_fails",
        business("salon"),
        friday_noon(),
        move |tenants| Arc::new(FailMenuSave { inner: tenants, armed: flag }),
    );
    let phone = "+1555";
    h.walk_to_name(phone, "5").await;
    h.say(phone, "Layla").await;
    let Step::EnterNote { booking_id, .. } = h.state(phone).await.unwrap().step else {
        panic!("expected note step");
    };

    armed.store(true, Ordering::SeqCst);
    assert_eq!(h.say(phone, "skip").await, vec![Content::Apology]);
    assert_eq!(h.state(phone).await.unwrap().step.label(), "enter_note");

    let replies = h.say(phone, "skip").await;
    let [Content::BookingConfirmed { booking }, Content::Menu] = replies.as_slice() else {
        panic!("expected confirmation, got {replies:?}");
    };
    assert_eq!(booking.id, booking_id);
    assert_eq!(booking.time, hm(10, 0));

    let active = h
        .tenants
        .find(&h.id, date(2026, 3, 2), &BookingStatus::ACTIVE)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, booking_id);
    assert_eq!(h.state(phone).await.unwrap().step, Step::Menu);
}

impl Harness {
    /// `text` is out of range at the current step: the reply is `Invalid`
    /// followed by the step's prompt, and nothing is saved.
    async fn rejected(&mut self, phone: &str, text: &str, max: usize) -> Content {
        let before = self.state(phone).await.unwrap();
        let mut replies = self.say(phone, text).await;
        assert_eq!(replies.len(), 2, "{replies:?}");
        assert_eq!(
            replies[0],
            Content::Invalid {
                rejection: Rejection::OutOfRange { max }
            }
        );
        assert_eq!(self.state(phone).await.unwrap(), before);
        replies.remove(1)
    }
}

#[tokio::test]
async fn out_of_range_rejected_at_every_selection_step() {
    let mut h = Harness::new("out_of_range_steps", business("salon"), friday_noon());
    let phone = "+1555";
    h.say(phone, "hi").await;
    h.say(phone, "1").await;

    assert_eq!(h.rejected(phone, "4", 3).await, Content::Menu);

    h.say(phone, "1").await;
    h.say(phone, "1").await;
    // Seven dates plus the typed-date option.
    let prompt = h.rejected(phone, "9", 8).await;
    assert!(matches!(prompt, Content::DateOptions { dates } if dates.len() == 7));

    h.say(phone, "3").await;
    let prompt = h.rejected(phone, "5", 4).await;
    assert!(matches!(prompt, Content::TimeRangeOptions { ranges, .. } if ranges.len() == 4));

    h.say(phone, "1").await;
    let prompt = h.rejected(phone, "11", 10).await;
    assert!(matches!(prompt, Content::TimeOptions { slots, .. } if slots.len() == 10));

    h.say(phone, "5").await;
    h.say(phone, "Layla").await;
    h.say(phone, "skip").await;
    assert!(matches!(
        h.say(phone, "2").await.as_slice(),
        [Content::AppointmentOptions { .. }]
    ));
    let prompt = h.rejected(phone, "2", 1).await;
    assert!(matches!(prompt, Content::AppointmentOptions { options } if options.len() == 1));
}

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::engine::{AvailabilityEngine, BookingCommitter, BookingRequest, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::outbox::{BookingSummary, Content, OutboundMessage, ServiceOption, TimeRange};
use crate::store::BookingStore;
use crate::time::{LocalInstant, TimeOfDay};

use super::input::{is_skip, parse_date, parse_language, parse_selection};
use super::{ConversationState, Draft, FlowError, Rejection, Step, Transition};

/// Collaborators and inputs shared by every step handler for one message.
pub(super) struct StepContext<'a> {
    pub business: &'a Business,
    pub phone: &'a str,
    pub now: LocalInstant,
    pub availability: &'a AvailabilityEngine,
    pub bookings: &'a dyn BookingStore,
    pub committer: &'a BookingCommitter,
}

fn reply(language: Language, step: Step, contents: Vec<Content>) -> Transition {
    Transition {
        language,
        step,
        messages: contents
            .into_iter()
            .map(|c| OutboundMessage::new(language, c))
            .collect(),
    }
}

pub(super) fn menu(language: Language, lead: Option<Content>) -> Transition {
    let mut contents: Vec<Content> = lead.into_iter().collect();
    contents.push(Content::Menu);
    reply(language, Step::Menu, contents)
}

pub(super) fn language_select(language: Language) -> Transition {
    reply(language, Step::LanguageSelect, vec![Content::LanguageOptions])
}

/// Handle `text` at the conversation's current step.
pub(super) async fn advance(
    ctx: &StepContext<'_>,
    state: &ConversationState,
    text: &str,
) -> Result<Transition, FlowError> {
    let language = state.language;
    match &state.step {
        Step::LanguageSelect => match parse_language(text) {
            Some(chosen) => Ok(menu(chosen, None)),
            None => Err(parse_selection(text, 2).err().unwrap_or(Rejection::NotANumber).into()),
        },

        Step::Menu => match parse_selection(text, 3)? {
            0 => start_booking(ctx, language),
            1 => start_reschedule(ctx, language).await,
            _ => Ok(language_select(language)),
        },

        Step::SelectService { service_ids } => {
            let id = &service_ids[parse_selection(text, service_ids.len())?];
            let service = ctx
                .business
                .service(id)
                .filter(|s| s.is_bookable())
                .ok_or_else(|| FlowError::StaleSelection(format!("service {id}")))?;
            let draft = Draft {
                service_id: service.id.clone(),
                service: service.snapshot(),
                rescheduling: None,
            };
            date_list(ctx, language, draft).await
        }

        Step::SelectDateList { draft, dates } => {
            let idx = parse_selection(text, dates.len() + 1)?;
            match dates.get(idx) {
                Some(date) => {
                    check_date(ctx.business, ctx.now, *date)?;
                    times_for(ctx, language, draft.clone(), *date).await
                }
                None => Ok(reply(
                    language,
                    Step::SelectDate {
                        draft: draft.clone(),
                    },
                    vec![Content::AskDate],
                )),
            }
        }

        Step::SelectDate { draft } => {
            let date = parse_date(text, ctx.now.date)?;
            check_date(ctx.business, ctx.now, date)?;
            times_for(ctx, language, draft.clone(), date).await
        }

        Step::SelectTimeRange {
            draft,
            date,
            ranges,
        } => {
            let slots = ranges[parse_selection(text, ranges.len())?].clone();
            Ok(reply(
                language,
                Step::SelectTime {
                    draft: draft.clone(),
                    date: *date,
                    slots: slots.clone(),
                },
                vec![Content::TimeOptions { date: *date, slots }],
            ))
        }

        Step::SelectTime { draft, date, slots } => {
            let time = slots[parse_selection(text, slots.len())?];
            match draft.rescheduling {
                Some(id) => reschedule(ctx, language, draft, id, *date, time).await,
                None => Ok(reply(
                    language,
                    Step::EnterName {
                        draft: draft.clone(),
                        date: *date,
                        time,
                    },
                    vec![Content::AskName],
                )),
            }
        }

        Step::EnterName { draft, date, time } => {
            let name = text.trim();
            let chars = name.chars().count();
            if chars < MIN_NAME_CHARS {
                return Err(Rejection::NameTooShort {
                    min: MIN_NAME_CHARS,
                }
                .into());
            }
            if chars > MAX_NAME_CHARS {
                return Err(Rejection::NameTooLong {
                    max: MAX_NAME_CHARS,
                }
                .into());
            }
            Ok(reply(
                language,
                Step::EnterNote {
                    draft: draft.clone(),
                    date: *date,
                    time: *time,
                    customer_name: name.to_string(),
                    booking_id: BookingId::new(),
                },
                vec![Content::AskNote],
            ))
        }

        Step::EnterNote {
            draft,
            date,
            time,
            customer_name,
            booking_id,
        } => {
            let notes = if is_skip(text) { "" } else { text.trim() };
            if notes.chars().count() > MAX_NOTE_CHARS {
                return Err(Rejection::NoteTooLong {
                    max: MAX_NOTE_CHARS,
                }
                .into());
            }
            let request = BookingRequest {
                id: *booking_id,
                phone: ctx.phone.to_string(),
                customer_name: customer_name.clone(),
                notes: notes.to_string(),
                service_id: draft.service_id.clone(),
                snapshot: draft.service.clone(),
                date: *date,
                time: *time,
                source: BookingSource::Whatsapp,
            };
            match ctx.committer.commit(ctx.business, request).await {
                Ok(booking) => Ok(menu(
                    language,
                    Some(Content::BookingConfirmed {
                        booking: BookingSummary::of(&booking, language),
                    }),
                )),
                Err(EngineError::Conflict { date, time }) => {
                    slot_taken(ctx, language, draft.clone(), date, time).await
                }
                Err(e) => Err(e.into()),
            }
        }

        Step::RescheduleSelectAppointment { booking_ids } => {
            let id = booking_ids[parse_selection(text, booking_ids.len())?];
            let booking = ctx
                .bookings
                .booking(&ctx.business.id, id)
                .await?
                .filter(|b| is_upcoming(b, ctx.phone, ctx.now))
                .ok_or_else(|| FlowError::StaleSelection(format!("booking {id}")))?;
            let draft = Draft {
                service_id: booking.service_id,
                service: booking.service,
                rescheduling: Some(id),
            };
            date_list(ctx, language, draft).await
        }
    }
}

/// The prompt that belongs to `step`, rebuilt from the step's stored lists.
pub(super) async fn prompt_for(
    ctx: &StepContext<'_>,
    language: Language,
    step: &Step,
) -> Result<Vec<OutboundMessage>, FlowError> {
    let content = match step {
        Step::LanguageSelect => Content::LanguageOptions,
        Step::Menu => Content::Menu,
        Step::SelectService { service_ids } => Content::ServiceOptions {
            options: service_ids
                .iter()
                .map(|id| match ctx.business.service(id) {
                    Some(s) => ServiceOption::of(s, language),
                    // Removed since the list was sent; picking it is a stale selection.
                    None => ServiceOption {
                        id: id.clone(),
                        name: id.clone(),
                        price: Decimal::ZERO,
                        duration: 0,
                    },
                })
                .collect(),
        },
        Step::SelectDateList { dates, .. } => Content::DateOptions {
            dates: dates.clone(),
        },
        Step::SelectDate { .. } => Content::AskDate,
        Step::SelectTimeRange { date, ranges, .. } => Content::TimeRangeOptions {
            date: *date,
            ranges: summarize_ranges(ranges),
        },
        Step::SelectTime { date, slots, .. } => Content::TimeOptions {
            date: *date,
            slots: slots.clone(),
        },
        Step::EnterName { .. } => Content::AskName,
        Step::EnterNote { .. } => Content::AskNote,
        Step::RescheduleSelectAppointment { booking_ids } => {
            let mut options = Vec::with_capacity(booking_ids.len());
            for id in booking_ids {
                if let Some(b) = ctx.bookings.booking(&ctx.business.id, *id).await? {
                    options.push(BookingSummary::of(&b, language));
                }
            }
            Content::AppointmentOptions { options }
        }
    };
    Ok(vec![OutboundMessage::new(language, content)])
}

fn start_booking(ctx: &StepContext<'_>, language: Language) -> Result<Transition, FlowError> {
    let services: Vec<&Service> = ctx.business.bookable_services().collect();
    if services.is_empty() {
        return Ok(menu(language, Some(Content::NoServices)));
    }
    Ok(reply(
        language,
        Step::SelectService {
            service_ids: services.iter().map(|s| s.id.clone()).collect(),
        },
        vec![Content::ServiceOptions {
            options: services
                .iter()
                .map(|s| ServiceOption::of(s, language))
                .collect(),
        }],
    ))
}

fn is_upcoming(booking: &Booking, phone: &str, now: LocalInstant) -> bool {
    booking.phone == phone && booking.is_active() && !now.has_passed(booking.date, booking.time)
}

async fn start_reschedule(
    ctx: &StepContext<'_>,
    language: Language,
) -> Result<Transition, FlowError> {
    let upcoming: Vec<Booking> = ctx
        .bookings
        .find_for_customer(&ctx.business.id, ctx.phone, ctx.now.date)
        .await?
        .into_iter()
        .filter(|b| is_upcoming(b, ctx.phone, ctx.now))
        .collect();
    if upcoming.is_empty() {
        return Ok(menu(language, Some(Content::NoAppointments)));
    }
    Ok(reply(
        language,
        Step::RescheduleSelectAppointment {
            booking_ids: upcoming.iter().map(|b| b.id).collect(),
        },
        vec![Content::AppointmentOptions {
            options: upcoming
                .iter()
                .map(|b| BookingSummary::of(b, language))
                .collect(),
        }],
    ))
}

/// Open dates inside the horizon with at least one free slot, soonest first.
async fn upcoming_dates(ctx: &StepContext<'_>, draft: &Draft) -> Result<Vec<NaiveDate>, FlowError> {
    let last = ctx.business.horizon_end(ctx.now.date);
    let mut dates = Vec::with_capacity(DATE_LIST_DAYS);
    for date in ctx.now.date.iter_days().take_while(|d| *d <= last) {
        if dates.len() == DATE_LIST_DAYS {
            break;
        }
        if ctx.business.is_open_on(date) && !free_slots(ctx, draft, date).await?.is_empty() {
            dates.push(date);
        }
    }
    Ok(dates)
}

async fn date_list(
    ctx: &StepContext<'_>,
    language: Language,
    draft: Draft,
) -> Result<Transition, FlowError> {
    let dates = upcoming_dates(ctx, &draft).await?;
    if dates.is_empty() {
        return Ok(menu(language, Some(Content::NoUpcomingDates)));
    }
    Ok(reply(
        language,
        Step::SelectDateList {
            draft,
            dates: dates.clone(),
        },
        vec![Content::DateOptions { dates }],
    ))
}

fn check_date(business: &Business, now: LocalInstant, date: NaiveDate) -> Result<(), Rejection> {
    use chrono::Datelike;

    if date < now.date {
        return Err(Rejection::DateInPast);
    }
    let last = business.horizon_end(now.date);
    if date > last {
        return Err(Rejection::BeyondHorizon { last });
    }
    if !business.is_working_day(date.weekday()) {
        return Err(Rejection::NotWorkingDay);
    }
    if business.closed_dates.contains(&date) {
        return Err(Rejection::ClosedDate);
    }
    Ok(())
}

/// Free start times for the draft's service. A booking being rescheduled
/// does not block its own move.
async fn free_slots(
    ctx: &StepContext<'_>,
    draft: &Draft,
    date: NaiveDate,
) -> Result<Vec<TimeOfDay>, FlowError> {
    let started = std::time::Instant::now();
    let duration = draft.service.duration;
    let slots = match draft.rescheduling {
        None => {
            ctx.availability
                .free_slots(ctx.bookings, ctx.business, duration, date, ctx.now)
                .await?
        }
        Some(moving) => {
            let mut day = ctx
                .bookings
                .find(&ctx.business.id, date, &BookingStatus::ACTIVE)
                .await?;
            day.retain(|b| b.id != moving);
            ctx.availability
                .free_slots_in(ctx.business, duration, date, &day, ctx.now)?
        }
    };
    let policy = match ctx.business.slot_policy {
        SlotPolicy::Grid => "grid",
        SlotPolicy::Smart => "smart",
    };
    metrics::histogram!(crate::observability::AVAILABILITY_DURATION_SECONDS, "policy" => policy)
        .record(started.elapsed().as_secs_f64());
    Ok(slots)
}

/// Offer the free times on `date`, bucketed into ranges when there are many.
async fn times_for(
    ctx: &StepContext<'_>,
    language: Language,
    draft: Draft,
    date: NaiveDate,
) -> Result<Transition, FlowError> {
    let slots = free_slots(ctx, &draft, date).await?;
    if slots.is_empty() {
        return Err(Rejection::NoFreeSlots.into());
    }
    if slots.len() <= TIME_LIST_MAX {
        return Ok(reply(
            language,
            Step::SelectTime {
                draft,
                date,
                slots: slots.clone(),
            },
            vec![Content::TimeOptions { date, slots }],
        ));
    }
    let ranges: Vec<Vec<TimeOfDay>> = slots.chunks(TIME_LIST_MAX).map(<[_]>::to_vec).collect();
    let summary = summarize_ranges(&ranges);
    Ok(reply(
        language,
        Step::SelectTimeRange {
            draft,
            date,
            ranges,
        },
        vec![Content::TimeRangeOptions {
            date,
            ranges: summary,
        }],
    ))
}

fn summarize_ranges(ranges: &[Vec<TimeOfDay>]) -> Vec<TimeRange> {
    ranges
        .iter()
        .filter_map(|r| {
            Some(TimeRange {
                from: *r.first()?,
                to: *r.last()?,
            })
        })
        .collect()
}

/// The slot went to someone else between listing and commit: say so and
/// offer fresh times on the same date, or fresh dates if the day is full.
async fn slot_taken(
    ctx: &StepContext<'_>,
    language: Language,
    draft: Draft,
    date: NaiveDate,
    time: TimeOfDay,
) -> Result<Transition, FlowError> {
    let taken = OutboundMessage::new(language, Content::SlotTaken { date, time });
    let next = match check_date(ctx.business, ctx.now, date) {
        Ok(()) => match times_for(ctx, language, draft.clone(), date).await {
            Err(FlowError::Validation(Rejection::NoFreeSlots)) => {
                date_list(ctx, language, draft).await.map(|mut t| {
                    t.messages
                        .insert(0, OutboundMessage::new(language, Content::NoSlots { date }));
                    t
                })
            }
            other => other,
        },
        Err(_) => date_list(ctx, language, draft).await,
    };
    next.map(|mut t| {
        t.messages.insert(0, taken);
        t
    })
}

async fn reschedule(
    ctx: &StepContext<'_>,
    language: Language,
    draft: &Draft,
    id: BookingId,
    date: NaiveDate,
    time: TimeOfDay,
) -> Result<Transition, FlowError> {
    match ctx
        .committer
        .reschedule(ctx.business, ctx.phone, id, date, time)
        .await
    {
        Ok(booking) => Ok(menu(
            language,
            Some(Content::BookingRescheduled {
                booking: BookingSummary::of(&booking, language),
            }),
        )),
        Err(EngineError::Conflict { date, time }) => {
            slot_taken(ctx, language, draft.clone(), date, time).await
        }
        Err(e) => Err(e.into()),
    }
}

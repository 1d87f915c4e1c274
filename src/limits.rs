use crate::time::Minutes;

// ── Availability ─────────────────────────────────────────────

/// Floor for a business's slot granularity. Smaller values are clamped.
pub const MIN_SLOT_GAP_MINUTES: Minutes = 5;

/// Smart scan offset step, independent of the business slot gap.
pub const SMART_SCAN_STEP_MINUTES: Minutes = 10;

/// Smart scan rejects idle gaps strictly between 0 and this before a booking.
pub const SMART_MIN_GAP_MINUTES: Minutes = 20;

// ── Conversation ─────────────────────────────────────────────

/// Max rows in one time list before slots are bucketed into ranges.
pub const TIME_LIST_MAX: usize = 10;

/// Number of upcoming open dates offered in the date list.
pub const DATE_LIST_DAYS: usize = 7;

pub const DEFAULT_BOOKING_HORIZON_DAYS: u32 = 60;

pub const MIN_NAME_CHARS: usize = 2;
pub const MAX_NAME_CHARS: usize = 100;
pub const MAX_NOTE_CHARS: usize = 500;
pub const MAX_INBOUND_TEXT_LEN: usize = 4096;

/// Re-runs of one inbound message after an optimistic version conflict.
pub const MAX_SAVE_ATTEMPTS: usize = 3;

// ── Storage ──────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 10_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_BOOKINGS_PER_DAY: usize = 2_000;
pub const MAX_PHONE_LEN: usize = 32;

// ── Wire ─────────────────────────────────────────────────────

pub const MAX_LINE_LEN: usize = 16 * 1024;

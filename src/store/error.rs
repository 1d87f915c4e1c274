use crate::model::BookingId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("overlaps existing booking: {0}")]
    Overlap(BookingId),
    #[error("booking id {0} already used for another booking")]
    DuplicateId(BookingId),
    #[error("booking not found: {0}")]
    NotFound(BookingId),
    #[error("booking {0} is cancelled")]
    Inactive(BookingId),
    #[error("conversation version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
    #[error("wrong tenant: store holds {expected}, got {got}")]
    WrongTenant { expected: String, got: String },
    #[error("tenant error: {0}")]
    Tenant(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

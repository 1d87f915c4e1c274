use chrono::NaiveDate;

use crate::store::StoreError;
use crate::time::TimeOfDay;

/// Business operating-hours misconfiguration. Not recoverable by the customer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("opening time {opening} is not before closing time {closing}")]
    InvertedHours {
        opening: TimeOfDay,
        closing: TimeOfDay,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("slot {date} {time} is no longer available")]
    Conflict { date: NaiveDate, time: TimeOfDay },
    #[error("stale selection: {0}")]
    Stale(String),
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::Storage(err)
    }
}

mod availability;
mod commit;
mod error;
mod grid;
mod occupancy;

pub use availability::{AvailabilityEngine, SmartScan};
pub use commit::{BookingCommitter, BookingRequest};
pub use error::{ConfigError, EngineError};
pub use grid::build_grid;
pub use occupancy::{OccupancyIndex, merge_overlapping, subtract_intervals};

pub mod compactor;
pub mod config;
pub mod conversation;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod outbox;
pub mod store;
pub mod tenant;
pub mod time;
pub mod wal;
pub mod wire;

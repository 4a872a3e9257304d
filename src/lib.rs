pub mod clock;
pub mod config;
pub mod engine;
pub mod ingest;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod scheduler;
pub mod wal;

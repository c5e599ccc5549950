pub mod error;
pub mod executor;
pub mod idempotency;
pub mod records;

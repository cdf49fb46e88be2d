//! Metering and quota enforcement for a multi-tenant proxy subscription service.
//!
//! Traffic deltas reported by proxy nodes are buffered in a fast store and
//! folded into durable hourly rows; quota checks combine cached plan limits
//! with current-period usage; periodic maintenance runs on the scheduler.

pub mod aggregator;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod durable;
pub mod error;
pub mod fast_store;
pub mod jobs;
pub mod metadata_cache;
pub mod observability;
pub mod online;
pub mod quota;
pub mod scheduler;
pub mod traffic;

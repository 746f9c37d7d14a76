//! Service configuration and run-state persistence

pub mod counters;
pub mod directives;
pub mod providers;
pub mod record_types;
pub mod schedules;
pub mod services;

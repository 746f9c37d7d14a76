//! # recflow common library
//!
//! Shared code for the recflow record processing system:
//! - Record model and lineage-aware repository
//! - Database initialization and lock retry
//! - Configuration loading
//! - Service events
//! - Search index boundary

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod index;
pub mod models;
pub mod repo;
pub mod time;

pub use error::{Error, Result};
pub use models::{Record, RecordStatus, ServiceStatus};
pub use repo::{Batch, RecordFilter, Repository};

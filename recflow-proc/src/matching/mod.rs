//! Field matching and duplicate detection

pub mod engine;
pub mod match_set;
pub mod matcher;
pub mod normalizers;
pub mod parsed;
pub mod rules;
pub mod store;

pub use engine::MatchEngine;
pub use match_set::MatchSet;
pub use matcher::{FieldMatcher, KeyedFieldMatcher};
pub use parsed::ParsedRecord;
pub use rules::MatchRule;
pub use store::MatchPointStore;

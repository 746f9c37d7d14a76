//! Shared helpers for recflow-common integration tests

pub mod db_utils;

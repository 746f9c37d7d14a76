//! Shared helpers for recflow-proc integration tests

#![allow(dead_code)]

pub mod db_utils;
pub mod services;

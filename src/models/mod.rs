//! Data models for the tenant file drive.
//!
//! These types describe what callers see: folder listings, upload outcomes
//! and catalogued upload history. They serialize naturally as JSON via
//! `serde`; the history record also maps to its table via `sqlx::FromRow`.

pub mod entry;
pub mod history;
pub mod upload;

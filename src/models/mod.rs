//! Core data models for the image cache.
//!
//! These records mirror the three metadata tables. Row conversion lives in
//! `metadata::repo`, so the models stay plain `serde` types that the HTTP
//! layer can return as JSON.

pub mod gc_log;
pub mod image;
pub mod statistic;

//! Image cache for a static-resource service.
//!
//! Blobs live on disk under `<root>/<year>/<month>/<guid>.<format>`; their
//! metadata, the garbage-collection log and daily counters live in a
//! relational store (embedded SQLite or client/server MySQL).

pub mod config;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

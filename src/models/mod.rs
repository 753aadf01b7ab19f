//! Core data models for the project registry.
//!
//! Entities map to database tables via `sqlx::FromRow` and serialize as JSON
//! via `serde`.

pub mod project;

//! Storage and registry services.

pub mod blob_store;
pub mod identifier;
pub mod project_registry;
pub mod project_store;

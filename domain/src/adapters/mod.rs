//! In-memory adapters that live inside the domain crate for convenience.
//!
//! Used by unit tests and by the api-server when no real store or CRM is
//! configured. Real adapters (SQLite, Dataverse) live in separate crates.

pub mod memory_crm;
pub mod memory_repo;

//! Comanda Storage - Database access for the automation pipeline
//!
//! Typed models, repository traits with PostgreSQL implementations,
//! and an in-memory store implementing the same traits.

pub mod db;
#[cfg(any(test, feature = "test-util"))]
pub mod fixtures;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;

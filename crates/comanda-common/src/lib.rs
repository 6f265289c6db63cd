//! Comanda Common - Shared types and utilities
//!
//! This crate provides configuration, the shared error type and identifier
//! aliases used across all Comanda components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};

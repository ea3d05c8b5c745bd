//! Token Cache Types
//!
//! Configuration, token endpoint responses and persisted records.

pub mod config;
pub mod token;

pub use config::*;
pub use token::*;

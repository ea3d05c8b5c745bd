//! Builders
//!
//! Fluent builders for configuration.

pub mod config;

pub use config::{token_cache_config, TokenCacheConfigBuilder};

//! Token Management
//!
//! Cached token lifecycle: lookup, coordinated refresh, invalidation and
//! cleanup on top of a [`crate::storage::StorageAdapter`].

pub mod manager;

pub use manager::{
    create_mock_token_manager, create_token_manager, DefaultTokenManager, MockTokenManager,
    ReqwestTokenManager, TokenManager,
};

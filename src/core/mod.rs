//! Token Cache Core Components
//!
//! Scope handling, record encryption and the HTTP transport.

pub mod encryption;
pub mod scope;
pub mod transport;

pub use encryption::{EncryptedEnvelope, ALGORITHM, ENVELOPE_VERSION};
pub use scope::*;
pub use transport::*;

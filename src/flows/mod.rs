//! OAuth2 Flows
//!
//! Only the client credentials grant (RFC 6749 Section 4.4) is needed for
//! machine-to-machine tokens.

pub mod client_credentials;

pub use client_credentials::{
    create_mock_client_credentials_flow, ClientCredentialsFlow, ClientCredentialsFlowImpl,
    ClientCredentialsRequest, MockClientCredentialsFlow,
};

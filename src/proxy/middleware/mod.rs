//! Proxy middleware for authentication

mod auth;

pub use auth::{basic_credentials, AuthOutcome, Authentication, BasicAuth};

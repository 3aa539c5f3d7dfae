//! Upstream credentials for mirror fetches.
//!
//! Tokens come from configuration and are matched to a remote by host.

pub mod upstream;

pub use upstream::{resolve_credential, Credential};

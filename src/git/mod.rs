//! Git subprocess plumbing and the repository access gateway.
//!
//! Nothing here reimplements git: every operation shells out to the system
//! `git` binary through [`runner::GitCommand`], which owns environment
//! isolation and process-group cancellation.

pub mod commands;
pub mod paths;
pub mod pktline;
pub mod repo;
pub mod runner;

pub use paths::{is_valid_ref, resolve};
pub use repo::Repository;
pub use runner::{BoxedReader, Stderr, Streams};

//! SSH transport for git.
//!
//! Accepts public-key logins as the configured service user and serves
//! `git-upload-pack`, `git-receive-pack` and `git-upload-archive` through
//! the shared protocol state machine.  Unknown keys may still read public
//! repositories; only keys listed in `ssh.keys` may push or read private
//! ones.

pub mod server;
pub mod session;

pub use server::start_ssh_server;

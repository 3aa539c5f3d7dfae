//! Domain error taxonomy shared by the gateway, the protocol state machine
//! and the mirror worker.
//!
//! Transport code maps these onto wire responses; nothing here knows about
//! HTTP status codes or SSH exit codes.

use crate::git::runner::GitError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested name cannot be mapped inside the repository root.
    #[error("invalid repository path: {0}")]
    InvalidPath(String),

    /// Missing, unopenable or otherwise unusable repository.
    #[error("repository not found: {0}")]
    NotFound(String),

    /// The repository exists but is flagged private.
    #[error("repository is private")]
    Private,

    #[error("invalid ref: {0:?}")]
    InvalidRef(String),

    /// A git subprocess failed or a stream copy broke.
    #[error(transparent)]
    Protocol(#[from] GitError),

    /// A mirror fetch could not complete.
    #[error("upstream {remote}: {reason}")]
    Upstream { remote: String, reason: String },

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that must be reported to clients as "not found", so private
    /// repositories stay indistinguishable from missing ones.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Private)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_is_not_found_class() {
        assert!(Error::Private.is_not_found());
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(!Error::InvalidPath("..".into()).is_not_found());
        assert!(!Error::InvalidRef("a..b".into()).is_not_found());
    }
}

//! Git wire-protocol services run through the [`runner`](super::runner).
//!
//! Each function maps one protocol operation onto its git subcommand and
//! flags.  Framing beyond what git itself writes (the smart-HTTP banner,
//! `ERR` lines) is the caller's business.

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::paths::is_valid_ref;
use super::repo::Repository;
use super::runner::{GitCommand, Streams};
use crate::error::{Error, Result};

/// Output format for `git archive`.
pub const ARCHIVE_FORMAT: &str = "tar.gz";

fn upload_pack_command(repo: &Repository, git_protocol: Option<&str>) -> GitCommand {
    GitCommand::new(repo.path(), "upload-pack")
        .config("uploadpack.allowFilter", "true")
        .git_protocol(git_protocol)
}

// ---------------------------------------------------------------------------
// Fetch side
// ---------------------------------------------------------------------------

/// Reference advertisement for smart-HTTP discovery
/// (`upload-pack --stateless-rpc --advertise-refs`).
#[instrument(skip_all, fields(repo = %repo.name()))]
pub async fn advertise_refs(
    repo: &Repository,
    git_protocol: Option<&str>,
    streams: Streams<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    upload_pack_command(repo, git_protocol)
        .args(["--stateless-rpc", "--advertise-refs", "."])
        .run(streams, cancel)
        .await?;
    Ok(())
}

/// Serve a fetch or clone.  `stateless_rpc` is set for HTTP, where each
/// request carries one round of negotiation; SSH keeps the full
/// bidirectional conversation in one process.
#[instrument(skip_all, fields(repo = %repo.name(), stateless_rpc = stateless_rpc))]
pub async fn upload_pack(
    repo: &Repository,
    stateless_rpc: bool,
    git_protocol: Option<&str>,
    streams: Streams<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut cmd = upload_pack_command(repo, git_protocol);
    if stateless_rpc {
        cmd = cmd.arg("--stateless-rpc");
    }
    cmd.arg(".").run(streams, cancel).await?;
    Ok(())
}

#[instrument(skip_all, fields(repo = %repo.name()))]
pub async fn upload_archive(
    repo: &Repository,
    streams: Streams<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    GitCommand::new(repo.path(), "upload-archive")
        .arg(".")
        .run(streams, cancel)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Push side
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(repo = %repo.name()))]
pub async fn receive_pack(
    repo: &Repository,
    git_protocol: Option<&str>,
    streams: Streams<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    GitCommand::new(repo.path(), "receive-pack")
        .git_protocol(git_protocol)
        .arg(".")
        .run(streams, cancel)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// Stream a gzip'd tarball of `reference`.  The ref is checked against the
/// allow-list before any process is spawned.
#[instrument(skip_all, fields(repo = %repo.name(), %reference))]
pub async fn archive(
    repo: &Repository,
    reference: &str,
    streams: Streams<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    if !is_valid_ref(reference) {
        return Err(Error::InvalidRef(reference.to_string()));
    }
    GitCommand::new(repo.path(), "archive")
        .arg(format!("--format={ARCHIVE_FORMAT}"))
        .arg(reference)
        .run(streams, cancel)
        .await?;
    Ok(())
}

/// Installed git version, for health reporting.
pub async fn version() -> Result<String> {
    Ok(GitCommand::detached("--version")
        .checked(&CancellationToken::new())
        .await?)
}

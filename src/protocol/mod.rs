//! Transport-independent git protocol session.
//!
//! HTTP and SSH both drive one request through [`serve`]:
//!
//! ```text
//! received -> resolved -> authorized -> dispatched -> completed
//!                 |            |             \-> failed(internal)
//!                 |            \-> rejected(unauthorized)
//!                 \-> rejected(not_found)
//! ```
//!
//! The policy lives here once.  A [`Transport`] only decides how the
//! terminal step looks on its wire: status line and headers for HTTP, an
//! `ERR` pkt-line plus exit status for SSH.

pub mod stream;

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::git::{self, commands, pktline, BoxedReader, Repository, Stderr, Streams};
use crate::metrics::{self, MetricsRegistry, Outcome, OperationKind, RequestLabels, TransportLabels};

pub use stream::{ChunkStream, ChunkWriter};

pub const UPLOAD_PACK: &str = "git-upload-pack";
pub const RECEIVE_PACK: &str = "git-receive-pack";
pub const UPLOAD_ARCHIVE: &str = "git-upload-archive";

// ---------------------------------------------------------------------------
// Request model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Smart-HTTP ref discovery (`info/refs?service=git-upload-pack`).
    AdvertiseRefs,
    UploadPack,
    ReceivePack,
    UploadArchive,
    /// `git archive` of `reference` as a gzipped tarball.
    Archive { reference: String },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::AdvertiseRefs => OperationKind::AdvertiseRefs,
            Operation::UploadPack => OperationKind::UploadPack,
            Operation::ReceivePack => OperationKind::ReceivePack,
            Operation::UploadArchive => OperationKind::UploadArchive,
            Operation::Archive { .. } => OperationKind::Archive,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Operation::ReceivePack)
    }

    fn reference(&self) -> &str {
        match self {
            Operation::Archive { reference } => reference,
            _ => "",
        }
    }
}

/// One protocol request as handed over by a transport.
pub struct ProtocolRequest {
    /// Repository name exactly as the client sent it.
    pub repo: String,
    pub operation: Operation,
    /// Caller presented a recognised credential.
    pub authorized: bool,
    /// Sanitised `GIT_PROTOCOL` value, see [`sanitize_git_protocol`].
    pub git_protocol: Option<String>,
    pub input: Option<BoxedReader>,
    pub output: ChunkWriter,
    /// Separate diagnostics channel (SSH extended data).  Without one, git's
    /// stderr is captured for the logs and never reaches the client.
    pub errors: Option<ChunkWriter>,
    pub cancel: CancellationToken,
}

/// Why a request ended before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    Unauthorized,
    ReadOnlyMirror,
    InvalidRef,
    Internal,
}

impl Rejection {
    /// Text sent to the client.  Unauthorized reads the same as not found.
    pub fn message(self) -> &'static str {
        match self {
            Rejection::NotFound | Rejection::Unauthorized => "Repository not found.",
            Rejection::ReadOnlyMirror => "Repository is a read-only mirror.",
            Rejection::InvalidRef => "Invalid reference.",
            Rejection::Internal => "Unexpected server error.",
        }
    }

    pub fn outcome(self) -> Outcome {
        match self {
            Rejection::NotFound => Outcome::NotFound,
            Rejection::Unauthorized | Rejection::ReadOnlyMirror => Outcome::Unauthorized,
            Rejection::InvalidRef => Outcome::BadRequest,
            Rejection::Internal => Outcome::Failed,
        }
    }
}

/// The terminal step as seen by one wire protocol.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> metrics::Transport;

    /// HTTP runs one negotiation round per request; SSH keeps the process
    /// for the whole conversation.
    fn stateless_rpc(&self) -> bool;

    /// The request passed authorization and git is about to start.  This
    /// is the last point where the transport can still choose its status.
    async fn begin(&mut self, operation: &Operation, repo: &Repository);

    /// The request ends without running git.
    async fn reject(self, rejection: Rejection, output: ChunkWriter);

    /// Git ran.  On error some output may already have reached the client.
    async fn finish(self, result: Result<()>, output: ChunkWriter);
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Drive `request` to a terminal state through `transport`.
pub async fn serve<T: Transport>(
    root: &Path,
    metrics: &MetricsRegistry,
    mut transport: T,
    request: ProtocolRequest,
) -> Outcome {
    let ProtocolRequest {
        repo: name,
        operation,
        authorized,
        git_protocol,
        input,
        mut output,
        errors,
        cancel,
    } = request;

    let transport_labels = TransportLabels {
        transport: transport.kind(),
    };
    let active = metrics
        .metrics
        .active_sessions
        .get_or_create(&transport_labels)
        .clone();
    active.inc();
    let started = Instant::now();

    let outcome = match authorize(root, &name, &operation, authorized).await {
        Err(rejection) => {
            warn!(
                repo = %name,
                operation = ?operation.kind(),
                transport = ?transport.kind(),
                ?rejection,
                "request rejected"
            );
            // The transport may wait for every stream to drain.
            drop((input, errors));
            transport.reject(rejection, output).await;
            rejection.outcome()
        }
        Ok(repo) => {
            transport.begin(&operation, &repo).await;
            let result = dispatch(
                &repo,
                &operation,
                transport.stateless_rpc(),
                git_protocol.as_deref(),
                input,
                &mut output,
                errors,
                &cancel,
            )
            .await;
            let outcome = match &result {
                Ok(()) => {
                    info!(
                        repo = %repo.name(),
                        operation = ?operation.kind(),
                        transport = ?transport.kind(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "request completed"
                    );
                    Outcome::Completed
                }
                Err(e) => {
                    error!(
                        repo = %repo.name(),
                        operation = ?operation.kind(),
                        transport = ?transport.kind(),
                        error = %e,
                        "request failed"
                    );
                    Outcome::Failed
                }
            };
            transport.finish(result, output).await;
            outcome
        }
    };

    active.dec();
    metrics
        .metrics
        .request_duration_seconds
        .get_or_create(&transport_labels)
        .observe(started.elapsed().as_secs_f64());
    metrics
        .metrics
        .requests_total
        .get_or_create(&RequestLabels {
            transport: transport_labels.transport,
            operation: operation.kind(),
            outcome,
        })
        .inc();
    outcome
}

/// Resolve and authorize.  Every failure collapses into a [`Rejection`]
/// after the underlying cause has been logged.
async fn authorize(
    root: &Path,
    name: &str,
    operation: &Operation,
    authorized: bool,
) -> std::result::Result<Repository, Rejection> {
    let path = git::resolve(root, name).map_err(|e| {
        warn!(repo = %name, error = %e, "unresolvable repository name");
        Rejection::NotFound
    })?;

    let reference = operation.reference();
    if matches!(operation, Operation::Archive { .. }) && !git::is_valid_ref(reference) {
        return Err(Rejection::InvalidRef);
    }

    let opened = if authorized {
        Repository::open(&path, reference).await
    } else {
        Repository::open_public(&path, reference).await
    };
    let repo = opened.map_err(|e| match e {
        Error::Private => Rejection::Unauthorized,
        Error::InvalidRef(_) => Rejection::InvalidRef,
        e if e.is_not_found() => Rejection::NotFound,
        e => {
            error!(repo = %name, error = %e, "failed to open repository");
            Rejection::Internal
        }
    })?;

    let mirror = if operation.is_write() {
        repo.is_mirror().await.map_err(|e| {
            error!(repo = %name, error = %e, "failed to read mirror flag");
            Rejection::Internal
        })?
    } else {
        false
    };
    check_policy(operation, authorized, mirror)?;
    Ok(repo)
}

/// Write policy.  Read visibility is enforced by
/// [`Repository::open_public`] before this runs.
fn check_policy(
    operation: &Operation,
    authorized: bool,
    mirror: bool,
) -> std::result::Result<(), Rejection> {
    if operation.is_write() {
        if !authorized {
            return Err(Rejection::Unauthorized);
        }
        if mirror {
            return Err(Rejection::ReadOnlyMirror);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    repo: &Repository,
    operation: &Operation,
    stateless_rpc: bool,
    git_protocol: Option<&str>,
    input: Option<BoxedReader>,
    output: &mut ChunkWriter,
    mut errors: Option<ChunkWriter>,
    cancel: &CancellationToken,
) -> Result<()> {
    if *operation == Operation::AdvertiseRefs && !wants_v2(git_protocol) {
        // Protocol v2 clients expect the capability list straight away.
        pktline::write_line(output, &format!("# service={UPLOAD_PACK}\n")).await?;
        pktline::write_flush(output).await?;
    }

    let stderr = match errors.as_mut() {
        Some(w) => Stderr::Separate(w),
        None => Stderr::Capture,
    };
    let mut streams = Streams::new(&mut *output).stderr(stderr);
    if let Some(input) = input {
        streams = streams.stdin(input);
    }

    let result = match operation {
        Operation::AdvertiseRefs => {
            commands::advertise_refs(repo, git_protocol, streams, cancel).await
        }
        Operation::UploadPack => {
            commands::upload_pack(repo, stateless_rpc, git_protocol, streams, cancel).await
        }
        Operation::ReceivePack => {
            commands::receive_pack(repo, git_protocol, streams, cancel).await
        }
        Operation::UploadArchive => commands::upload_archive(repo, streams, cancel).await,
        Operation::Archive { reference } => {
            commands::archive(repo, reference, streams, cancel).await
        }
    };

    if let Some(mut errors) = errors {
        let _ = errors.shutdown().await;
    }
    result
}

fn wants_v2(git_protocol: Option<&str>) -> bool {
    git_protocol.is_some_and(|p| p.split(':').any(|kv| kv == "version=2"))
}

/// Accept a client supplied `GIT_PROTOCOL` value only if it is made of the
/// characters git itself emits there.
pub fn sanitize_git_protocol(raw: &str) -> Option<String> {
    let ok = !raw.is_empty()
        && raw.len() <= 256
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"=:.,_-".contains(&b));
    ok.then(|| raw.to_string())
}

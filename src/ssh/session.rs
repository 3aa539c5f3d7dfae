//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].
//! Any public key is let in under the service user; whether the key is in
//! the authorized list decides what the session may do.  Each exec'd git
//! command becomes one [`ProtocolRequest`] driven by the shared state
//! machine, with the SSH channel as its transport.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::git::pktline;
use crate::metrics;
use crate::protocol::stream::{self, Chunk};
use crate::protocol::{
    self, sanitize_git_protocol, ChunkWriter, Operation, ProtocolRequest, Rejection, Transport,
    RECEIVE_PACK, UPLOAD_ARCHIVE, UPLOAD_PACK,
};
use crate::AppState;

/// Client data chunks buffered ahead of git's stdin.
const STDIN_CAPACITY: usize = 32;

/// SSH extended data type for stderr (RFC 4254 section 5.2).
const EXTENDED_STDERR: u32 = 1;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChannelState {
    git_protocol: Option<String>,
    /// Client data for the running command; dropped on client EOF.
    stdin: Option<mpsc::Sender<Chunk>>,
    cancel: CancellationToken,
}

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    authorized_keys: Arc<HashSet<String>>,
    peer_addr: Option<SocketAddr>,
    fingerprint: Option<String>,
    /// The client's key is in `ssh.keys`.
    authorized: bool,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(
        state: Arc<AppState>,
        authorized_keys: Arc<HashSet<String>>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            state,
            authorized_keys,
            peer_addr,
            fingerprint: None,
            authorized: false,
            channels: HashMap::new(),
        }
    }
}

impl Drop for SshSession {
    /// A dropped connection must not leave git processes behind.
    fn drop(&mut self) {
        for channel in self.channels.values() {
            channel.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Channel close helper
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254).  Git's SSH transport client expects all three
/// signals; omitting exit-status or EOF causes the client to treat the channel
/// close as a transport failure ("the remote end hung up unexpectedly").
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

/// Reject an exec before any protocol session exists.
fn reject_exec(session: &mut Session, channel_id: ChannelId, message: &str) {
    session.data(
        channel_id,
        CryptoVec::from_slice(&pktline::encode_error(message)),
    );
    finish_channel(session, channel_id, 1);
}

// ---------------------------------------------------------------------------
// Git command parsing
// ---------------------------------------------------------------------------

/// Parse a Git SSH exec request such as:
///
/// ```text
/// git-upload-pack 'repo.git'
/// git-receive-pack '/repo'
/// git upload-archive 'repo'
/// ```
///
/// Returns the operation and the repository name as sent, minus quotes.
/// Name validation is left to the path resolver.
fn parse_git_command(cmd: &str) -> Option<(Operation, String)> {
    let cmd = cmd.trim();
    let (program, rest) = cmd.split_once(char::is_whitespace)?;
    // `git upload-pack` is accepted as a spelling of `git-upload-pack`.
    let (program, rest) = if program == "git" {
        let (sub, rest) = rest.trim_start().split_once(char::is_whitespace)?;
        (format!("git-{sub}"), rest)
    } else {
        (program.to_string(), rest)
    };

    let operation = match program.as_str() {
        UPLOAD_PACK => Operation::UploadPack,
        RECEIVE_PACK => Operation::ReceivePack,
        UPLOAD_ARCHIVE => Operation::UploadArchive,
        _ => return None,
    };

    // The rest should be the repo path, possibly single-quoted.
    let repo = rest.trim();
    let repo = repo
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| repo.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
        .unwrap_or(repo);

    if repo.is_empty() {
        return None;
    }
    Some((operation, repo.to_string()))
}

// ---------------------------------------------------------------------------
// Fingerprint helper
// ---------------------------------------------------------------------------

/// Compute the SHA-256 fingerprint of an SSH public key, returned as a
/// base64-encoded string prefixed with `SHA256:` (matching the format used by
/// `ssh-keygen -l`).
fn fingerprint_of(key: &PublicKey) -> String {
    let blob_b64 = key.public_key_base64();
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The terminal step over SSH: output and stderr are forwarded as channel
/// data by background tasks; the session ends with exit-status, EOF and
/// close once both have drained.
struct SshTransport {
    handle: Handle,
    channel: ChannelId,
    forwarders: Vec<JoinHandle<()>>,
}

impl SshTransport {
    async fn end(self, output: ChunkWriter, exit_status: u32) {
        drop(output);
        for forwarder in self.forwarders {
            let _ = forwarder.await;
        }
        // RFC 4254: exit-status → EOF → close.
        let _ = self
            .handle
            .exit_status_request(self.channel, exit_status)
            .await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn kind(&self) -> metrics::Transport {
        metrics::Transport::Ssh
    }

    fn stateless_rpc(&self) -> bool {
        false
    }

    async fn begin(&mut self, _operation: &Operation, _repo: &crate::git::Repository) {}

    async fn reject(self, rejection: Rejection, mut output: ChunkWriter) {
        let _ = pktline::write_error(&mut output, rejection.message()).await;
        self.end(output, 1).await;
    }

    async fn finish(self, result: crate::error::Result<()>, mut output: ChunkWriter) {
        let exit_status = match result {
            Ok(()) => 0,
            Err(_) => {
                let _ =
                    pktline::write_error(&mut output, Rejection::Internal.message()).await;
                1
            }
        };
        self.end(output, exit_status).await;
    }
}

/// Copy one chunk channel to the client as channel data, or as extended
/// data when `extended` is set.  Stops at the first failed send, which
/// makes the next write on the other side fail too.
fn forward(
    handle: Handle,
    channel: ChannelId,
    mut rx: mpsc::Receiver<Chunk>,
    extended: Option<u32>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Ok(bytes)) = rx.recv().await {
            let data = CryptoVec::from_slice(&bytes);
            let sent = match extended {
                Some(code) => handle.extended_data(channel, code, data).await,
                None => handle.data(channel, data).await,
            };
            if sent.is_err() {
                debug!(?channel, "client stopped accepting data");
                break;
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Only the service user may log in.  Every key is accepted; a key in
    /// the authorized list unlocks pushes and private repositories.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint_of(key);
        if user != self.state.config.ssh.user {
            warn!(
                peer = ?self.peer_addr,
                user = %user,
                fingerprint = %fp,
                "SSH login with unexpected user"
            );
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        self.authorized = self.authorized_keys.contains(&key.public_key_base64());
        info!(
            peer = ?self.peer_addr,
            fingerprint = %fp,
            authorized = self.authorized,
            "SSH public-key auth"
        );
        self.fingerprint = Some(fp);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    /// Git clients send `GIT_PROTOCOL=version=2` here, before the exec
    /// request, to negotiate protocol v2.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name != "GIT_PROTOCOL" {
            return Ok(());
        }
        match (self.channels.get_mut(&channel), sanitize_git_protocol(variable_value)) {
            (Some(state), Some(value)) => {
                debug!(%value, "captured GIT_PROTOCOL from client");
                state.git_protocol = Some(value);
            }
            _ => debug!(value = %variable_value, "ignored GIT_PROTOCOL"),
        }
        Ok(())
    }

    /// Forward client data to the running command's stdin.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        if let Some(stdin) = &state.stdin {
            if stdin.send(Ok(Bytes::copy_from_slice(data))).await.is_err() {
                debug!("git stopped reading stdin");
                state.stdin = None;
            }
        }
        Ok(())
    }

    /// Client EOF closes git's stdin.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            state.cancel.cancel();
        }
        Ok(())
    }

    /// Start the requested git service on the channel.  The protocol
    /// session runs in its own task and closes the channel when done.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_cmd = String::from_utf8_lossy(data);
        info!(
            peer = ?self.peer_addr,
            fingerprint = ?self.fingerprint,
            command = %raw_cmd,
            "SSH exec request"
        );

        let Some(channel) = self.channels.get_mut(&channel_id) else {
            reject_exec(session, channel_id, Rejection::Internal.message());
            return Ok(());
        };
        if channel.stdin.is_some() {
            warn!(command = %raw_cmd, "second exec on one channel");
            reject_exec(session, channel_id, "Unsupported command.");
            return Ok(());
        }
        let Some((operation, repo)) = parse_git_command(&raw_cmd) else {
            warn!(command = %raw_cmd, "unrecognised SSH exec command");
            reject_exec(session, channel_id, "Unsupported command.");
            return Ok(());
        };

        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CAPACITY);
        channel.stdin = Some(stdin_tx);

        let handle = session.handle();
        let (output, output_rx) = stream::channel();
        let (errors, errors_rx) = stream::channel();
        let transport = SshTransport {
            handle: handle.clone(),
            channel: channel_id,
            forwarders: vec![
                forward(handle.clone(), channel_id, output_rx, None),
                forward(handle, channel_id, errors_rx, Some(EXTENDED_STDERR)),
            ],
        };
        let request = ProtocolRequest {
            repo,
            operation,
            authorized: self.authorized,
            git_protocol: channel.git_protocol.clone(),
            input: Some(Box::new(StreamReader::new(ReceiverStream::new(stdin_rx)))),
            output,
            errors: Some(errors),
            cancel: channel.cancel.clone(),
        };

        let root = self.state.config.repo.dir.clone();
        let metrics = self.state.metrics.clone();
        tokio::spawn(async move {
            let outcome = protocol::serve(&root, &metrics, transport, request).await;
            debug!(?outcome, "ssh protocol session ended");
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

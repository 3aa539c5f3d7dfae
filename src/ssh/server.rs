//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::session::SshSession;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
    authorized_keys: Arc<HashSet<String>>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>, authorized_keys: HashSet<String>) -> Self {
        Self {
            state,
            authorized_keys: Arc::new(authorized_keys),
        }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(
            peer = ?peer_addr,
            "new SSH client connection",
        );
        SshSession::new(
            Arc::clone(&self.state),
            Arc::clone(&self.authorized_keys),
            peer_addr,
        )
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

fn load_host_key(state: &AppState) -> Result<KeyPair> {
    let path = state
        .config
        .ssh
        .host_key
        .as_ref()
        .context("ssh.host_key is not configured")?;
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("failed to load SSH host key {}", path.display()))
}

/// Key blob of one `authorized_keys` style line
/// (`ssh-ed25519 AAAA... comment`), re-encoded so comparisons do not
/// depend on how the line was written.
pub fn parse_authorized_key(line: &str) -> Result<String> {
    let blob = line
        .split_whitespace()
        .nth(1)
        .with_context(|| format!("malformed authorized key: {line:?}"))?;
    let key = russh_keys::parse_public_key_base64(blob)
        .with_context(|| format!("invalid authorized key: {line:?}"))?;
    Ok(key.public_key_base64())
}

fn parse_authorized_keys(lines: &[String]) -> Result<HashSet<String>> {
    lines.iter().map(|l| parse_authorized_key(l)).collect()
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  Runs until `shutdown` fires or the listener
/// fails.  A bad host key or authorized key aborts before binding.
pub async fn start_ssh_server(state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    let listen_addr = format!("{}:{}", state.config.server.host, state.config.ssh.port);

    let host_key = load_host_key(&state)?;
    let authorized_keys = parse_authorized_keys(&state.config.ssh.keys)?;

    let config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: Some(Duration::from_secs(600)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 3,
        ..Default::default()
    });

    info!(
        address = %listen_addr,
        authorized_keys = authorized_keys.len(),
        "starting SSH server"
    );

    let mut ssh_server = SshServer::new(state, authorized_keys);
    tokio::select! {
        result = ssh_server.run_on_address(config, listen_addr.as_str()) => {
            result.context("SSH server exited with error")?;
        }
        () = shutdown.cancelled() => info!("SSH server stopping"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use russh::ChannelMsg;

    use super::*;
    use crate::config::Config;
    use crate::test_support::{commit, init_bare, require_git, set_config};

    fn sample_key() -> String {
        let pair = KeyPair::generate_ed25519();
        let public = pair.clone_public_key().unwrap();
        format!("ssh-ed25519 {} alice@laptop", public.public_key_base64())
    }

    #[test]
    fn authorized_key_comment_is_ignored() {
        let line = sample_key();
        let without_comment: String = line.rsplit_once(' ').unwrap().0.to_string();
        assert_eq!(
            parse_authorized_key(&line).unwrap(),
            parse_authorized_key(&without_comment).unwrap()
        );
    }

    #[test]
    fn malformed_authorized_keys_are_fatal() {
        assert!(parse_authorized_key("ssh-ed25519").is_err());
        assert!(parse_authorized_key("ssh-ed25519 not-base64!").is_err());
        let keys = vec![sample_key(), "garbage".to_string()];
        assert!(parse_authorized_keys(&keys).is_err());
    }

    // -----------------------------------------------------------------------
    // Loopback sessions
    // -----------------------------------------------------------------------

    struct TestClient;

    #[async_trait::async_trait]
    impl russh::client::Handler for TestClient {
        type Error = anyhow::Error;

        async fn check_server_key(
            &mut self,
            _server_public_key: &russh_keys::key::PublicKey,
        ) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct ExecResult {
        stdout: Vec<u8>,
        exit_status: Option<u32>,
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Start a server over `root` that trusts `authorized`.
    fn spawn_server(root: &std::path::Path, authorized: &KeyPair) -> (u16, CancellationToken) {
        let host_key = KeyPair::generate_ed25519();
        let host_key_path = root.join("host_key");
        russh_keys::encode_pkcs8_pem(&host_key, std::fs::File::create(&host_key_path).unwrap())
            .unwrap();

        let port = free_port();
        let mut config = Config::for_repo_dir(root);
        config.server.host = "127.0.0.1".to_string();
        config.ssh.enable = true;
        config.ssh.port = port;
        config.ssh.host_key = Some(host_key_path);
        config.ssh.keys = vec![format!(
            "ssh-ed25519 {} trusted",
            authorized.clone_public_key().unwrap().public_key_base64()
        )];

        let state = Arc::new(AppState::new(config).unwrap());
        let shutdown = CancellationToken::new();
        tokio::spawn(start_ssh_server(state, shutdown.clone()));
        (port, shutdown)
    }

    async fn exec(port: u16, key: KeyPair, command: &str, input: &[u8]) -> ExecResult {
        let config = Arc::new(russh::client::Config::default());
        let mut session = None;
        for _ in 0..100 {
            match russh::client::connect(Arc::clone(&config), ("127.0.0.1", port), TestClient).await {
                Ok(s) => {
                    session = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        let mut session = session.expect("SSH server did not start");
        assert!(session.authenticate_publickey("git", Arc::new(key)).await.unwrap());

        let mut channel = session.channel_open_session().await.unwrap();
        channel.exec(true, command).await.unwrap();
        // The server may already have closed a rejected channel.
        if !input.is_empty() {
            let _ = channel.data(input).await;
        }
        let _ = channel.eof().await;

        let mut result = ExecResult::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => result.stdout.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => result.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        result
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn upload_pack_over_ssh_exits_zero() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        let repo = init_bare(root.path(), "demo");
        let head = commit(&repo, "hello");

        let trusted = KeyPair::generate_ed25519();
        let (port, shutdown) = spawn_server(root.path(), &trusted);

        // A bare flush ends negotiation without wanting anything.
        let stranger = KeyPair::generate_ed25519();
        let result = exec(port, stranger, "git-upload-pack 'demo.git'", b"0000").await;
        assert_eq!(result.exit_status, Some(0));
        assert!(String::from_utf8_lossy(&result.stdout).contains(&head));
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn private_repository_needs_an_authorized_key() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        let repo = init_bare(root.path(), "secret");
        let head = commit(&repo, "hidden");
        set_config(&repo, "repohost.private", "true");

        let trusted = KeyPair::generate_ed25519();
        let (port, shutdown) = spawn_server(root.path(), &trusted);

        let stranger = KeyPair::generate_ed25519();
        let denied = exec(port, stranger, "git-upload-pack 'secret'", b"").await;
        assert_eq!(denied.exit_status, Some(1));
        assert_eq!(denied.stdout, b"001dERR Repository not found.");

        let allowed = exec(port, trusted, "git-upload-pack 'secret'", b"0000").await;
        assert_eq!(allowed.exit_status, Some(0));
        assert!(String::from_utf8_lossy(&allowed.stdout).contains(&head));
        shutdown.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_command_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let trusted = KeyPair::generate_ed25519();
        let (port, shutdown) = spawn_server(root.path(), &trusted);

        let result = exec(port, trusted, "ls -la", b"").await;
        assert_eq!(result.exit_status, Some(1));
        assert!(String::from_utf8_lossy(&result.stdout).contains("ERR Unsupported command."));
        shutdown.cancel();
    }
}

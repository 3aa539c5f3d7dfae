mod cache;
mod config;
mod credentials;
mod error;
mod git;
mod health;
mod http;
mod manage;
mod metrics;
mod mirror;
mod protocol;
mod ssh;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::http::index::RepoSummary;
use crate::http::refs::{LogView, RefsView};
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "repohost", about = "Self-hosted git server over HTTP and SSH")]
struct Cli {
    /// Path to the YAML configuration file.  Falls back to ./config.yaml,
    /// /etc/repohost.yaml and /var/lib/repohost/config.yaml.
    #[arg(short, long, global = true, env = "REPOHOST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server, and the SSH server and mirror worker when enabled.
    Serve,
    /// Manage repositories.
    #[command(subcommand)]
    Repo(manage::RepoCommand),
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    /// `GET /` response, under [`http::index::INDEX_KEY`].
    pub index_cache: TtlCache<Arc<Vec<RepoSummary>>>,
    /// `GET /{name}` responses, by normalised name.
    pub summary_cache: TtlCache<RepoSummary>,
    /// `GET /{name}/refs` responses, by normalised name.
    pub refs_cache: TtlCache<Arc<RefsView>>,
    /// `GET /{name}/log/{ref}` responses, by `name@ref`.
    pub log_cache: TtlCache<Arc<LogView>>,
}

impl AppState {
    /// Must be called inside a tokio runtime; the caches start their sweepers.
    pub fn new(config: Config) -> Result<Self> {
        let index_cache = TtlCache::new(config.cache.index_ttl()?);
        let repo_ttl = config.cache.summary_ttl()?;
        Ok(Self {
            config: Arc::new(config),
            metrics: MetricsRegistry::new(),
            index_cache,
            summary_cache: TtlCache::new(repo_ttl),
            refs_cache: TtlCache::new(repo_ttl),
            log_cache: TtlCache::new(repo_ttl),
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listen_addr = state.config.server.listen_addr();
    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

async fn serve(config: Config) -> Result<()> {
    let state = AppState::new(config)?;
    let config = Arc::clone(&state.config);
    let shutdown = CancellationToken::new();

    // Built before anything is spawned so a bad interval stops startup.
    let mirror_worker = if config.mirror.enable {
        Some(mirror::MirrorWorker::new(
            &config.mirror,
            &config.repo.dir,
            state.metrics.clone(),
        )?)
    } else {
        None
    };

    // ---- Spawn services ----
    let mut services = tokio::task::JoinSet::new();

    services.spawn({
        let s = state.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = run_http_server(s, shutdown.clone()).await {
                tracing::error!(error = %e, "HTTP server failed");
                shutdown.cancel();
            }
        }
    });

    if config.ssh.enable {
        services.spawn({
            let s = Arc::new(state.clone());
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = ssh::start_ssh_server(s, shutdown.clone()).await {
                    tracing::error!(error = %e, "SSH server failed");
                    shutdown.cancel();
                }
            }
        });
    }

    if let Some(worker) = mirror_worker {
        services.spawn(worker.run(shutdown.clone()));
    }

    // ---- Await shutdown ----
    tokio::select! {
        () = shutdown_signal() => {}
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
    while services.join_next().await.is_some() {}

    tracing::info!("repohost shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config_path = config::resolve_config_path(cli.config.as_deref())
        .context("no configuration file found; pass --config")?;
    let config = config::load_config(&config_path)?;
    tracing::info!(config_path = %config_path.display(), repo_dir = %config.repo.dir.display(), "configuration loaded");

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Repo(command) => manage::run(&config.repo.dir, command).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_repo_commands() {
        let cli = Cli::try_parse_from([
            "repohost",
            "repo",
            "new",
            "tools",
            "--mirror",
            "https://example.com/tools.git",
            "--private",
            "-c",
            "/tmp/config.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/config.yaml")));
        match cli.command {
            Command::Repo(manage::RepoCommand::New {
                name,
                mirror,
                private,
            }) => {
                assert_eq!(name, "tools");
                assert_eq!(mirror.as_deref(), Some("https://example.com/tools.git"));
                assert!(private);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["repohost", "repo", "description", "tools"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Repo(manage::RepoCommand::Description { text: None, .. })
        ));
        assert!(Cli::try_parse_from(["repohost"]).is_err());
    }

    #[tokio::test]
    async fn app_state_rejects_bad_ttl() {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::for_repo_dir(root.path());
        config.cache.summary_ttl = "sometime".to_string();
        assert!(AppState::new(config).is_err());
    }
}

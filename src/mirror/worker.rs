//! Mirror reconciliation worker.
//!
//! Runs one pass at startup and then on every tick of the configured
//! interval.  A pass scans the repository root for mirror repositories and
//! fetches each from its upstream, at most `concurrency` at a time.  A
//! failing upstream only fails its own repository.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::config::MirrorConfig;
use crate::credentials::{resolve_credential, Credential};
use crate::error::{Error, Result};
use crate::git::Repository;
use crate::metrics::{FetchLabels, FetchOutcome, MetricsRegistry};

// ---------------------------------------------------------------------------
// Fetch seam
// ---------------------------------------------------------------------------

/// Brings one repository up to date with its `origin`.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(
        &self,
        repo: &Repository,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// `git fetch` through the repository gateway.
pub struct GitFetcher;

#[async_trait]
impl Fetcher for GitFetcher {
    async fn fetch(
        &self,
        repo: &Repository,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        repo.fetch(credential, cancel).await
    }
}

// ---------------------------------------------------------------------------
// Pass result
// ---------------------------------------------------------------------------

/// Every repository that failed in one pass, with its error.
#[derive(Debug)]
pub struct MirrorPassError {
    pub attempted: usize,
    pub failures: Vec<(String, Error)>,
}

impl fmt::Display for MirrorPassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} mirror syncs failed",
            self.failures.len(),
            self.attempted
        )?;
        for (name, err) in &self.failures {
            write!(f, "\n{name}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MirrorPassError {}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct MirrorWorker<F = GitFetcher> {
    root: PathBuf,
    config: MirrorConfig,
    interval: Duration,
    fetcher: Arc<F>,
    metrics: MetricsRegistry,
}

impl MirrorWorker<GitFetcher> {
    pub fn new(config: &MirrorConfig, root: &Path, metrics: MetricsRegistry) -> anyhow::Result<Self> {
        Self::with_fetcher(config, root, metrics, GitFetcher)
    }
}

impl<F: Fetcher> MirrorWorker<F> {
    /// Fails on a malformed interval or a zero concurrency, before anything
    /// runs.
    pub fn with_fetcher(
        config: &MirrorConfig,
        root: &Path,
        metrics: MetricsRegistry,
        fetcher: F,
    ) -> anyhow::Result<Self> {
        let interval = humantime::parse_duration(&config.interval)
            .with_context(|| format!("invalid mirror.interval: {:?}", config.interval))?;
        anyhow::ensure!(!interval.is_zero(), "mirror.interval must be positive");
        anyhow::ensure!(config.concurrency > 0, "mirror.concurrency must be at least 1");

        Ok(Self {
            root: root.to_path_buf(),
            config: config.clone(),
            interval,
            fetcher: Arc::new(fetcher),
            metrics,
        })
    }

    /// Reconcile now and then on every tick until `cancel` fires.  A failed
    /// pass is logged; the loop carries on.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval = %humantime::format_duration(self.interval),
            concurrency = self.config.concurrency,
            "mirror worker started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // The first tick completes immediately.
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.reconcile(&cancel).await {
                Ok(synced) => info!(synced, "mirror pass completed"),
                Err(e) => error!(error = %e, "mirror pass completed with failures"),
            }
        }

        info!("mirror worker stopped");
    }

    /// One reconciliation pass.  Returns how many mirrors were synced.
    #[instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<usize, MirrorPassError> {
        let started = Instant::now();
        let mirrors = find_mirrors(&self.root).await.map_err(|e| MirrorPassError {
            attempted: 0,
            failures: vec![(self.root.display().to_string(), e)],
        })?;
        self.metrics.metrics.mirror_repos.set(mirrors.len() as i64);
        debug!(count = mirrors.len(), "mirror repositories found");

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        for repo in mirrors {
            let semaphore = Arc::clone(&semaphore);
            let fetcher = Arc::clone(&self.fetcher);
            let config = self.config.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let name = repo.name().to_string();
                let result = async {
                    let _permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit.map_err(|_| cancelled(&name))?,
                        () = cancel.cancelled() => return Err(cancelled(&name)),
                    };
                    sync_repo(fetcher.as_ref(), &config, &repo, &cancel).await
                }
                .await;
                (name, result)
            });
        }

        let attempted = tasks.len();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (name, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "mirror sync task panicked");
                    failures.push(("<task>".to_string(), Error::Io(std::io::Error::other(e))));
                    continue;
                }
            };
            let outcome = match result {
                Ok(()) => FetchOutcome::Success,
                Err(e) => {
                    error!(repo = %name, error = %e, "mirror sync failed");
                    failures.push((name, e));
                    FetchOutcome::Failure
                }
            };
            self.metrics
                .metrics
                .mirror_fetch_total
                .get_or_create(&FetchLabels { outcome })
                .inc();
        }

        self.metrics
            .metrics
            .mirror_pass_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if failures.is_empty() {
            Ok(attempted)
        } else {
            Err(MirrorPassError {
                attempted,
                failures,
            })
        }
    }
}

fn cancelled(name: &str) -> Error {
    Error::Upstream {
        remote: name.to_string(),
        reason: "cancelled".to_string(),
    }
}

/// Mirror repositories directly under `root`.  Anything that does not open
/// as a repository is skipped.
async fn find_mirrors(root: &Path) -> Result<Vec<Repository>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut mirrors = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let repo = match Repository::open(&path, "").await {
            Ok(repo) => repo,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping non-repository directory");
                continue;
            }
        };
        match repo.is_mirror().await {
            Ok(true) => mirrors.push(repo),
            Ok(false) => {}
            Err(e) => debug!(repo = %repo.name(), error = %e, "skipping unreadable repository"),
        }
    }
    mirrors.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(mirrors)
}

/// Only `http` and `https` upstreams are fetched.
pub fn validate_remote(remote: &str) -> Result<Url> {
    let invalid = |reason: String| Error::Upstream {
        remote: remote.to_string(),
        reason,
    };
    let url = Url::parse(remote).map_err(|e| invalid(format!("invalid remote url: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!(
            "unsupported scheme {other:?}, only http and https remotes are supported"
        ))),
    }
}

#[instrument(skip_all, fields(repo = %repo.name()))]
async fn sync_repo<F: Fetcher + ?Sized>(
    fetcher: &F,
    config: &MirrorConfig,
    repo: &Repository,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("mirror sync started");
    let remote = repo.remote_url().await?.ok_or_else(|| Error::Upstream {
        remote: String::new(),
        reason: "no origin remote configured".to_string(),
    })?;
    let url = validate_remote(&remote)?;
    let credential = resolve_credential(config, &url);

    fetcher.fetch(repo, credential.as_ref(), cancel).await?;
    repo.set_last_sync(Utc::now()).await?;
    info!(authenticated = credential.is_some(), "mirror sync completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::test_support::{init_bare, make_mirror, require_git};

    #[derive(Default)]
    struct FakeFetcher {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
        failing: HashSet<String>,
        saw_credential: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(
            &self,
            repo: &Repository,
            credential: Option<&Credential>,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(repo.name().to_string());
            self.saw_credential.lock().unwrap().push(credential.is_some());
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(repo.name()) {
                return Err(Error::Upstream {
                    remote: repo.name().to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }
    }

    fn mirror_config(concurrency: usize) -> MirrorConfig {
        MirrorConfig {
            enable: true,
            interval: "1h".to_string(),
            concurrency,
            github_token: None,
        }
    }

    fn worker(
        root: &Path,
        config: &MirrorConfig,
        fetcher: FakeFetcher,
    ) -> MirrorWorker<FakeFetcher> {
        MirrorWorker::with_fetcher(config, root, MetricsRegistry::new(), fetcher).unwrap()
    }

    #[test]
    fn malformed_interval_fails_fast() {
        let root = tempfile::tempdir().unwrap();
        let mut config = mirror_config(2);
        config.interval = "every so often".to_string();
        assert!(MirrorWorker::new(&config, root.path(), MetricsRegistry::new()).is_err());

        config.interval = "0s".to_string();
        assert!(MirrorWorker::new(&config, root.path(), MetricsRegistry::new()).is_err());
    }

    #[test]
    fn only_http_remotes_are_accepted() {
        assert!(validate_remote("https://github.com/a/b.git").is_ok());
        assert!(validate_remote("http://git.example.com/b").is_ok());
        assert!(validate_remote("ssh://git@github.com/a/b.git").is_err());
        assert!(validate_remote("git://example.com/b").is_err());
        assert!(validate_remote("git@github.com:a/b.git").is_err());
        assert!(validate_remote("file:///srv/repo.git").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded_and_failures_are_isolated() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        for i in 0..6 {
            let path = init_bare(root.path(), &format!("m{i}"));
            make_mirror(&path, &format!("https://example.com/m{i}.git"));
        }
        init_bare(root.path(), "plain");
        std::fs::create_dir(root.path().join("junk")).unwrap();
        std::fs::write(root.path().join("README"), "not a repo").unwrap();

        let fetcher = FakeFetcher {
            failing: HashSet::from(["m3".to_string()]),
            ..Default::default()
        };
        let worker = worker(root.path(), &mirror_config(2), fetcher);
        let err = worker.reconcile(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.attempted, 6);
        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, "m3");
        assert!(err.to_string().contains("connection refused"));

        let fetcher = &worker.fetcher;
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(fetcher.calls.lock().unwrap().len(), 6);

        for i in 0..6 {
            let repo = Repository::open(&root.path().join(format!("m{i}.git")), "")
                .await
                .unwrap();
            let synced = repo.last_sync().await.unwrap();
            assert_eq!(synced.is_some(), i != 3, "m{i}");
        }
    }

    #[tokio::test]
    async fn unsupported_scheme_never_reaches_fetcher() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        let path = init_bare(root.path(), "ssh-mirror");
        make_mirror(&path, "ssh://git@example.com/repo.git");

        let worker = worker(root.path(), &mirror_config(1), FakeFetcher::default());
        let err = worker.reconcile(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.failures.len(), 1);
        assert!(worker.fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn github_remotes_get_the_token() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        let gh = init_bare(root.path(), "gh");
        make_mirror(&gh, "https://github.com/acme/gh.git");
        let other = init_bare(root.path(), "other");
        make_mirror(&other, "https://gitlab.com/acme/other.git");

        let mut config = mirror_config(1);
        config.github_token = Some("ghp_secret".to_string());
        let worker = worker(root.path(), &config, FakeFetcher::default());
        assert_eq!(worker.reconcile(&CancellationToken::new()).await.unwrap(), 2);

        // Sorted by name: "gh" then "other".
        assert_eq!(*worker.fetcher.saw_credential.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let root = tempfile::tempdir().unwrap();
        let worker = worker(root.path(), &mirror_config(1), FakeFetcher::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}

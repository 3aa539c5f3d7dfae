use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub repo: RepoConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Directory holding the bare repositories.  Made absolute on load.
    pub dir: PathBuf,
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// The only login name accepted.
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// OpenSSH private key file used as the server host key.
    #[serde(default)]
    pub host_key: Option<PathBuf>,
    /// Authorized public keys (`ssh-ed25519 AAAA... comment`).  A client
    /// presenting one of these may push and read private repositories.
    #[serde(default)]
    pub keys: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enable: false,
            port: default_ssh_port(),
            user: default_ssh_user(),
            host_key: None,
            keys: Vec::new(),
        }
    }
}

fn default_ssh_port() -> u16 {
    2222
}

fn default_ssh_user() -> String {
    "git".to_string()
}

// ---------------------------------------------------------------------------
// Mirroring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    #[serde(default)]
    pub enable: bool,
    /// Time between reconciliation passes (`8h`, `30m`).
    #[serde(default = "default_mirror_interval")]
    pub interval: String,
    /// Maximum simultaneous fetches per pass.
    #[serde(default = "default_mirror_concurrency")]
    pub concurrency: usize,
    /// Token for github.com remotes.  Accepts `$env:NAME` and `$file:/path`.
    #[serde(default)]
    pub github_token: Option<String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enable: false,
            interval: default_mirror_interval(),
            concurrency: default_mirror_concurrency(),
            github_token: None,
        }
    }
}

fn default_mirror_interval() -> String {
    "8h".to_string()
}

fn default_mirror_concurrency() -> usize {
    5
}

// ---------------------------------------------------------------------------
// Cache TTLs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL of the repository index (`GET /`).
    #[serde(default = "default_index_ttl")]
    pub index_ttl: String,
    /// TTL of per-repository summaries (`GET /{name}`).
    #[serde(default = "default_summary_ttl")]
    pub summary_ttl: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            index_ttl: default_index_ttl(),
            summary_ttl: default_summary_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn index_ttl(&self) -> Result<Duration> {
        parse_duration("cache.index_ttl", &self.index_ttl)
    }

    pub fn summary_ttl(&self) -> Result<Duration> {
        parse_duration("cache.summary_ttl", &self.summary_ttl)
    }
}

fn default_index_ttl() -> String {
    "5m".to_string()
}

fn default_summary_ttl() -> String {
    "1m".to_string()
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {field}: {value:?}"))
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Candidate locations tried when `--config` does not name an existing file.
const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "./config.yaml",
    "/etc/repohost.yaml",
    "/var/lib/repohost/config.yaml",
];

/// `user_path` if it exists, else the first existing default location.
pub fn resolve_config_path(user_path: Option<&Path>) -> Option<PathBuf> {
    user_path
        .filter(|p| p.is_file())
        .map(Path::to_path_buf)
        .or_else(|| {
            DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file())
        })
}

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    config.repo.dir = std::fs::canonicalize(&config.repo.dir).with_context(|| {
        format!(
            "repo.dir does not exist: {}",
            config.repo.dir.display()
        )
    })?;
    resolve_secrets(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

fn resolve_secrets(config: &mut Config) -> Result<()> {
    if config.mirror.enable {
        if let Some(raw) = config.mirror.github_token.take() {
            let token = parse_value(&raw).context("mirror.github_token")?;
            config.mirror.github_token = Some(token);
        }
    }
    Ok(())
}

/// Expand `$env:NAME` and `$file:/abs/path` indirections; anything else is
/// returned as is.
pub fn parse_value(value: &str) -> Result<String> {
    if let Some(var) = value.strip_prefix("$env:") {
        match std::env::var(var) {
            Ok(v) if !v.is_empty() => Ok(v),
            _ => bail!("environment variable {var} is not set"),
        }
    } else if let Some(path) = value.strip_prefix("$file:") {
        let path = Path::new(path);
        if !path.is_file() {
            bail!("secret file not found: {}", path.display());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secret file: {}", path.display()))?;
        Ok(data.trim().to_string())
    } else {
        Ok(value.to_string())
    }
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.repo.dir.is_dir(), "repo.dir must be a directory");
    anyhow::ensure!(config.server.port != 0, "server.port must be 1-65535");

    if config.ssh.enable {
        anyhow::ensure!(config.ssh.port != 0, "ssh.port must be 1-65535");
        anyhow::ensure!(
            config.ssh.port != config.server.port,
            "ssh.port and server.port must differ"
        );
        anyhow::ensure!(!config.ssh.user.is_empty(), "ssh.user must not be empty");
        match &config.ssh.host_key {
            Some(path) => anyhow::ensure!(
                path.is_file(),
                "ssh.host_key not found: {}",
                path.display()
            ),
            None => bail!("ssh.host_key is required when ssh is enabled"),
        }
    }

    if config.mirror.enable {
        parse_duration("mirror.interval", &config.mirror.interval)?;
        anyhow::ensure!(
            config.mirror.concurrency > 0,
            "mirror.concurrency must be at least 1"
        );
    }

    config.cache.index_ttl()?;
    config.cache.summary_ttl()?;
    Ok(())
}

#[cfg(test)]
impl Config {
    /// Defaults everywhere, repositories under `dir`.
    pub fn for_repo_dir(dir: &Path) -> Self {
        Self {
            server: ServerConfig::default(),
            repo: RepoConfig {
                dir: dir.to_path_buf(),
            },
            ssh: SshConfig::default(),
            mirror: MirrorConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(
            tmp.path(),
            &format!("repo:\n  dir: {}\n", tmp.path().display()),
        );
        let config = load_config(&path).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.listen_addr(), "0.0.0.0:8080");
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.user, "git");
        assert!(!config.ssh.enable);
        assert_eq!(config.mirror.interval, "8h");
        assert_eq!(config.mirror.concurrency, 5);
        assert_eq!(config.cache.index_ttl().unwrap(), Duration::from_secs(300));
        assert_eq!(config.cache.summary_ttl().unwrap(), Duration::from_secs(60));
        assert!(config.repo.dir.is_absolute());
    }

    #[test]
    fn missing_repo_dir_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "repo:\n  dir: /definitely/not/here\n");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn ssh_requires_distinct_port_and_host_key() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().display();

        let same_port = write_config(
            tmp.path(),
            &format!("repo:\n  dir: {dir}\nserver:\n  port: 2222\nssh:\n  enable: true\n  host_key: {dir}/config.yaml\n"),
        );
        let err = load_config(&same_port).unwrap_err();
        assert!(err.to_string().contains("must differ"), "{err}");

        let no_key = write_config(
            tmp.path(),
            &format!("repo:\n  dir: {dir}\nssh:\n  enable: true\n  host_key: {dir}/missing_key\n"),
        );
        assert!(load_config(&no_key).is_err());
    }

    #[test]
    fn bad_durations_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().display();
        let path = write_config(
            tmp.path(),
            &format!("repo:\n  dir: {dir}\nmirror:\n  enable: true\n  interval: soon\n"),
        );
        assert!(load_config(&path).is_err());

        let path = write_config(
            tmp.path(),
            &format!("repo:\n  dir: {dir}\ncache:\n  index_ttl: forever\n"),
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn parse_value_plain_env_and_file() {
        assert_eq!(parse_value("qwerty123").unwrap(), "qwerty123");

        std::env::set_var("REPOHOST_TEST_SECRET_VALUE", "123");
        assert_eq!(parse_value("$env:REPOHOST_TEST_SECRET_VALUE").unwrap(), "123");
        assert!(parse_value("$env:REPOHOST_TEST_SECRET_UNSET").is_err());

        let tmp = tempfile::tempdir().unwrap();
        let secret = tmp.path().join("token");
        std::fs::write(&secret, "qwerty123\n").unwrap();
        assert_eq!(
            parse_value(&format!("$file:{}", secret.display())).unwrap(),
            "qwerty123"
        );
        assert!(parse_value("$file:/not/exists").is_err());
    }

    #[test]
    fn mirror_token_is_resolved_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().display();
        std::env::set_var("REPOHOST_TEST_GH_TOKEN", "ghp_abc");
        let path = write_config(
            tmp.path(),
            &format!("repo:\n  dir: {dir}\nmirror:\n  enable: true\n  github_token: $env:REPOHOST_TEST_GH_TOKEN\n"),
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.mirror.github_token.as_deref(), Some("ghp_abc"));
    }

    #[test]
    fn config_path_falls_back_when_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_config(tmp.path(), "repo:\n  dir: /\n");
        assert_eq!(resolve_config_path(Some(&path)), Some(path.clone()));
        // A missing user path falls through to the defaults, which do not
        // exist in the test environment's temp dir.
        let missing = tmp.path().join("nope.yaml");
        assert_ne!(resolve_config_path(Some(&missing)), Some(missing));
    }
}

//! Repository access gateway.
//!
//! A [`Repository`] is only ever handed out fully resolved: the directory is
//! a git repository and the requested revision (or HEAD) has been looked up.
//! Visibility, mirror state and the last sync time live in the repository's
//! own git config, under the `repohost` section and the `origin` remote.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::paths::{is_valid_ref, repo_name};
use super::runner::{GitCommand, GitError, Streams};
use crate::credentials::Credential;
use crate::error::{Error, Result};

const KEY_PRIVATE: &str = "repohost.private";
const KEY_LAST_SYNC: &str = "repohost.last-sync";
const KEY_MIRROR: &str = "remote.origin.mirror";
const KEY_REMOTE_URL: &str = "remote.origin.url";
const KEY_REMOTE_FETCH: &str = "remote.origin.fetch";
const ORIGIN: &str = "origin";

/// Separators for machine-read `log` and `for-each-ref` output.
const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%ae%x1f%cI%x1f%B%x1e";
const BRANCH_FORMAT: &str = "--format=%(refname:short)%1f%(objectname)%1f%1f%(objecttype)%1f%(committerdate:iso-strict)%1f%1e";
const TAG_FORMAT: &str = "--format=%(refname:short)%1f%(objectname)%1f%(*objectname)%1f%(objecttype)%1f%(creatordate:iso-strict)%1f%(contents)%1e";

/// Stock text `git init` writes into `description`.
const DEFAULT_DESCRIPTION: &str = "Unnamed repository; edit this file 'description' to name the repository";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Commit {
    pub hash: String,
    pub hash_short: String,
    pub author_name: String,
    pub author_email: String,
    pub committed: DateTime<Utc>,
    pub message: String,
}

/// A branch or tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefEntry {
    pub name: String,
    /// Commit the ref points at, peeled through annotated tags.
    pub commit: String,
    /// Tagger time for annotated tags, committer time otherwise.
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Repository {
    name: String,
    path: PathBuf,
    head: Option<String>,
}

impl Repository {
    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    /// Open the repository at `path`.  An empty `reference` means HEAD; a
    /// repository without commits opens with no head instead of failing.
    #[instrument(skip_all, fields(path = %path.display(), reference = %reference))]
    pub async fn open(path: &Path, reference: &str) -> Result<Self> {
        let name = repo_name(path);
        if !tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(Error::NotFound(name));
        }

        let head = if reference.is_empty() {
            match rev_parse(path, "HEAD").await? {
                Resolved::Commit(hash) => Some(hash),
                Resolved::Missing => None,
                Resolved::NotARepository => return Err(Error::NotFound(name)),
            }
        } else {
            if !is_valid_ref(reference) {
                return Err(Error::InvalidRef(reference.to_string()));
            }
            match rev_parse(path, &format!("{reference}^{{commit}}")).await? {
                Resolved::Commit(hash) => Some(hash),
                Resolved::Missing | Resolved::NotARepository => {
                    return Err(Error::NotFound(format!("{name}@{reference}")))
                }
            }
        };

        Ok(Self {
            name,
            path: path.to_path_buf(),
            head,
        })
    }

    /// [`open`](Self::open), refusing private repositories.  Every read path
    /// that must respect visibility goes through here.
    pub async fn open_public(path: &Path, reference: &str) -> Result<Self> {
        let repo = Self::open(path, reference).await?;
        if repo.is_private().await? {
            return Err(Error::Private);
        }
        Ok(repo)
    }

    /// Create a bare repository.  Fails if anything already exists at `path`.
    #[instrument(fields(path = %path.display()))]
    pub async fn init(path: &Path) -> Result<Self> {
        if tokio::fs::symlink_metadata(path).await.is_ok() {
            return Err(Error::Configuration(format!(
                "repository already exists: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        GitCommand::detached("init")
            .args(["--bare", "--quiet"])
            .arg(path.as_os_str())
            .checked(&CancellationToken::new())
            .await?;
        info!("initialised bare repository");
        Self::open(path, "").await
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolved commit, `None` for an empty repository.
    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    // -----------------------------------------------------------------------
    // Persisted flags
    // -----------------------------------------------------------------------

    pub async fn is_private(&self) -> Result<bool> {
        Ok(self.read_config(KEY_PRIVATE).await?.as_deref() == Some("true"))
    }

    pub async fn set_private(&self, private: bool) -> Result<()> {
        if private {
            self.write_config(KEY_PRIVATE, "true").await
        } else {
            self.unset_config(KEY_PRIVATE).await
        }
    }

    pub async fn is_mirror(&self) -> Result<bool> {
        Ok(self.read_config(KEY_MIRROR).await?.as_deref() == Some("true"))
    }

    pub async fn remote_url(&self) -> Result<Option<String>> {
        self.read_config(KEY_REMOTE_URL).await
    }

    /// Point `origin` at `url` with mirror semantics.
    pub async fn set_mirror_remote(&self, url: &str) -> Result<()> {
        self.write_config(KEY_REMOTE_URL, url).await?;
        self.write_config(KEY_REMOTE_FETCH, "+refs/*:refs/*").await?;
        self.write_config(KEY_MIRROR, "true").await
    }

    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.read_config(KEY_LAST_SYNC).await? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| Error::Configuration(format!("{}: bad last-sync {raw:?}: {e}", self.name)))
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> Result<()> {
        self.write_config(KEY_LAST_SYNC, &at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .await
    }

    // -----------------------------------------------------------------------
    // Description
    // -----------------------------------------------------------------------

    /// Contents of the `description` file; git's placeholder reads as empty.
    pub async fn description(&self) -> Result<String> {
        match tokio::fs::read_to_string(self.path.join("description")).await {
            Ok(d) if d.contains(DEFAULT_DESCRIPTION) => Ok(String::new()),
            Ok(d) => Ok(d.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_description(&self, description: &str) -> Result<()> {
        tokio::fs::write(self.path.join("description"), format!("{}\n", description.trim()))
            .await?;
        Ok(())
    }

    /// Committer time of the resolved head.
    pub async fn last_commit_time(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(head) = &self.head else {
            return Ok(None);
        };
        let raw = GitCommand::new(&self.path, "show")
            .args(["-s", "--format=%cI", head.as_str()])
            .checked(&CancellationToken::new())
            .await?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| Error::Configuration(format!("{}: bad commit time {raw:?}: {e}", self.name)))
    }

    // -----------------------------------------------------------------------
    // History and refs
    // -----------------------------------------------------------------------

    /// Up to `limit` commits reachable from the resolved head, newest first.
    #[instrument(skip(self), fields(repo = %self.name))]
    pub async fn commits(&self, limit: usize) -> Result<Vec<Commit>> {
        let Some(head) = &self.head else {
            return Ok(Vec::new());
        };
        let raw = GitCommand::new(&self.path, "log")
            .arg(format!("--max-count={limit}"))
            .args(["--date-order", LOG_FORMAT, head.as_str(), "--"])
            .checked(&CancellationToken::new())
            .await?;
        records(&raw).map(|r| self.parse_commit(r)).collect()
    }

    /// Local branches by name.
    pub async fn branches(&self) -> Result<Vec<RefEntry>> {
        let raw = GitCommand::new(&self.path, "for-each-ref")
            .args(["--sort=refname", BRANCH_FORMAT, "refs/heads"])
            .checked(&CancellationToken::new())
            .await?;
        self.parse_refs(&raw)
    }

    /// Tags, most recent first.  Tags that do not reach a commit are left out.
    pub async fn tags(&self) -> Result<Vec<RefEntry>> {
        let raw = GitCommand::new(&self.path, "for-each-ref")
            .args(["--sort=-creatordate", TAG_FORMAT, "refs/tags"])
            .checked(&CancellationToken::new())
            .await?;
        self.parse_refs(&raw)
    }

    /// Short name of the branch HEAD points at, `None` when detached.
    pub async fn default_branch(&self) -> Result<Option<String>> {
        let out = GitCommand::new(&self.path, "symbolic-ref")
            .args(["--quiet", "--short", "HEAD"])
            .output(&CancellationToken::new())
            .await?;
        Ok(match out.code() {
            Some(0) => Some(out.stdout_trimmed()).filter(|b| !b.is_empty()),
            _ => None,
        })
    }

    fn parse_commit(&self, record: &str) -> Result<Commit> {
        let fields: Vec<&str> = record.splitn(5, FIELD_SEP).collect();
        let [hash, author_name, author_email, committed, message] = fields[..] else {
            return Err(Error::Configuration(format!(
                "{}: malformed log record {record:?}",
                self.name
            )));
        };
        Ok(Commit {
            hash: hash.to_string(),
            hash_short: hash.chars().take(7).collect(),
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
            committed: self.parse_time("commit time", committed)?,
            message: message.trim_end().to_string(),
        })
    }

    /// Records are `name, object, peeled object, type, date, message`.
    fn parse_refs(&self, raw: &str) -> Result<Vec<RefEntry>> {
        let mut refs = Vec::new();
        for record in records(raw) {
            let fields: Vec<&str> = record.splitn(6, FIELD_SEP).collect();
            let [name, object, peeled, kind, updated, message] = fields[..] else {
                return Err(Error::Configuration(format!(
                    "{}: malformed ref record {record:?}",
                    self.name
                )));
            };
            if updated.is_empty() {
                debug!(repo = %self.name, %name, "ref does not point at a commit");
                continue;
            }
            let commit = if peeled.is_empty() { object } else { peeled };
            refs.push(RefEntry {
                name: name.to_string(),
                commit: commit.to_string(),
                updated: self.parse_time("ref time", updated)?,
                message: (kind == "tag").then(|| message.trim_end().to_string()),
            });
        }
        Ok(refs)
    }

    fn parse_time(&self, what: &str, raw: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Configuration(format!("{}: bad {what} {raw:?}: {e}", self.name)))
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Fetch `origin` (prune, force, tags).  A credential travels through
    /// git's environment config, never argv.  If the repository had no
    /// commits, HEAD is then pointed at the upstream default branch.
    #[instrument(skip(self, credential, cancel), fields(repo = %self.name))]
    pub async fn fetch(
        &self,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let remote = self.remote_url().await?.unwrap_or_default();
        let upstream = |reason: String| Error::Upstream {
            remote: remote.clone(),
            reason,
        };

        let mut log = Vec::new();
        let fetch = with_credential(
            GitCommand::new(&self.path, "fetch").args(["--prune", "--force", "--tags", ORIGIN]),
            credential,
        );
        match fetch.run(Streams::new(&mut log), cancel).await {
            Ok(()) => debug!(output = %String::from_utf8_lossy(&log).trim(), "fetch finished"),
            Err(GitError::Cancelled { .. }) => return Err(upstream("cancelled".into())),
            Err(e) => {
                return Err(upstream(format!(
                    "{e}: {}",
                    String::from_utf8_lossy(&log).trim()
                )))
            }
        }

        if self.is_empty() {
            self.adopt_remote_head(credential, cancel).await?;
        }
        Ok(())
    }

    async fn adopt_remote_head(
        &self,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let listing = with_credential(
            GitCommand::new(&self.path, "ls-remote").args(["--symref", ORIGIN, "HEAD"]),
            credential,
        )
        .checked(cancel)
        .await?;

        let Some(target) = parse_symref_head(&listing) else {
            warn!(repo = %self.name, "upstream did not advertise a symbolic HEAD");
            return Ok(());
        };
        GitCommand::new(&self.path, "symbolic-ref")
            .args(["HEAD", target])
            .checked(cancel)
            .await?;
        info!(repo = %self.name, head = %target, "set HEAD from upstream");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Config plumbing
    // -----------------------------------------------------------------------

    async fn read_config(&self, key: &str) -> Result<Option<String>> {
        let out = GitCommand::new(&self.path, "config")
            .args(["--get", key])
            .output(&CancellationToken::new())
            .await?;
        match out.code() {
            Some(0) => Ok(Some(out.stdout_trimmed())),
            // Key not set.
            Some(1) => Ok(None),
            _ => Err(GitError::Exit {
                operation: "config".into(),
                status: out.status,
                stderr: out.stderr,
            }
            .into()),
        }
    }

    async fn write_config(&self, key: &str, value: &str) -> Result<()> {
        GitCommand::new(&self.path, "config")
            .args([key, value])
            .checked(&CancellationToken::new())
            .await?;
        Ok(())
    }

    async fn unset_config(&self, key: &str) -> Result<()> {
        let out = GitCommand::new(&self.path, "config")
            .args(["--unset", key])
            .output(&CancellationToken::new())
            .await?;
        match out.code() {
            // 5: nothing to unset.
            Some(0) | Some(5) => Ok(()),
            _ => Err(GitError::Exit {
                operation: "config".into(),
                status: out.status,
                stderr: out.stderr,
            }
            .into()),
        }
    }
}

enum Resolved {
    Commit(String),
    Missing,
    NotARepository,
}

async fn rev_parse(path: &Path, revision: &str) -> Result<Resolved> {
    let out = GitCommand::new(path, "rev-parse")
        .args(["--verify", "--quiet", revision])
        .output(&CancellationToken::new())
        .await?;
    Ok(match out.code() {
        Some(0) => Resolved::Commit(out.stdout_trimmed()),
        Some(1) => Resolved::Missing,
        _ => Resolved::NotARepository,
    })
}

fn with_credential(cmd: GitCommand, credential: Option<&Credential>) -> GitCommand {
    match credential {
        Some(c) => c
            .git_env()
            .into_iter()
            .fold(cmd, |cmd, (key, value)| cmd.env(&key, &value)),
        None => cmd,
    }
}

/// Non-empty records of `RECORD_SEP`-terminated output.
fn records(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(RECORD_SEP)
        .map(|r| r.trim_start_matches('\n'))
        .filter(|r| !r.is_empty())
}

/// Extract `refs/heads/x` from `ref: refs/heads/x\tHEAD`.
fn parse_symref_head(listing: &str) -> Option<&str> {
    listing.lines().find_map(|line| {
        let (target, name) = line.strip_prefix("ref: ")?.split_once('\t')?;
        (name == "HEAD" && target.starts_with("refs/")).then_some(target)
    })
}

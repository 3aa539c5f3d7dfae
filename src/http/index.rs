//! JSON views over the repository root.
//!
//! Both are derived from git state on a miss and served from a
//! [`TtlCache`](crate::cache::TtlCache) until they expire, so a busy index
//! page costs one directory scan per TTL.

use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::handler::AppError;
use crate::error::{Error, Result};
use crate::git::paths::{normalize_name, REPO_SUFFIX};
use crate::git::{self, Repository};
use crate::metrics::View;
use crate::AppState;

pub const INDEX_KEY: &str = "index";

#[derive(Debug, Clone, Serialize)]
pub struct RepoSummary {
    pub name: String,
    pub description: String,
    pub head: Option<String>,
    pub last_commit: Option<DateTime<Utc>>,
    pub mirror: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}

impl RepoSummary {
    pub async fn load(repo: &Repository) -> Result<Self> {
        let mirror = repo.is_mirror().await?;
        let (remote, last_sync) = if mirror {
            (repo.remote_url().await?, repo.last_sync().await?)
        } else {
            (None, None)
        };
        Ok(Self {
            name: repo.name().to_string(),
            description: repo.description().await?,
            head: repo.head().map(str::to_string),
            last_commit: repo.last_commit_time().await?,
            mirror,
            remote,
            last_sync,
        })
    }
}

/// Every public repository under `root`, most recent commit first.
/// Entries that do not open as repositories, or whose summary cannot be
/// built, are skipped.
pub async fn list_public(root: &Path) -> Result<Vec<RepoSummary>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut repos = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_repo_dir = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(REPO_SUFFIX) && !n.starts_with('.'));
        if !is_repo_dir {
            continue;
        }
        let repo = match Repository::open_public(&path, "").await {
            Ok(repo) => repo,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping directory");
                continue;
            }
        };
        match RepoSummary::load(&repo).await {
            Ok(summary) => repos.push(summary),
            Err(e) => warn!(repo = %repo.name(), error = %e, "skipping repository in index"),
        }
    }
    // Newest first; repositories without commits sink to the bottom.
    repos.sort_by(|a, b| b.last_commit.cmp(&a.last_commit).then(a.name.cmp(&b.name)));
    Ok(repos)
}

/// `GET /`
#[instrument(skip(state))]
pub async fn handle_index(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    if let Some(repos) = state.index_cache.get(INDEX_KEY) {
        state.metrics.metrics.record_lookup(View::Index, true);
        return Ok(Json(&*repos).into_response());
    }
    state.metrics.metrics.record_lookup(View::Index, false);

    let repos = Arc::new(list_public(&state.config.repo.dir).await?);
    state.index_cache.set(INDEX_KEY, Arc::clone(&repos));
    Ok(Json(&*repos).into_response())
}

/// `GET /{name}`
#[instrument(skip(state), fields(%name))]
pub async fn handle_summary(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, AppError> {
    let key = normalize_name(&name).to_string();
    if let Some(summary) = state.summary_cache.get(&key) {
        state.metrics.metrics.record_lookup(View::Summary, true);
        return Ok(Json(summary).into_response());
    }
    state.metrics.metrics.record_lookup(View::Summary, false);

    let path = git::resolve(&state.config.repo.dir, &name)
        .map_err(|_| AppError::NotFound)?;
    let repo = Repository::open_public(&path, "").await?;
    let summary = RepoSummary::load(&repo).await?;
    state.summary_cache.set(key, summary.clone());
    Ok(Json(summary).into_response())
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        match err {
            e if e.is_not_found() => AppError::NotFound,
            Error::InvalidPath(_) => AppError::NotFound,
            Error::InvalidRef(r) => AppError::BadRequest(format!("Invalid reference: {r}")),
            e => AppError::Internal(e.into()),
        }
    }
}

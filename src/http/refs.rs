//! Per-repository JSON views: branches and tags, and the commit log of a
//! revision.  Both go through the public gateway and are cached per key
//! for `cache.summary_ttl`.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{instrument, warn};

use super::handler::AppError;
use crate::error::Result;
use crate::git::paths::normalize_name;
use crate::git::repo::{Commit, RefEntry};
use crate::git::{self, Repository};
use crate::metrics::View;
use crate::AppState;

/// Most commits returned by one log view.
pub const LOG_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct RefsView {
    pub name: String,
    pub default_branch: Option<String>,
    pub branches: Vec<RefEntry>,
    pub tags: Vec<RefEntry>,
}

impl RefsView {
    pub async fn load(repo: &Repository) -> Result<Self> {
        // A repository without tags is still worth showing.
        let tags = repo.tags().await.unwrap_or_else(|e| {
            warn!(repo = %repo.name(), error = %e, "failed to list tags");
            Vec::new()
        });
        Ok(Self {
            name: repo.name().to_string(),
            default_branch: repo.default_branch().await?,
            branches: repo.branches().await?,
            tags,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogView {
    pub name: String,
    pub reference: String,
    pub commits: Vec<Commit>,
}

async fn open_public(state: &AppState, name: &str, reference: &str) -> Result<Repository, AppError> {
    let path = git::resolve(&state.config.repo.dir, name).map_err(|_| AppError::NotFound)?;
    Ok(Repository::open_public(&path, reference).await?)
}

/// `GET /{name}/refs`
#[instrument(skip(state), fields(%name))]
pub async fn handle_refs(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, AppError> {
    let key = normalize_name(&name).to_string();
    if let Some(view) = state.refs_cache.get(&key) {
        state.metrics.metrics.record_lookup(View::Refs, true);
        return Ok(Json(&*view).into_response());
    }
    state.metrics.metrics.record_lookup(View::Refs, false);

    let repo = open_public(&state, &name, "").await?;
    let view = Arc::new(RefsView::load(&repo).await?);
    state.refs_cache.set(key, Arc::clone(&view));
    Ok(Json(&*view).into_response())
}

/// `GET /{name}/log/{*reference}`
#[instrument(skip(state), fields(%name, %reference))]
pub async fn handle_log(
    State(state): State<Arc<AppState>>,
    AxumPath((name, reference)): AxumPath<(String, String)>,
) -> Result<Response, AppError> {
    if !git::is_valid_ref(&reference) {
        return Err(AppError::BadRequest(format!("Invalid reference: {reference}")));
    }

    let key = format!("{}@{reference}", normalize_name(&name));
    if let Some(view) = state.log_cache.get(&key) {
        state.metrics.metrics.record_lookup(View::Log, true);
        return Ok(Json(&*view).into_response());
    }
    state.metrics.metrics.record_lookup(View::Log, false);

    let repo = open_public(&state, &name, &reference).await?;
    let view = Arc::new(LogView {
        name: repo.name().to_string(),
        commits: repo.commits(LOG_LIMIT).await?,
        reference,
    });
    state.log_cache.set(key, Arc::clone(&view));
    Ok(Json(&*view).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit, init_bare, require_git, tag};

    #[tokio::test]
    async fn refs_view_collects_branches_and_tags() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        let path = init_bare(root.path(), "demo");
        let tip = commit(&path, "hello");
        tag(&path, "v1", &tip, Some("First"));

        let repo = Repository::open(&path, "").await.unwrap();
        let view = RefsView::load(&repo).await.unwrap();
        assert_eq!(view.name, "demo");
        assert_eq!(view.default_branch.as_deref(), Some("main"));
        assert_eq!(view.branches.len(), 1);
        assert_eq!(view.tags[0].name, "v1");
        assert_eq!(view.tags[0].commit, tip);
    }
}

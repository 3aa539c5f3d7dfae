use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::config::Config;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub repo_dir: CheckResult,
    pub git: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: Option<String>) -> Self {
        Self { ok: true, detail }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_repo_dir(dir: &Path) -> CheckResult {
    match tokio::fs::read_dir(dir).await {
        Ok(_) => CheckResult::healthy(None),
        Err(e) => CheckResult::unhealthy(format!("cannot read {}: {e}", dir.display())),
    }
}

async fn check_git() -> CheckResult {
    match crate::git::commands::version().await {
        Ok(version) => CheckResult::healthy(Some(version)),
        Err(e) => CheckResult::unhealthy(format!("git unavailable: {e}")),
    }
}

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.repo_dir.ok && checks.git.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 when every check passes, 503
/// otherwise.
pub async fn health_handler(State(config): State<Arc<Config>>) -> impl IntoResponse {
    let (repo_dir, git) = tokio::join!(check_repo_dir(&config.repo.dir), check_git());

    let checks = HealthChecks { repo_dir, git };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

//! `GET /{name}/archive/{*reference}`: a gzipped tarball of one revision.
//!
//! The reference is checked against the ref allow-list before any git
//! process starts, so nothing the client sends can become a git option.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
};
use tracing::{instrument, warn};

use super::handler::AppError;
use super::transport::run_protocol;
use crate::git::commands::ARCHIVE_FORMAT;
use crate::git::is_valid_ref;
use crate::git::paths::normalize_name;
use crate::protocol::Operation;
use crate::AppState;

pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

/// Accepts both `archive/main` and `archive/main.tar.gz`.
fn parse_reference(rest: &str) -> &str {
    rest.strip_suffix(&format!(".{ARCHIVE_FORMAT}"))
        .unwrap_or(rest)
}

/// `attachment; filename="{name}-{ref}.tar.gz"` with `/` in the ref
/// flattened to `-`.
pub fn content_disposition(name: &str, reference: &str) -> String {
    format!(
        "attachment; filename=\"{}-{}.{ARCHIVE_FORMAT}\"",
        normalize_name(name),
        reference.replace('/', "-")
    )
}

#[instrument(skip(state), fields(%name, %rest))]
pub async fn handle_archive(
    State(state): State<Arc<AppState>>,
    Path((name, rest)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let reference = parse_reference(&rest);
    if !is_valid_ref(reference) {
        warn!(reference, "rejected archive reference");
        return Err(AppError::BadRequest(format!("Invalid reference: {reference}")));
    }

    let operation = Operation::Archive {
        reference: reference.to_string(),
    };
    Ok(run_protocol(&state, name, operation, None, None).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_suffix_is_optional() {
        assert_eq!(parse_reference("main"), "main");
        assert_eq!(parse_reference("main.tar.gz"), "main");
        assert_eq!(parse_reference("release/1.2.tar.gz"), "release/1.2");
    }

    #[test]
    fn disposition_flattens_slashes() {
        assert_eq!(
            content_disposition("tools.git", "feature/x"),
            "attachment; filename=\"tools-feature-x.tar.gz\""
        );
    }
}

//! Smart-HTTP side of the protocol state machine.
//!
//! The protocol session runs in its own task.  The handler waits only for
//! the response head: either the session committed to `200` in
//! [`Transport::begin`], or it was rejected and nothing will follow.  The
//! body is the session's output channel; dropping it cancels the session.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::archive::{content_disposition, ARCHIVE_CONTENT_TYPE};
use crate::error::Result;
use crate::git::{BoxedReader, Repository};
use crate::metrics;
use crate::protocol::stream::CHANNEL_CAPACITY;
use crate::protocol::{
    self, ChunkStream, ChunkWriter, Operation, ProtocolRequest, Rejection, Transport,
};
use crate::AppState;

type Head = std::result::Result<HeaderMap, Rejection>;

pub struct HttpTransport {
    head: Option<oneshot::Sender<Head>>,
}

impl HttpTransport {
    fn send_head(&mut self, head: Head) {
        if let Some(tx) = self.head.take() {
            // The handler is gone when this fails; cancellation follows.
            let _ = tx.send(head);
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> metrics::Transport {
        metrics::Transport::Http
    }

    fn stateless_rpc(&self) -> bool {
        true
    }

    async fn begin(&mut self, operation: &Operation, repo: &Repository) {
        self.send_head(Ok(response_headers(operation, repo.name())));
    }

    async fn reject(mut self, rejection: Rejection, _output: ChunkWriter) {
        self.send_head(Err(rejection));
    }

    async fn finish(mut self, result: Result<()>, output: ChunkWriter) {
        if let Err(e) = result {
            // Status is already on the wire.  Break the body so the client
            // sees a failed transfer rather than a short one.
            output.abort(std::io::Error::other(e.to_string())).await;
        }
        // Only reached without begin() if the session bailed early.
        self.send_head(Err(Rejection::Internal));
    }
}

fn response_headers(operation: &Operation, name: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let content_type = match operation {
        Operation::AdvertiseRefs => "application/x-git-upload-pack-advertisement",
        Operation::UploadPack => "application/x-git-upload-pack-result",
        Operation::ReceivePack => "application/x-git-receive-pack-result",
        Operation::Archive { .. } => ARCHIVE_CONTENT_TYPE,
        Operation::UploadArchive => "application/octet-stream",
    };
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));

    match operation {
        Operation::Archive { reference } => {
            if let Ok(value) = HeaderValue::from_str(&content_disposition(name, reference)) {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }
        _ => {
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }
    }
    headers
}

/// Plain-text response for a request that never reached git.
pub fn rejection_response(rejection: Rejection) -> Response {
    let status = match rejection {
        Rejection::NotFound | Rejection::Unauthorized => StatusCode::NOT_FOUND,
        Rejection::ReadOnlyMirror => StatusCode::FORBIDDEN,
        Rejection::InvalidRef => StatusCode::BAD_REQUEST,
        Rejection::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, rejection.message()).into_response()
}

/// Run one protocol request for an HTTP caller and turn it into a response.
/// HTTP callers are never authorized.
pub async fn run_protocol(
    state: &AppState,
    name: String,
    operation: Operation,
    git_protocol: Option<String>,
    input: Option<BoxedReader>,
) -> Response {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (head_tx, head_rx) = oneshot::channel();
    let cancel = CancellationToken::new();
    // Fires if this handler is dropped before the body takes over.
    let guard = cancel.clone().drop_guard();

    let request = ProtocolRequest {
        repo: name,
        operation,
        authorized: false,
        git_protocol,
        input,
        output: ChunkWriter::new(tx),
        errors: None,
        cancel,
    };
    let transport = HttpTransport {
        head: Some(head_tx),
    };
    let root = state.config.repo.dir.clone();
    let metrics = state.metrics.clone();
    tokio::spawn(async move {
        let outcome = protocol::serve(&root, &metrics, transport, request).await;
        debug!(?outcome, "http protocol session ended");
    });

    match head_rx.await {
        Ok(Ok(headers)) => {
            let body = Body::from_stream(ChunkStream::new(rx, Some(guard)));
            (StatusCode::OK, headers, body).into_response()
        }
        Ok(Err(rejection)) => rejection_response(rejection),
        Err(_) => {
            error!("protocol session ended without a response");
            rejection_response(Rejection::Internal)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_responses_are_not_cached() {
        let headers = response_headers(&Operation::UploadPack, "demo");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "application/x-git-upload-pack-result"
        );
    }

    #[test]
    fn archive_headers_name_the_file() {
        let op = Operation::Archive {
            reference: "v1.0".to_string(),
        };
        let headers = response_headers(&op, "demo");
        assert_eq!(headers[header::CONTENT_TYPE], "application/gzip");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"demo-v1.0.tar.gz\""
        );
    }

    #[test]
    fn hidden_repositories_are_plain_404() {
        let resp = rejection_response(Rejection::Unauthorized);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            rejection_response(Rejection::InvalidRef).status(),
            StatusCode::BAD_REQUEST
        );
    }
}

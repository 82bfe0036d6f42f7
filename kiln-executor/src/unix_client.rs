//! HTTP client for the Firecracker management API.
//!
//! Firecracker's control surface lives on a Unix domain socket, which
//! reqwest cannot dial, so exchanges go through hyper directly: one
//! connection per request, torn down when the exchange ends.
//!
//! Status handling is split between the two call patterns: configuration
//! `PUT`s treat any non-2xx as fatal, while `GET`s hand the status back so
//! the boot choreography can poll instance state itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::ExecutorError;

/// Outcome of one control-socket exchange.
#[derive(Debug)]
pub(crate) struct ApiResponse {
    pub(crate) status: StatusCode,
    pub(crate) body: String,
}

impl ApiResponse {
    /// Promote a non-2xx answer to a hard error, annotated with the path.
    fn require_success(self, uri_path: &str) -> Result<String, ExecutorError> {
        if self.status.is_success() {
            Ok(self.body)
        } else {
            Err(ExecutorError::ApiError(format!(
                "{uri_path} answered {}: {}",
                self.status, self.body
            )))
        }
    }
}

/// Client bound to one VM's control socket.
#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    socket_path: PathBuf,
}

impl ApiClient {
    /// Hard cap on a single exchange; the API answers in microseconds when
    /// the hypervisor is alive, so anything slower means it is wedged.
    const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

    pub(crate) fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// `PUT` a JSON document to an API path, requiring a 2xx answer.
    pub(crate) async fn put(
        &self,
        uri_path: &str,
        body: serde_json::Value,
    ) -> Result<(), ExecutorError> {
        self.exchange(Method::PUT, uri_path, Some(body))
            .await?
            .require_success(uri_path)
            .map(|_| ())
    }

    /// `GET` an API path, handing status and body back to the caller.
    pub(crate) async fn get(&self, uri_path: &str) -> Result<ApiResponse, ExecutorError> {
        self.exchange(Method::GET, uri_path, None).await
    }

    async fn exchange(
        &self,
        method: Method,
        uri_path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse, ExecutorError> {
        tokio::time::timeout(
            Self::EXCHANGE_TIMEOUT,
            self.exchange_inner(method, uri_path, body),
        )
        .await
        .map_err(|_| {
            ExecutorError::ApiError(format!(
                "{uri_path}: no answer within {:?}",
                Self::EXCHANGE_TIMEOUT
            ))
        })?
    }

    async fn exchange_inner(
        &self,
        method: Method,
        uri_path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse, ExecutorError> {
        let payload = body
            .map(|document| Bytes::from(document.to_string()))
            .unwrap_or_default();

        // Assemble the request before touching the socket; builder errors
        // are caller bugs and should not read as connectivity failures.
        let mut request = Request::builder()
            .method(method)
            .uri(uri_path)
            .header(header::HOST, "localhost");
        if !payload.is_empty() {
            request = request
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::CONTENT_LENGTH, payload.len());
        }
        let request = request
            .body(Full::new(payload))
            .map_err(|e| ExecutorError::ApiError(format!("assemble {uri_path} request: {e}")))?;

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            ExecutorError::ApiError(format!(
                "control socket {} unreachable: {e}",
                self.socket_path.display()
            ))
        })?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ExecutorError::ApiError(format!("handshake with hypervisor: {e}")))?;

        // The connection outlives the exchange only long enough to flush it.
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ExecutorError::ApiError(format!("{uri_path}: {e}")))?;

        let status = response.status();
        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ExecutorError::ApiError(format!("{uri_path}: reading body: {e}")))?;

        Ok(ApiResponse {
            status,
            body: String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        })
    }

    pub(crate) fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exchange_against_a_missing_socket_is_an_api_error() {
        let client = ApiClient::new("/tmp/kiln-no-such-socket.sock");
        let result = client.get("/").await;
        assert!(
            matches!(result, Err(ExecutorError::ApiError(_))),
            "a dead control socket must surface as ApiError"
        );
    }

    #[tokio::test]
    async fn put_rejects_non_success_status() {
        // A Unix socket server that answers every request with 400.
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("tempdir failed: {e}"),
        };
        let socket_path = dir.path().join("api.sock");
        let listener = match tokio::net::UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) => panic!("bind failed: {e}"),
        };
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 2048];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 400 Bad Request\r\ncontent-length: 9\r\n\r\nbad stuff",
                        )
                        .await;
                });
            }
        });

        let client = ApiClient::new(&socket_path);
        let result = client
            .put("/machine-config", serde_json::json!({"vcpu_count": 1}))
            .await;
        match result {
            Err(ExecutorError::ApiError(msg)) => {
                assert!(msg.contains("400"), "error must carry the status: {msg}");
                assert!(msg.contains("bad stuff"), "error must carry the body: {msg}");
            }
            other => panic!("expected ApiError, got {other:?}"),
        }

        // A GET against the same server hands the status back instead.
        let response = match client.get("/").await {
            Ok(r) => r,
            Err(e) => panic!("get failed: {e}"),
        };
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body, "bad stuff");
    }
}

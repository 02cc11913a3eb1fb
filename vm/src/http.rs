use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HOST;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, trace};

/// Upper bound on one exchange, from connect to the last body byte.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("no response from '{socket}' for '{path}' within {timeout:?}")]
    Timeout {
        socket: PathBuf,
        path: String,
        timeout: Duration,
    },

    #[error("failed to connect to '{socket}'")]
    Connect {
        socket: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP exchange with '{socket}' failed")]
    Hyper {
        socket: PathBuf,
        #[source]
        source: hyper::Error,
    },

    #[error("failed to build request for '{path}'")]
    Request {
        path: String,
        #[source]
        source: hyper::http::Error,
    },

    #[error("failed to decode response from '{path}'")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct UnixHttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl UnixHttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self, path: &str) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|source| HttpError::Decode {
            path: path.to_string(),
            source,
        })
    }
}

/// One HTTP/1 request over a unix socket, on a fresh connection.
pub async fn request(
    socket: &Path,
    method: Method,
    path: &str,
) -> Result<UnixHttpResponse, HttpError> {
    request_with_timeout(socket, method, path, HTTP_REQUEST_TIMEOUT).await
}

pub async fn request_with_timeout(
    socket: &Path,
    method: Method,
    path: &str,
    timeout: Duration,
) -> Result<UnixHttpResponse, HttpError> {
    tokio::time::timeout(timeout, exchange(socket, method, path))
        .await
        .map_err(|_| HttpError::Timeout {
            socket: socket.to_path_buf(),
            path: path.to_string(),
            timeout,
        })?
}

async fn exchange(
    socket: &Path,
    method: Method,
    path: &str,
) -> Result<UnixHttpResponse, HttpError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|source| HttpError::Connect {
            socket: socket.to_path_buf(),
            source,
        })?;
    let hyper_error = |source| HttpError::Hyper {
        socket: socket.to_path_buf(),
        source,
    };

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(hyper_error)?;
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            debug!(%error, "Unix socket connection closed with error");
        }
    });

    let req = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, "localhost")
        .body(Full::new(Bytes::new()))
        .map_err(|source| HttpError::Request {
            path: path.to_string(),
            source,
        })?;

    let response = sender.send_request(req).await.map_err(hyper_error)?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(hyper_error)?
        .to_bytes();
    trace!(socket = %socket.display(), path, %status, "Unix socket response");

    Ok(UnixHttpResponse { status, body })
}

pub async fn get(socket: &Path, path: &str) -> Result<UnixHttpResponse, HttpError> {
    request(socket, Method::GET, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_get_reads_status_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("rest.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nOK")
                .await
                .unwrap();
        });

        let response = get(&socket, "/_ping").await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "OK");
    }

    #[tokio::test]
    async fn test_missing_socket_is_a_connect_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = get(&dir.path().join("absent.sock"), "/_ping").await;
        assert!(matches!(result, Err(HttpError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        // accepts and reads, never answers
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            std::future::pending::<()>().await;
        });

        let result =
            request_with_timeout(&socket, Method::GET, "/vm/state", Duration::from_millis(200))
                .await;
        match result {
            Err(HttpError::Timeout { path, timeout, .. }) => {
                assert_eq!(path, "/vm/state");
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        server.abort();
    }
}

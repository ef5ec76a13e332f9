//! Network transport the fetch strategies call into
//!
//! A transport-level failure (DNS, connect, timeout) is an `Err`. A non-2xx
//! response that was successfully received is an `Ok` carrying that status;
//! strategies only fall back to the cache on the former.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;

use crate::request::{Request, Response};

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// DNS resolution or connection establishment failed
    #[error("connection failed: {0}")]
    Connect(String),

    /// The transport's timeout elapsed
    #[error("request timed out")]
    Timeout,

    /// Any other failure before a complete response was received
    #[error("request failed: {0}")]
    Request(String),

    /// The in-flight fetch was dropped before producing a result
    #[error("request aborted before completion")]
    Aborted,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Fetches a request from the network
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Transport backed by a `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client })
    }

    /// Create a new HttpTransport with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use url::Url;

    /// Serves one canned HTTP/1.1 response and returns the raw request text
    async fn serve_once(response: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), handle)
    }

    #[tokio::test]
    async fn test_fetch_returns_status_headers_and_body() {
        let (base, server) = serve_once(
            "HTTP/1.1 201 Created\r\nContent-Length: 2\r\nX-Test: yes\r\nConnection: close\r\n\r\nok",
        )
        .await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let request = Request::get(base.join("/api/items").unwrap()).with_header("X-Caller", "test");
        let response = transport.fetch(&request).await.expect("fetch should succeed");

        assert_eq!(response.status, 201);
        assert_eq!(response.header("x-test"), Some("yes"));
        assert_eq!(&response.body[..], b"ok");

        let raw = server.await.unwrap().to_ascii_lowercase();
        assert!(raw.starts_with("get /api/items "));
        assert!(raw.contains("x-caller: test"));
    }

    #[tokio::test]
    async fn test_application_errors_are_responses() {
        let (base, _server) = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom",
        )
        .await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let response = transport.fetch(&Request::get(base)).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = transport.fetch(&Request::get(url)).await.unwrap_err();

        assert!(
            matches!(err, TransportError::Connect(_) | TransportError::Request(_)),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let err = transport.fetch(&Request::get(url)).await.unwrap_err();

        assert_eq!(err, TransportError::Timeout);
    }
}

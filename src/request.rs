//! Request and response descriptors exchanged between callers, the gateway, and the transport
//!
//! The cache never interprets a response beyond its status code: bodies are opaque
//! bytes and headers are an ordered list of name/value pairs.

use std::fmt;

use bytes::Bytes;
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// Status returned when a static asset is neither cached nor reachable
pub const ASSET_UNAVAILABLE_STATUS: u16 = 503;

/// Body of the synthesized unavailable-asset response
const ASSET_UNAVAILABLE_BODY: &str = "asset unavailable offline";

/// An outbound request presented to the gateway
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Absolute destination URL
    pub url: Url,
    /// Request headers, in the order the caller supplied them
    pub headers: Vec<(String, String)>,
    /// Whether the request is a page navigation rather than a subresource fetch
    pub navigate: bool,
}

impl Request {
    /// Creates a request with no headers
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            navigate: false,
        }
    }

    /// Creates a `GET` request for the given URL
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Creates a `GET` page navigation for the given URL
    pub fn navigation(url: Url) -> Self {
        Self {
            navigate: true,
            ..Self::get(url)
        }
    }

    /// Appends a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Whether this request is a page navigation
    pub fn is_navigation(&self) -> bool {
        self.navigate
    }

    /// Whether the declared accept type includes an HTML media type
    pub fn accepts_html(&self) -> bool {
        self.header("accept").is_some_and(|accept| {
            accept
                .split(',')
                .filter_map(|part| part.split(';').next())
                .any(|media| {
                    let media = media.trim();
                    media.eq_ignore_ascii_case("text/html")
                        || media.eq_ignore_ascii_case("application/xhtml+xml")
                })
        })
    }

    /// Canonical cache identity of this request
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.url)
    }
}

/// A response received from the transport or replayed from the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers in received order
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Bytes,
}

impl Response {
    /// Creates a response with no headers
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Appends a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first header with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Response served for a static asset that is neither cached nor reachable
    pub fn asset_unavailable() -> Self {
        Self::new(ASSET_UNAVAILABLE_STATUS, ASSET_UNAVAILABLE_BODY)
            .with_header("content-type", "text/plain; charset=utf-8")
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Canonical identity of a cacheable request: method plus normalized absolute URL
///
/// URL parsing already lowercases the scheme and host, drops default ports, and
/// resolves dot segments. The fragment never reaches the server, so it is removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    /// Builds the key for a method and URL
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.as_str(), url))
    }

    /// The canonical key text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 of the key, used as the on-disk entry name
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Request descriptors, captured response records and header lists.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;

use crate::error::{CacheError, CacheResult};

// ==================== Headers ====================

/// An ordered header list.
///
/// Lookups are case-insensitive; names keep the casing they were captured
/// with so a stored response replays exactly as it was received.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Create an empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every value for `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    /// Remove every value for `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` joined with `", "`, as HTTP combines them.
    pub fn get_combined(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compare as a multiset of (lower-cased name, value) pairs.
    pub fn same_entries(&self, other: &Headers) -> bool {
        self.len() == other.len() && self.normalized() == other.normalized()
    }

    fn normalized(&self) -> Vec<(String, &str)> {
        let mut pairs: Vec<(String, &str)> = self
            .0
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.as_str()))
            .collect();
        pairs.sort();
        pairs
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl From<&http::HeaderMap> for Headers {
    fn from(map: &http::HeaderMap) -> Self {
        map.iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect()
    }
}

// ==================== Request Descriptor ====================

/// The method + URL + headers identity of a request, used as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    method: String,
    url: Url,
    headers: Headers,
}

impl RequestDescriptor {
    /// Create a descriptor. The method is upper-cased and the fragment dropped.
    pub fn new(method: &str, mut url: Url) -> Self {
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url,
            headers: Headers::new(),
        }
    }

    /// Create a GET descriptor.
    pub fn get(url: Url) -> Self {
        Self::new("GET", url)
    }

    /// Parse a descriptor from a method and an absolute URL string.
    pub fn parse(method: &str, url: &str) -> CacheResult<Self> {
        let url = Url::parse(url)
            .map_err(|e| CacheError::capture(format!("invalid request URL {url}: {e}")))?;
        Ok(Self::new(method, url))
    }

    /// Capture a descriptor from the parts of an intercepted `http` request.
    pub fn from_http_parts(parts: &http::request::Parts) -> CacheResult<Self> {
        let mut descriptor = Self::parse(parts.method.as_str(), &parts.uri.to_string())?;
        descriptor.headers = Headers::from(&parts.headers);
        Ok(descriptor)
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the header list.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Exact key equality used by `put` to replace an existing entry.
    pub fn same_key(&self, other: &RequestDescriptor) -> bool {
        self.method == other.method
            && self.url == other.url
            && self.headers.same_entries(&other.headers)
    }
}

// ==================== Response Record ====================

/// An immutable captured HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    status: u16,
    status_text: String,
    headers: Headers,
    #[serde(with = "body_base64")]
    body: Bytes,
    url: Option<Url>,
}

impl ResponseRecord {
    /// Create a record with the canonical status text for `status`.
    pub fn new(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: canonical_status_text(status),
            headers,
            body: body.into(),
            url: None,
        }
    }

    /// Set the status text.
    pub fn with_status_text(mut self, status_text: impl Into<String>) -> Self {
        self.status_text = status_text.into();
        self
    }

    /// Set the URL the response was served from.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Drain a live response into an immutable record.
    ///
    /// Fails with [`CacheError::CaptureFailure`] when a body chunk errors or
    /// a streamed body ends before its declared `Content-Length`. Bodiless
    /// statuses, empty bodies and bodies longer than declared (already
    /// decoded by the network layer) are captured as they are.
    pub async fn capture(live: LiveResponse) -> CacheResult<Self> {
        let declared = if has_null_body(live.status) {
            None
        } else {
            live.headers
                .get("content-length")
                .and_then(|v| v.trim().parse::<usize>().ok())
        };

        let body = match live.body {
            LiveBody::Full(bytes) => bytes,
            LiveBody::Empty => Bytes::new(),
            LiveBody::Stream(mut rx) => {
                let mut buf = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    let chunk = chunk.map_err(|e| CacheError::capture(e.to_string()))?;
                    buf.extend_from_slice(&chunk);
                }
                if let Some(declared) = declared {
                    if buf.len() < declared {
                        return Err(CacheError::capture(format!(
                            "body ended after {} of {} bytes",
                            buf.len(),
                            declared
                        )));
                    }
                }
                Bytes::from(buf)
            }
        };

        trace!(status = live.status, bytes = body.len(), "Captured response");

        Ok(Self {
            status: live.status,
            status_text: live
                .status_text
                .unwrap_or_else(|| canonical_status_text(live.status)),
            headers: live.headers,
            body,
            url: live.url,
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The body. `Bytes` is immutable, so handing it out cannot alter the
    /// stored entry.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Whether the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Lower-cased header names listed in `Vary`, or `None` without one.
    pub fn vary(&self) -> Option<Vec<String>> {
        let vary = self.headers.get_combined("vary")?;
        Some(
            vary.split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
        )
    }
}

/// Statuses whose responses never carry a body.
fn has_null_body(status: u16) -> bool {
    matches!(status, 100..=199 | 204 | 205 | 304)
}

fn canonical_status_text(status: u16) -> String {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Live Response ====================

/// Body of a response that has not been captured yet.
#[derive(Debug)]
pub enum LiveBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Chunks delivered by the network layer.
    Stream(mpsc::Receiver<Result<Bytes, std::io::Error>>),
    /// Empty.
    Empty,
}

/// A response as handed over by the interception layer.
#[derive(Debug)]
pub struct LiveResponse {
    pub status: u16,
    pub status_text: Option<String>,
    pub headers: Headers,
    pub url: Option<Url>,
    pub body: LiveBody,
}

impl LiveResponse {
    /// Create a live response with a full body.
    pub fn full(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: None,
            headers,
            url: None,
            body: LiveBody::Full(body.into()),
        }
    }

    /// Create a live response whose body arrives over a channel.
    pub fn streaming(
        status: u16,
        headers: Headers,
        rx: mpsc::Receiver<Result<Bytes, std::io::Error>>,
    ) -> Self {
        Self {
            status,
            status_text: None,
            headers,
            url: None,
            body: LiveBody::Stream(rx),
        }
    }

    /// Convert an `http::Response` produced by the interception layer.
    pub fn from_http(response: http::Response<LiveBody>, url: Option<Url>) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status.as_u16(),
            status_text: parts.status.canonical_reason().map(str::to_string),
            headers: Headers::from(&parts.headers),
            url,
            body,
        }
    }

    /// Set the URL the response was served from.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }
}

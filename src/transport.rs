use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::authorizer::Authorizer;
use crate::error::TransportError;

/// One MIME part of a `multipart/related` upload (spec §4.6). Parts are
/// paired to `_attachments` entries positionally, not by name, so there is
/// no `Content-Disposition`/filename here — only what CouchDB actually
/// reads off each part.
pub struct MultipartPart {
    pub name: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub bytes: Vec<u8>,
}

static BOUNDARY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A boundary string guaranteed unique per process per call, not a random
/// one: cheap, and collisions with attachment bytes are astronomically
/// unlikely regardless since the boundary is never derived from content.
fn new_boundary() -> String {
    let n = BOUNDARY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("couch-push-replicator-boundary-{}-{n}", std::process::id())
}

/// Serializes `parts` as the body of a `multipart/related` request (spec
/// §4.6): CouchDB pairs parts to `_attachments` entries positionally, so
/// this must preserve the caller's ordering exactly.
fn encode_multipart_related(parts: &[MultipartPart], boundary: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        let content_type = part.content_type.as_deref().unwrap_or("application/octet-stream");
        body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        if let Some(encoding) = &part.content_encoding {
            body.extend_from_slice(format!("Content-Encoding: {encoding}\r\n").as_bytes());
        }
        body.extend_from_slice(format!("Content-Length: {}\r\n\r\n", part.bytes.len()).as_bytes());
        body.extend_from_slice(&part.bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

/// The HTTP transport interface the replicator consumes (spec §6). Kept as
/// a trait so tests can substitute a double instead of hitting the network.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(u16, Value), TransportError>;

    async fn put_multipart(
        &self,
        path: &str,
        parts: Vec<MultipartPart>,
    ) -> Result<(u16, Value), TransportError>;
}

/// The production `RemoteTransport`, backed by `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: reqwest::Url,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl HttpTransport {
    pub fn new(base_url: reqwest::Url, authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            authorizer,
        }
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::Malformed(format!("invalid path {path:?}: {e}")))
    }

    fn signed_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(authorizer) = &self.authorizer {
            authorizer.sign(&mut headers);
        }
        headers
    }

    async fn decode(response: reqwest::Response) -> Result<(u16, Value), TransportError> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| TransportError::Malformed(e.to_string()))?
        };
        Ok((status, value))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(u16, Value), TransportError> {
        let mut request = self
            .client
            .request(method, self.url(path)?)
            .headers(self.signed_headers());

        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Self::decode(response).await
    }

    async fn put_multipart(
        &self,
        path: &str,
        parts: Vec<MultipartPart>,
    ) -> Result<(u16, Value), TransportError> {
        let boundary = new_boundary();
        let body = encode_multipart_related(&parts, &boundary);
        let content_type = format!("multipart/related; boundary=\"{boundary}\"");
        let content_type = reqwest::header::HeaderValue::from_str(&content_type)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        let response = self
            .client
            .put(self.url(path)?)
            .headers(self.signed_headers())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Self::decode(response).await
    }
}

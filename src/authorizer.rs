use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

/// A capability that signs outgoing requests, replacing dynamic dispatch on
/// a `CBLAuthorizer` class hierarchy with a small trait + variants, per the
/// redesign note in spec §9.
pub trait Authorizer: Send + Sync {
    fn sign(&self, headers: &mut HeaderMap);
}

#[derive(Debug, Clone)]
pub struct BasicAuthorizer {
    pub username: String,
    pub password: String,
}

impl Authorizer for BasicAuthorizer {
    fn sign(&self, headers: &mut HeaderMap) {
        let credentials = format!("{}:{}", self.username, self.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        if let Ok(value) = HeaderValue::from_str(&format!("Basic {encoded}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }
}

/// An OAuth1 authorizer that has already computed its signed header value
/// (OAuth1 signing itself is out of scope — the replicator only needs to
/// attach whatever the caller's authenticator produced).
#[derive(Debug, Clone)]
pub struct OAuth1Authorizer {
    pub header_value: String,
}

impl Authorizer for OAuth1Authorizer {
    fn sign(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.header_value) {
            headers.insert(AUTHORIZATION, value);
        }
    }
}

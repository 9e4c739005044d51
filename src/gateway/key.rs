//! Canonical request keys for in-flight dedup.

use super::transport::HttpRequest;
use sha2::{Digest, Sha256};

/// Deterministic key derived from method, URL, body and headers.
///
/// `serde_json` maps are ordered, so two bodies with the same fields in a
/// different insertion order hash the same. Headers are already sorted and
/// lowercased by [`HttpRequest`].
pub fn canonical_key(request: &HttpRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(request.url.as_bytes());
    hasher.update([0]);
    if let Some(body) = &request.body {
        hasher.update(body.to_string().as_bytes());
    }
    hasher.update([0]);
    for (name, value) in &request.headers {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }

    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Method;
    use serde_json::json;

    #[test]
    fn test_identical_requests_share_key() {
        let a = HttpRequest::post("/api/chat", json!({"message": "hi", "chat_id": "c1"}));
        let b = HttpRequest::post("/api/chat", json!({"chat_id": "c1", "message": "hi"}));
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn test_key_covers_every_component() {
        let base = HttpRequest::post("/api/chat", json!({"message": "hi"}));
        let key = canonical_key(&base);

        let other_method = HttpRequest::new(Method::Put, "/api/chat").with_body(json!({"message": "hi"}));
        let other_url = HttpRequest::post("/api/chats", json!({"message": "hi"}));
        let other_body = HttpRequest::post("/api/chat", json!({"message": "hello"}));
        let other_header = base.clone().with_header("X-Trace", "1");

        for request in [other_method, other_url, other_body, other_header] {
            assert_ne!(canonical_key(&request), key);
        }
    }

    #[test]
    fn test_header_case_does_not_matter() {
        let a = HttpRequest::get("/api/chats/").with_header("X-Tenant", "a");
        let b = HttpRequest::get("/api/chats/").with_header("x-tenant", "a");
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }
}

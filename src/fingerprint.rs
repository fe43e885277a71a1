//! Request canonicalisation for deterministic archive matching

use sha2::{Digest, Sha256};

/// Fixed sentinel hash for zero-length request bodies
pub const EMPTY_BODY_HASH: [u8; 32] = [
    0x5f, 0x70, 0xbf, 0x18, 0xa0, 0x86, 0x00, 0x70, 0x16, 0xe9, 0x48, 0xb0, 0x4a, 0xed, 0x3b, 0x82,
    0x10, 0x3a, 0x36, 0xbe, 0xa4, 0x17, 0x55, 0xb6, 0xcd, 0xdf, 0xaf, 0x10, 0xac, 0xe3, 0xc6, 0xef,
];

/// Headers that never participate in matching (hop-by-hop)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Canonical fingerprint of a request
///
/// Two keys are equal iff their canonical tuples are byte-equal. The
/// canonical form uppercases the method, lowercases the host and header
/// names, trims header values, strips hop-by-hop headers, and sorts the
/// remaining headers. The body is represented by its SHA-256 digest;
/// a zero-length body maps to [`EMPTY_BODY_HASH`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// HTTP method, uppercase
    pub method: String,
    /// Target host, lowercase, without port
    pub host: String,
    /// Path with query, as received
    pub path: String,
    /// Canonicalised request headers
    pub headers: Vec<(String, String)>,
    /// SHA-256 of the entity body
    pub body_hash: [u8; 32],
}

impl RequestKey {
    /// Build a canonical key from raw request parts
    #[must_use]
    pub fn new(
        method: &str,
        host: &str,
        path: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Self {
        let mut canonical: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_lowercase(), value.trim().to_string()))
            .filter(|(name, _)| !is_hop_by_hop(name))
            .collect();
        canonical.sort();

        Self {
            method: method.to_uppercase(),
            host: canonicalize_host(host),
            path: canonicalize_path(path),
            headers: canonical,
            body_hash: hash_body(body),
        }
    }

    /// Stable digest of the canonical tuple, for logging and diagnostics
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((self.method.len() as u32).to_be_bytes());
        hasher.update(self.method.as_bytes());
        hasher.update((self.host.len() as u32).to_be_bytes());
        hasher.update(self.host.as_bytes());
        hasher.update((self.path.len() as u32).to_be_bytes());
        hasher.update(self.path.as_bytes());
        for (name, value) in &self.headers {
            hasher.update((name.len() as u32).to_be_bytes());
            hasher.update(name.as_bytes());
            hasher.update((value.len() as u32).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.update(self.body_hash);
        hasher.finalize().into()
    }

    /// Short hex digest for log lines
    #[must_use]
    pub fn short_digest(&self) -> String {
        hex::encode(&self.digest()[..8])
    }
}

/// Hash an entity body; the empty body maps to a fixed sentinel
#[must_use]
pub fn hash_body(body: &[u8]) -> [u8; 32] {
    if body.is_empty() {
        return EMPTY_BODY_HASH;
    }
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.finalize().into()
}

/// Check whether a (lowercase) header name is hop-by-hop
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

fn canonicalize_host(host: &str) -> String {
    let host = host.trim().to_lowercase();
    // Strip a trailing :port, but leave IPv6 literals intact
    match (host.rfind(':'), host.find(']')) {
        (Some(colon), None) => host[..colon].to_string(),
        (Some(colon), Some(bracket)) if colon > bracket => host[..colon].to_string(),
        _ => host,
    }
}

fn canonicalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() || !trimmed.starts_with('/') {
        format!("/{trimmed}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key_with_headers(headers: &[(&str, &str)]) -> RequestKey {
        let headers: Vec<(String, String)> = headers
            .iter()
            .map(|(n, v)| ((*n).to_string(), (*v).to_string()))
            .collect();
        RequestKey::new("GET", "example.test", "/index.html", &headers, b"")
    }

    #[test]
    fn test_empty_body_sentinel() {
        assert_eq!(hash_body(b""), EMPTY_BODY_HASH);
        assert_ne!(hash_body(b"x"), EMPTY_BODY_HASH);
    }

    #[test]
    fn test_method_case_normalized() {
        let a = RequestKey::new("get", "example.test", "/", &[], b"");
        let b = RequestKey::new("GET", "example.test", "/", &[], b"");
        assert_eq!(a, b);
    }

    #[test]
    fn test_host_port_stripped() {
        let a = RequestKey::new("GET", "Example.Test:80", "/", &[], b"");
        assert_eq!(a.host, "example.test");
    }

    #[test]
    fn test_query_distinguishes_keys() {
        let a = RequestKey::new("GET", "example.test", "/a?x=1", &[], b"");
        let b = RequestKey::new("GET", "example.test", "/a?x=2", &[], b"");
        assert_ne!(a, b);
    }

    #[test]
    fn test_header_order_independence() {
        let a = key_with_headers(&[("Accept", "*/*"), ("User-Agent", "t")]);
        let b = key_with_headers(&[("User-Agent", "t"), ("Accept", "*/*")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_header_name_case_insensitive() {
        let a = key_with_headers(&[("Content-Type", "text/html")]);
        let b = key_with_headers(&[("content-type", "text/html")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hop_by_hop_stripped() {
        let a = key_with_headers(&[("Connection", "keep-alive"), ("Accept", "*/*")]);
        let b = key_with_headers(&[("Accept", "*/*")]);
        assert_eq!(a, b);
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("accept"));
    }

    #[test]
    fn test_digest_stable() {
        let a = key_with_headers(&[("Accept", "*/*")]);
        let b = key_with_headers(&[("Accept", "*/*")]);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.short_digest().len(), 16);
    }

    proptest! {
        #[test]
        fn prop_header_permutation_invariant(
            names in proptest::collection::vec("[a-z-]{1,12}", 0..6),
            value in "[ -~]{0,16}",
        ) {
            let headers: Vec<(String, String)> =
                names.iter().map(|n| (n.clone(), value.clone())).collect();
            let mut reversed = headers.clone();
            reversed.reverse();
            let a = RequestKey::new("GET", "h.test", "/p", &headers, b"");
            let b = RequestKey::new("GET", "h.test", "/p", &reversed, b"");
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_body_hash_injective_on_samples(body in proptest::collection::vec(any::<u8>(), 0..64)) {
            let key = RequestKey::new("POST", "h.test", "/p", &[], &body);
            if body.is_empty() {
                prop_assert_eq!(key.body_hash, EMPTY_BODY_HASH);
            } else {
                prop_assert_ne!(key.body_hash, EMPTY_BODY_HASH);
            }
        }
    }
}

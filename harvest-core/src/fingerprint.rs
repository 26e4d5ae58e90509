//! Component #1: Fingerprint.
//!
//! Computes a stable 128-bit key for a request and answers "seen before?"
//! by combining an approximate membership filter (a Bloom filter sized for
//! an expected count and false-positive rate) with an authoritative key
//! set. A negative Bloom answer is conclusive; a positive answer is
//! confirmed against the authoritative set.

use std::fmt;
use std::sync::Mutex;

use bloomfilter::Bloom;
use harvest_common::model::HttpMethod;

/// A normalized-identity key for a `Request`, used for deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint(pub [u8; 16]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Distinguished constant used for an absent body, so an absent body never
/// collides with the hash of empty bytes.
const NO_BODY_MARKER: &[u8] = b"\0harvest-no-body\0";

/// Normalize a URL to a canonical form: lowercase host, drop default
/// port, strip fragment, sort query parameters by key then value,
/// percent-decode then re-encode in canonical form, preserve path case.
///
/// `normalize` is idempotent: `normalize(normalize(u)) == normalize(u)`.
pub fn normalize_url(raw: &str) -> Result<String, url::ParseError> {
    let mut parsed = url::Url::parse(raw)?;

    parsed.set_fragment(None);

    if let Some(host) = parsed.host_str() {
        let lower = host.to_ascii_lowercase();
        let _ = parsed.set_host(Some(&lower));
    }

    let is_default_port = matches!(
        (parsed.scheme(), parsed.port()),
        ("http", Some(80)) | ("https", Some(443))
    );
    if is_default_port {
        let _ = parsed.set_port(None);
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.cmp(b));

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(&pairs);
    }

    Ok(parsed.to_string())
}

/// Canonical hash of a request body; `None` maps to a distinguished
/// constant, never to the hash of empty bytes.
fn body_bytes(body: Option<&[u8]>) -> &[u8] {
    body.unwrap_or(NO_BODY_MARKER)
}

/// Compute the deterministic fingerprint of a request's observable
/// wire-level effects: method, normalized URL, and body.
pub fn compute(
    method: HttpMethod,
    normalized_url: &str,
    body: Option<&[u8]>,
) -> Fingerprint {
    // A simple, deterministic 128-bit combination: FNV-1a folded into two
    // 64-bit lanes over method, url and body in sequence. This is not
    // cryptographic - it only needs to be stable and well distributed.
    let mut lo: u64 = 0xcbf29ce484222325;
    let mut hi: u64 = 0x9e3779b97f4a7c15;
    const PRIME: u64 = 0x100000001b3;

    for byte in method.to_string().as_bytes() {
        lo ^= *byte as u64;
        lo = lo.wrapping_mul(PRIME);
    }
    lo ^= 0xff;
    lo = lo.wrapping_mul(PRIME);

    for byte in normalized_url.as_bytes() {
        lo ^= *byte as u64;
        lo = lo.wrapping_mul(PRIME);
        hi ^= (*byte as u64).rotate_left(17);
        hi = hi.wrapping_mul(PRIME);
    }
    lo ^= 0xff;
    lo = lo.wrapping_mul(PRIME);
    hi ^= 0xff;
    hi = hi.wrapping_mul(PRIME);

    for byte in body_bytes(body) {
        hi ^= *byte as u64;
        hi = hi.wrapping_mul(PRIME);
    }

    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&lo.to_be_bytes());
    bytes[8..].copy_from_slice(&hi.to_be_bytes());
    Fingerprint(bytes)
}

/// Result of registering a fingerprint: was it new or a duplicate?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    New,
    Duplicate,
}

struct Inner {
    bloom: Bloom<[u8; 16]>,
    authoritative: std::collections::HashSet<Fingerprint>,
}

/// Approximate-membership-filter-backed deduplication set for one job.
///
/// `register` never blocks and never fails; all operations are O(1)
/// expected, guarded by a single lock held only across pure-CPU work.
pub struct FingerprintRegistry {
    inner: Mutex<Inner>,
}

impl FingerprintRegistry {
    /// `expected_items` and `false_positive_rate` size the Bloom filter.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let bloom = Bloom::new_for_fp_rate(expected_items.max(1), false_positive_rate);
        Self {
            inner: Mutex::new(Inner {
                bloom,
                authoritative: std::collections::HashSet::new(),
            }),
        }
    }

    /// Atomically record `fp` as seen and report whether it was new.
    pub fn register(&self, fp: Fingerprint) -> DedupOutcome {
        let mut guard = self.inner.lock().expect("fingerprint registry poisoned");

        if !guard.bloom.check(&fp.0) {
            guard.bloom.set(&fp.0);
            guard.authoritative.insert(fp);
            return DedupOutcome::New;
        }

        // Bloom filter says "maybe seen" - confirm against the authoritative set.
        if guard.authoritative.contains(&fp) {
            DedupOutcome::Duplicate
        } else {
            guard.authoritative.insert(fp);
            DedupOutcome::New
        }
    }

    /// Whether `fp` has definitely been registered (for resume/restore).
    pub fn contains(&self, fp: Fingerprint) -> bool {
        self.inner
            .lock()
            .expect("fingerprint registry poisoned")
            .authoritative
            .contains(&fp)
    }

    /// Restore the authoritative set from a checkpoint snapshot, e.g. on
    /// resume. Re-inserts every fingerprint into the Bloom filter too.
    pub fn restore(&self, fingerprints: impl IntoIterator<Item = Fingerprint>) {
        let mut guard = self.inner.lock().expect("fingerprint registry poisoned");
        for fp in fingerprints {
            guard.bloom.set(&fp.0);
            guard.authoritative.insert(fp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let u = "HTTPS://Example.com:443/Path?b=2&a=1#frag";
        let once = normalize_url(u).unwrap();
        let twice = normalize_url(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_drops_default_port_and_fragment_and_sorts_query() {
        let normalized = normalize_url("https://Example.com:443/Path?b=2&a=1#frag").unwrap();
        assert!(normalized.starts_with("https://example.com/Path"));
        assert!(!normalized.contains('#'));
        let query_start = normalized.find('?').unwrap();
        let query = &normalized[query_start + 1..];
        assert_eq!(query, "a=1&b=2");
    }

    #[test]
    fn empty_query_is_equivalent_to_no_query() {
        let a = normalize_url("https://example.com/path?").unwrap();
        let b = normalize_url("https://example.com/path").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_query_keys_are_preserved_in_sorted_order() {
        let normalized = normalize_url("https://example.com/path?a=&a=1").unwrap();
        let query_start = normalized.find('?').unwrap();
        assert_eq!(&normalized[query_start + 1..], "a=&a=1");
    }

    #[test]
    fn absent_body_differs_from_empty_body() {
        let fp_absent = compute(HttpMethod::GET, "https://example.com/", None);
        let fp_empty = compute(HttpMethod::GET, "https://example.com/", Some(b""));
        assert_ne!(fp_absent, fp_empty);
    }

    #[test]
    fn identical_requests_produce_identical_fingerprints() {
        let url_a = normalize_url("https://A.test/x?z=1&a=2").unwrap();
        let url_b = normalize_url("https://a.test/x?a=2&z=1").unwrap();
        assert_eq!(url_a, url_b);
        let fp_a = compute(HttpMethod::GET, &url_a, None);
        let fp_b = compute(HttpMethod::GET, &url_b, None);
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn register_reports_new_then_duplicate() {
        let registry = FingerprintRegistry::new(1000, 0.01);
        let fp = compute(HttpMethod::GET, "https://example.com/x", None);
        assert_eq!(registry.register(fp), DedupOutcome::New);
        assert_eq!(registry.register(fp), DedupOutcome::Duplicate);
    }

    #[test]
    fn restore_makes_fingerprints_register_as_duplicate() {
        let registry = FingerprintRegistry::new(1000, 0.01);
        let fp = compute(HttpMethod::GET, "https://example.com/x", None);
        registry.restore([fp]);
        assert_eq!(registry.register(fp), DedupOutcome::Duplicate);
    }
}

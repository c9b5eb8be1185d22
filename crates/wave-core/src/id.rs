//! Identifier types.
//!
//! Most entities use a `UUIDv7` wrapped in [`Id`] for time-ordered sorting.
//! Runs additionally get a human-readable [`run_id`] string.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, time-ordered identifier used for steps, events, artifacts, and workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build a human-readable run id: `{pipeline}-{yyyymmdd-hhmmss}-{4-char-hash}`.
///
/// The hash suffix is derived from a `UUIDv7`'s low bits rather than random
/// bytes so callers that need a deterministic id in tests can pass one in.
pub fn run_id(pipeline_name: &str, timestamp: chrono::DateTime<chrono::Utc>, entropy: &str) -> String {
    let slug: String = pipeline_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let stamp = timestamp.format("%Y%m%d-%H%M%S");
    let suffix = short_hash(entropy);
    format!("{slug}-{stamp}-{suffix}")
}

/// Derive a 4-character hex suffix from arbitrary entropy (typically a fresh [`Id`]).
fn short_hash(entropy: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(entropy.as_bytes());
    hex_prefix(&digest, 2)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        assert_ne!(Id::new(), Id::new());
    }

    #[test]
    fn run_id_is_lowercase_and_slugged() {
        let ts = chrono::DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let id = run_id("Add Auth", ts, "seed");
        assert_eq!(id, format!("add-auth-20260102-030405-{}", short_hash("seed")));
    }

    #[test]
    fn run_id_hash_suffix_is_four_hex_chars() {
        let ts = chrono::Utc::now();
        let id = run_id("p", ts, "x");
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

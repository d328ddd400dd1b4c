//! Per-endpoint table of distinct `(category, description)` pairs.
//!
//! Spans reference their strings by a one-byte table index. A table is
//! identified by the digest of its serialized form, so the receiver only
//! needs the full table once per membership change.

use super::varint::{append_string, append_varint};
use crate::span::SpanKey;
use sha2::{Digest as _, Sha256};

/// Maximum tuples per table. Index `0xFF` is reserved for [`UNKNOWN_STRING`].
pub const MAX_TUPLES: usize = 250;

/// String reference written for spans whose key did not fit in the table.
pub const UNKNOWN_STRING: u8 = 0xFF;

/// 128-bit table digest: the first 16 bytes of the SHA-256 of its bytes.
pub type Digest = [u8; 16];

#[derive(Debug, Clone)]
struct Generated {
    digest: Digest,
    bytes: Vec<u8>,
}

/// A sorted, bounded set of span keys for one endpoint.
#[derive(Debug, Clone)]
pub struct StringTable {
    endpoint: String,
    /// Kept sorted so indices are stable for a given membership
    tuples: Vec<(String, String)>,
    cache: Option<Generated>,
    /// Last digest the receiver confirmed
    acknowledged: Option<Digest>,
}

impl StringTable {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tuples: Vec::new(),
            cache: None,
            acknowledged: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Adds a tuple if it is absent and the table has room.
    ///
    /// Returns `true` if the table changed.
    pub fn push(&mut self, category: &str, description: &str) -> bool {
        match self.search((category, description)) {
            Ok(_) => false,
            Err(_) if self.is_full() => false,
            Err(pos) => {
                self.tuples
                    .insert(pos, (category.to_owned(), description.to_owned()));
                self.cache = None;
                true
            }
        }
    }

    /// Serializes the table and caches the bytes and digest.
    ///
    /// Idempotent until the next successful `push`.
    pub fn generate(&mut self) -> Digest {
        if let Some(generated) = &self.cache {
            return generated.digest;
        }

        let mut bytes = Vec::new();
        append_string(&mut bytes, &self.endpoint);
        append_varint(&mut bytes, self.tuples.len() as u64);
        for (category, description) in &self.tuples {
            append_string(&mut bytes, category);
            append_string(&mut bytes, description);
        }

        let digest = digest_of(&bytes);
        self.cache = Some(Generated { digest, bytes });
        digest
    }

    /// Digest of the last generated form, `None` if stale.
    pub fn digest(&self) -> Option<Digest> {
        self.cache.as_ref().map(|g| g.digest)
    }

    /// Serialized form, `None` if stale.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.cache.as_ref().map(|g| g.bytes.as_slice())
    }

    /// Records that the receiver holds the table as of `digest`.
    ///
    /// Replaces any earlier acknowledgement.
    pub fn acknowledge(&mut self, digest: Digest) {
        self.acknowledged = Some(digest);
    }

    pub fn acknowledged(&self) -> Option<Digest> {
        self.acknowledged
    }

    /// Whether the generated form is the one the receiver already has.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.is_some() && self.digest() == self.acknowledged
    }

    /// Table index of `key`. Only meaningful against the generated form.
    pub fn index_of(&self, key: SpanKey<'_>) -> Option<u8> {
        self.search(key).ok().map(|i| i as u8)
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tuples.len() >= MAX_TUPLES
    }

    fn search(&self, key: SpanKey<'_>) -> Result<usize, usize> {
        self.tuples
            .binary_search_by(|(c, d)| (c.as_str(), d.as_str()).cmp(&key))
    }
}

/// Truncated SHA-256 used to identify tables.
pub fn digest_of(bytes: &[u8]) -> Digest {
    let full = Sha256::digest(bytes);
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&full[..16]);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_dedups() {
        let mut table = StringTable::new("Users#index");
        assert!(table.push("db.query", "SELECT 1"));
        assert!(!table.push("db.query", "SELECT 1"));
        assert!(table.push("db.query", ""));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_indices_follow_sort_order() {
        let mut table = StringTable::new("Users#index");
        table.push("view.render", "index.html");
        table.push("app.request", "");
        table.push("db.query", "SELECT 1");
        table.generate();

        assert_eq!(table.index_of(("app.request", "")), Some(0));
        assert_eq!(table.index_of(("db.query", "SELECT 1")), Some(1));
        assert_eq!(table.index_of(("view.render", "index.html")), Some(2));
        assert_eq!(table.index_of(("view.render", "")), None);
    }

    #[test]
    fn test_generate_cached_until_change() {
        let mut table = StringTable::new("Users#index");
        table.push("a", "");
        let first = table.generate();
        assert_eq!(table.digest(), Some(first));
        assert_eq!(table.generate(), first);

        // Re-pushing an existing tuple keeps the cache
        table.push("a", "");
        assert_eq!(table.digest(), Some(first));

        table.push("b", "");
        assert_eq!(table.digest(), None);
        assert!(table.bytes().is_none());
        assert_ne!(table.generate(), first);
    }

    #[test]
    fn test_digest_independent_of_insertion_order() {
        let mut a = StringTable::new("e");
        a.push("x", "1");
        a.push("y", "2");

        let mut b = StringTable::new("e");
        b.push("y", "2");
        b.push("x", "1");

        assert_eq!(a.generate(), b.generate());
        assert_eq!(a.bytes(), b.bytes());
    }

    #[test]
    fn test_digest_covers_endpoint() {
        let mut a = StringTable::new("Users#index");
        let mut b = StringTable::new("Users#show");
        assert_ne!(a.generate(), b.generate());
    }

    #[test]
    fn test_acknowledgement_follows_membership() {
        let mut table = StringTable::new("e");
        table.push("a", "");
        let first = table.generate();
        assert!(!table.is_acknowledged());

        table.acknowledge(first);
        assert!(table.is_acknowledged());

        // Growing the table invalidates it until the new form is confirmed
        table.push("b", "");
        let second = table.generate();
        assert!(!table.is_acknowledged());
        assert_eq!(table.acknowledged(), Some(first));

        table.acknowledge(second);
        assert!(table.is_acknowledged());
        assert_eq!(table.acknowledged(), Some(second));
    }

    #[test]
    fn test_bounded() {
        let mut table = StringTable::new("e");
        for i in 0..MAX_TUPLES {
            assert!(table.push("cat", &i.to_string()));
        }
        assert!(table.is_full());
        assert!(!table.push("cat", "overflow"));
        assert_eq!(table.index_of(("cat", "overflow")), None);
        assert_eq!(table.len(), MAX_TUPLES);
    }
}

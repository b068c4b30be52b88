//! Consistent Hash Ring
//!
//! Positions node ids on a 32-bit ring via CRC32 of the UTF-8 id and
//! resolves lookups clockwise. Group assignment and representative
//! selection both reduce to ring lookups, which keeps them byte-identical
//! across runs and hosts.

use std::iter::FusedIterator;

/// 32-bit position of a key on the ring
pub fn h32(value: &str) -> u32 {
    crc32fast::hash(value.as_bytes())
}

/// Immutable consistent-hash ring over a set of node ids
///
/// Entries are sorted by `(hash, id)` so equal hashes resolve in id order.
#[derive(Clone, Debug)]
pub struct HashRing {
    entries: Vec<(u32, String)>,
}

impl HashRing {
    /// Build a ring from node ids
    pub fn new<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries: Vec<(u32, String)> = node_ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                (h32(&id), id)
            })
            .collect();
        entries.sort();
        Self { entries }
    }

    /// Number of nodes on the ring
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring holds no nodes
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Node clockwise of `key`: smallest position strictly greater than
    /// `h32(key)`, wrapping to the smallest position on the ring
    pub fn next(&self, key: &str) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let hv = h32(key);
        let mut i = self.entries.partition_point(|(h, _)| *h <= hv);
        if i == self.entries.len() {
            i = 0;
        }
        Some(&self.entries[i].1)
    }

    /// Infinite clockwise traversal starting strictly after `h32(start_key)`
    pub fn walk(&self, start_key: &str) -> Walk<'_> {
        let hv = h32(start_key);
        let start = self.entries.partition_point(|(h, _)| *h <= hv);
        Walk { ring: self, index: start }
    }
}

/// Wrap-around iterator over ring entries, never exhausted on a non-empty ring
#[derive(Clone, Debug)]
pub struct Walk<'a> {
    ring: &'a HashRing,
    index: usize,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.ring.entries.is_empty() {
            return None;
        }
        if self.index >= self.ring.entries.len() {
            self.index = 0;
        }
        let id = self.ring.entries[self.index].1.as_str();
        self.index += 1;
        Some(id)
    }
}

impl FusedIterator for Walk<'_> {}

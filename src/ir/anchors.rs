//! Anchor hashes: stable 16-hex fingerprints of canonicalized SQL subtrees.
//!
//! An anchor is a function of the subtree's rendered text only — lowercased
//! and whitespace-collapsed — so two independent builds of the same SQL
//! produce identical anchors, and two syntactically identical subtrees
//! collide on purpose (callers disambiguate with `by_node_id`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// 16-hex-char fingerprint of a canonicalized SQL subtree.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorHash(u64);

impl AnchorHash {
    pub fn from_canonical(text: &str) -> Self {
        Self(xxh3_64(text.as_bytes()))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AnchorHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for AnchorHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnchorHash({:016x})", self.0)
    }
}

/// Error for a malformed anchor string in a patch target.
#[derive(Debug, thiserror::Error)]
#[error("invalid anchor hash: {text:?} (expected 16 hex chars)")]
pub struct InvalidAnchor {
    pub text: String,
}

impl FromStr for AnchorHash {
    type Err = InvalidAnchor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 16 {
            return Err(InvalidAnchor {
                text: s.to_string(),
            });
        }
        u64::from_str_radix(trimmed, 16)
            .map(AnchorHash)
            .map_err(|_| InvalidAnchor {
                text: s.to_string(),
            })
    }
}

impl Serialize for AnchorHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AnchorHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Canonical form of a rendered SQL node: lowercase, whitespace collapsed.
///
/// This is the only input to anchor hashing, which keeps anchors stable
/// across formatting differences and parser revisions.
pub fn canonical_sql<T: fmt::Display + ?Sized>(node: &T) -> String {
    let rendered = node.to_string().to_lowercase();
    let mut out = String::with_capacity(rendered.len());
    let mut first = true;
    for token in rendered.split_whitespace() {
        if !first {
            out.push(' ');
        }
        out.push_str(token);
        first = false;
    }
    out
}

/// Anchor of any renderable SQL node.
pub fn anchor_of<T: fmt::Display + ?Sized>(node: &T) -> AnchorHash {
    AnchorHash::from_canonical(&canonical_sql(node))
}

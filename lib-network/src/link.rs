//! Links and locators
//!
//! A link names a logical channel between two contacts, optionally
//! pinned to one specific node instance of the remote contact. A zero
//! node digest is a wildcard matching any instance.

use lib_crypto::Digest;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Link {
    pub local: Digest,
    pub remote: Digest,
    pub node: Digest,
}

impl Link {
    pub const NULL: Link = Link {
        local: Digest::ZERO,
        remote: Digest::ZERO,
        node: Digest::ZERO,
    };

    pub fn new(local: Digest, remote: Digest, node: Digest) -> Self {
        Self { local, remote, node }
    }

    /// A link matching any node instance of the remote contact
    pub fn wildcard(local: Digest, remote: Digest) -> Self {
        Self { local, remote, node: Digest::ZERO }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Whether this link (possibly wildcard) matches a concrete one
    pub fn matches(&self, other: &Link) -> bool {
        if self.is_null() {
            return true;
        }
        self.local == other.local
            && self.remote == other.remote
            && (self.node.is_zero() || other.node.is_zero() || self.node == other.node)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link({:?} -> {:?} @ {:?})", self.local, self.remote, self.node)
    }
}

/// Where a publication lives: a subscribed prefix plus the remainder of
/// the published path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Locator {
    pub link: Link,
    pub prefix: String,
    pub path: String,
}

impl Locator {
    pub fn new(prefix: &str, path: &str, link: Link) -> Self {
        Self {
            link,
            prefix: normalize_prefix(prefix),
            path: path.to_string(),
        }
    }

    pub fn full_path(&self) -> String {
        if self.path.is_empty() || self.path == "/" {
            self.prefix.clone()
        } else {
            format!("{}{}", self.prefix, self.path)
        }
    }
}

/// Normalise a slash-delimited prefix: leading slash, no trailing slash
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Strict prefix match on normalised paths; returns the remainder on
/// match ("/" when the path equals the prefix)
pub fn match_prefix(prefix: &str, path: &str) -> Option<String> {
    let prefix = normalize_prefix(prefix);
    let path = normalize_prefix(path);
    if prefix == "/" {
        return Some(path);
    }
    if path == prefix {
        return Some("/".to_string());
    }
    let rest = path.strip_prefix(&prefix)?;
    if rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::sha256;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_prefix("/foo/"), "/foo");
        assert_eq!(normalize_prefix("foo"), "/foo");
        assert_eq!(normalize_prefix(""), "/");
        assert_eq!(normalize_prefix("/"), "/");
    }

    #[test]
    fn test_match_prefix() {
        assert_eq!(match_prefix("/foo", "/foo/bar"), Some("/bar".to_string()));
        assert_eq!(match_prefix("/foo", "/foo"), Some("/".to_string()));
        assert_eq!(match_prefix("/foo", "/foobar"), None);
        assert_eq!(match_prefix("/foo", "/other"), None);
        assert_eq!(match_prefix("/", "/anything"), Some("/anything".to_string()));
    }

    #[test]
    fn test_wildcard_link_matches() {
        let local = sha256(b"alice");
        let remote = sha256(b"bob");
        let node = sha256(b"bob-laptop");

        let wildcard = Link::wildcard(local, remote);
        let concrete = Link::new(local, remote, node);
        assert!(wildcard.matches(&concrete));
        assert!(concrete.matches(&concrete));
        assert!(Link::NULL.matches(&concrete));

        let other = Link::new(local, sha256(b"carol"), node);
        assert!(!wildcard.matches(&other));
    }
}

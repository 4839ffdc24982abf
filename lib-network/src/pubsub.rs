//! Publisher, subscriber and listener interfaces
//!
//! Publications are pull-style: a publisher registers a prefix and is
//! asked to announce the targets it currently has under a path.
//! Subscribers react to announced targets; listeners observe link
//! lifecycle and receive application records.

use crate::link::{Link, Locator};
use lib_crypto::{Digest, PublicIdentity};

pub trait Publisher: Send + Sync {
    /// The link filter this publisher applies; null matches every link
    fn link(&self) -> Link {
        Link::NULL
    }

    /// Targets currently published under the locator, or None when the
    /// path has nothing
    fn announce(&self, locator: &Locator) -> Option<Vec<Digest>>;
}

pub trait Subscriber: Send + Sync {
    /// The link filter this subscriber applies; null matches every link
    fn link(&self) -> Link {
        Link::NULL
    }

    /// A target announced under a subscribed prefix. Return true to
    /// have the block fetched into the local store.
    fn incoming(&self, locator: &Locator, target: &Digest) -> bool;

    /// An unsolicited issue record under a subscribed prefix
    fn issue(&self, locator: &Locator, payload: &serde_json::Value) -> bool {
        let _ = (locator, payload);
        false
    }

    /// Local-only subscribers never cause network traffic
    fn local_only(&self) -> bool {
        false
    }
}

pub trait Listener: Send + Sync {
    /// A node instance of the watched contact was seen
    fn seen(&self, link: &Link) {
        let _ = link;
    }

    /// A link opened (true) or closed (false)
    fn connected(&self, link: &Link, status: bool) {
        let _ = (link, status);
    }

    /// An application record arrived; return true when consumed
    fn recv(&self, link: &Link, record_type: &str, payload: &[u8]) -> bool;

    /// Authorise an inbound contact; the link is only registered when
    /// some listener (or the permissive config) approves
    fn auth(&self, link: &Link, key: &PublicIdentity) -> bool {
        let _ = (link, key);
        false
    }
}

//! Session identifiers for protocol forks.
//!
//! Every fork multiplexed over a socket is named by a 128-bit `SessionId`.
//! Ids are never sent per message; each party binds an id to a small local
//! slot number and announces the binding once. Child ids are derived
//! deterministically so that both parties, forking in the same protocol
//! order, compute identical ids with no traffic.

use std::fmt;

use blake2::{Blake2s256, Digest};

/// A 128-bit opaque identifier for one protocol fork.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Derive a root id from a protocol label.
    ///
    /// Both parties must use the same label for their root session.
    pub fn root(label: &str) -> SessionId {
        let mut h = Blake2s256::new();
        h.update(b"muxlink.root");
        h.update(label.as_bytes());
        Self::truncate(&h.finalize())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> SessionId {
        SessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive the `index`-th child of this id.
    ///
    /// Forking is counter-based: the socket keeps a per-fork counter, so two
    /// parties that fork the same parent the same number of times agree on
    /// every child id.
    pub(crate) fn derive_child(&self, index: u64) -> SessionId {
        let mut h = Blake2s256::new();
        h.update(b"muxlink.fork");
        h.update(self.0);
        h.update(index.to_le_bytes());
        Self::truncate(&h.finalize())
    }

    fn truncate(digest: &[u8]) -> SessionId {
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest[..16]);
        SessionId(out)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_deterministic() {
        assert_eq!(SessionId::root("psu"), SessionId::root("psu"));
        assert_ne!(SessionId::root("psu"), SessionId::root("psi"));
    }

    #[test]
    fn test_children_are_distinct() {
        let root = SessionId::root("t");
        let a = root.derive_child(0);
        let b = root.derive_child(1);
        assert_ne!(a, b);
        assert_ne!(a, root);
        // same inputs, same child on both parties
        assert_eq!(a, SessionId::root("t").derive_child(0));
    }

    #[test]
    fn test_bytes_round_trip() {
        let id = SessionId::root("x");
        assert_eq!(SessionId::from_bytes(*id.as_bytes()), id);
    }
}

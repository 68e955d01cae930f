//! Peer address demultiplexing
//!
//! When several sources share one base, each claims the peer addresses it
//! accepts datagrams from. The port of the peer is ignored, and IPv4-mapped
//! IPv6 peers match their IPv4 form.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

/// Ordered map from peer address to the source that owns it
#[derive(Debug)]
pub struct PeerDemux<T> {
    peers: BTreeMap<IpAddr, Arc<T>>,
}

/// A peer already claimed by a different target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConflict(pub IpAddr);

impl<T> PeerDemux<T> {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
        }
    }

    /// Map every address in `peers` to `target`
    ///
    /// Addresses already mapped to `target` are left alone. If any address
    /// belongs to another target, nothing is inserted.
    pub fn insert_all(&mut self, peers: &[IpAddr], target: &Arc<T>) -> Result<(), PeerConflict> {
        for peer in peers {
            if let Some(owner) = self.peers.get(&peer.to_canonical()) {
                if !Arc::ptr_eq(owner, target) {
                    return Err(PeerConflict(*peer));
                }
            }
        }
        for peer in peers {
            self.peers
                .entry(peer.to_canonical())
                .or_insert_with(|| Arc::clone(target));
        }
        Ok(())
    }

    /// Remove the entries in `peers` that map to `target`
    pub fn remove_all(&mut self, peers: &[IpAddr], target: &Arc<T>) {
        for peer in peers {
            let key = peer.to_canonical();
            if self
                .peers
                .get(&key)
                .is_some_and(|owner| Arc::ptr_eq(owner, target))
            {
                self.peers.remove(&key);
            }
        }
    }

    /// Find the target accepting datagrams from `peer`
    pub fn lookup(&self, peer: IpAddr) -> Option<&Arc<T>> {
        self.peers.get(&peer.to_canonical())
    }

    pub fn targets(&self) -> impl Iterator<Item = &Arc<T>> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl<T> Default for PeerDemux<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limiter for "unknown sender" log lines
///
/// Only the first unknown sender after a known one is reported.
#[derive(Debug, Default)]
pub struct UnknownPeerLog {
    reported: bool,
}

impl UnknownPeerLog {
    /// A datagram from a recognised peer arrived
    pub fn known(&mut self) {
        self.reported = false;
    }

    /// A datagram from an unrecognised peer arrived; returns whether to log it
    pub fn unknown(&mut self) -> bool {
        !std::mem::replace(&mut self.reported, true)
    }
}

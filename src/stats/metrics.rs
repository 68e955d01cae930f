//! Statistics for source bases

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters maintained by a base's reader thread
#[derive(Debug)]
pub struct BaseStats {
    started_at: Instant,
    datagrams_received: AtomicU64,
    bytes_received: AtomicU64,
    unknown_peer: AtomicU64,
    rejected: AtomicU64,
    dropped_stopped: AtomicU64,
    descriptors_closed: AtomicU64,
}

impl BaseStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            unknown_peer: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped_stopped: AtomicU64::new(0),
            descriptors_closed: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn datagram_received(&self, bytes: usize) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a datagram from a peer no source accepts
    #[inline]
    pub fn unknown_peer(&self) {
        self.unknown_peer.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a datagram discarded by a reject predicate
    #[inline]
    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a datagram addressed to a stopped source
    #[inline]
    pub fn dropped_stopped(&self) {
        self.dropped_stopped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn descriptor_closed(&self) {
        self.descriptors_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BaseStatsSnapshot {
        BaseStatsSnapshot {
            uptime: self.started_at.elapsed(),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            unknown_peer: self.unknown_peer.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped_stopped: self.dropped_stopped.load(Ordering::Relaxed),
            descriptors_closed: self.descriptors_closed.load(Ordering::Relaxed),
        }
    }
}

impl Default for BaseStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`BaseStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseStatsSnapshot {
    /// Time since the base was created
    pub uptime: Duration,
    /// Datagrams read from any descriptor
    pub datagrams_received: u64,
    /// Payload bytes read from any descriptor
    pub bytes_received: u64,
    /// Datagrams dropped because no source accepts the sender
    pub unknown_peer: u64,
    /// Datagrams discarded by a reject predicate
    pub rejected: u64,
    /// Datagrams dropped because their source was stopped
    pub dropped_stopped: u64,
    /// Descriptors closed after an error or hang-up
    pub descriptors_closed: u64,
}

impl BaseStatsSnapshot {
    /// Datagrams that made it into a source buffer
    pub fn delivered(&self) -> u64 {
        self.datagrams_received
            .saturating_sub(self.unknown_peer)
            .saturating_sub(self.rejected)
            .saturating_sub(self.dropped_stopped)
    }

    /// Receive rate in bits per second over the base's lifetime
    pub fn bitrate(&self) -> u64 {
        let secs = self.uptime.as_secs();
        if secs > 0 {
            (self.bytes_received * 8) / secs
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats_are_zero() {
        let snap = BaseStats::new().snapshot();
        assert_eq!(snap.datagrams_received, 0);
        assert_eq!(snap.bytes_received, 0);
        assert_eq!(snap.unknown_peer, 0);
        assert_eq!(snap.rejected, 0);
        assert_eq!(snap.dropped_stopped, 0);
        assert_eq!(snap.descriptors_closed, 0);
    }

    #[test]
    fn test_delivered() {
        let stats = BaseStats::new();
        for _ in 0..10 {
            stats.datagram_received(100);
        }
        stats.unknown_peer();
        stats.unknown_peer();
        stats.rejected();
        stats.dropped_stopped();

        let snap = stats.snapshot();
        assert_eq!(snap.datagrams_received, 10);
        assert_eq!(snap.bytes_received, 1000);
        assert_eq!(snap.delivered(), 6);
    }

    #[test]
    fn test_bitrate() {
        let snap = BaseStatsSnapshot {
            uptime: Duration::from_secs(10),
            bytes_received: 1_000_000,
            ..Default::default()
        };
        // 1,000,000 bytes * 8 bits / 10 seconds
        assert_eq!(snap.bitrate(), 800_000);

        let snap = BaseStatsSnapshot {
            bytes_received: 1_000_000,
            ..Default::default()
        };
        assert_eq!(snap.bitrate(), 0);
    }
}

//! Counters of handshake and multiplexing activity.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transport metrics at a point in time.
pub struct MetricsSnapshot {
    /// Handshakes started on any sub-stream.
    pub handshakes_started: u64,
    /// Sub-streams that reached the connected state.
    pub handshakes_completed: u64,
    /// Handshakes that ended with the sub-stream broken.
    pub handshakes_failed: u64,
    /// Credentials handed to the server.
    pub auth_attempts: u64,
    /// Mechanisms rejected by the server.
    pub auth_rejections: u64,
    /// Secondary sub-streams bound to a session.
    pub binds_completed: u64,
    /// Requests routed by the multiplexer to a secondary downlink.
    pub requests_multiplexed: u64,
    /// Replies dropped because their stream id had timed out.
    pub stale_replies_discarded: u64,
    /// `wait`/`waitresp` replies that moved the wait barrier.
    pub wait_barriers_raised: u64,
    /// Sub-stream disconnect events.
    pub disconnects: u64,
    /// Bytes written to sockets.
    pub bytes_sent: u64,
    /// Bytes read from sockets.
    pub bytes_received: u64,
}

/// Lock-free metrics shared by a channel and its socket drivers.
pub struct TransportMetrics {
    handshakes_started: AtomicU64,
    handshakes_completed: AtomicU64,
    handshakes_failed: AtomicU64,
    auth_attempts: AtomicU64,
    auth_rejections: AtomicU64,
    binds_completed: AtomicU64,
    requests_multiplexed: AtomicU64,
    stale_replies_discarded: AtomicU64,
    wait_barriers_raised: AtomicU64,
    disconnects: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handshakes_started: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            auth_attempts: AtomicU64::new(0),
            auth_rejections: AtomicU64::new(0),
            binds_completed: AtomicU64::new(0),
            requests_multiplexed: AtomicU64::new(0),
            stale_replies_discarded: AtomicU64::new(0),
            wait_barriers_raised: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Increments the handshakes started counter.
    pub fn inc_handshakes_started(&self) {
        self.handshakes_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the handshakes completed counter.
    pub fn inc_handshakes_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the handshakes failed counter.
    pub fn inc_handshakes_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the auth attempts counter.
    pub fn inc_auth_attempts(&self) {
        self.auth_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the auth rejections counter.
    pub fn inc_auth_rejections(&self) {
        self.auth_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the binds completed counter.
    pub fn inc_binds_completed(&self) {
        self.binds_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the requests multiplexed counter.
    pub fn inc_requests_multiplexed(&self) {
        self.requests_multiplexed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the stale replies discarded counter.
    pub fn inc_stale_replies_discarded(&self) {
        self.stale_replies_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the wait barriers raised counter.
    pub fn inc_wait_barriers_raised(&self) {
        self.wait_barriers_raised.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the disconnects counter.
    pub fn inc_disconnects(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the bytes sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bytes received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handshakes_started: self.handshakes_started.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            auth_attempts: self.auth_attempts.load(Ordering::Relaxed),
            auth_rejections: self.auth_rejections.load(Ordering::Relaxed),
            binds_completed: self.binds_completed.load(Ordering::Relaxed),
            requests_multiplexed: self.requests_multiplexed.load(Ordering::Relaxed),
            stale_replies_discarded: self.stale_replies_discarded.load(Ordering::Relaxed),
            wait_barriers_raised: self.wait_barriers_raised.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

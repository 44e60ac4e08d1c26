//! Idle and liveness policy for a channel's sub-streams.
//!
//! Both checks only decide; closing the socket is up to the caller.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{Result, TransportError};

impl Channel {
    /// True if the channel has been idle long enough to be closed.
    pub fn is_stream_ttl_elapsed(&self, inactive: Duration) -> bool {
        let state = self.lock();
        if state.open_files > 0 {
            return false;
        }
        let ttl = if state.server_flags.is_data_server() {
            self.config().data_server_ttl_secs
        } else {
            self.config().load_balancer_ttl_secs
        };
        let elapsed = state.sids.allocated_count() == 0 && inactive.as_secs() > ttl;
        if elapsed {
            debug!(
                stream = %state.stream_name,
                inactive_secs = inactive.as_secs(),
                ttl_secs = ttl,
                "stream TTL elapsed"
            );
        }
        elapsed
    }

    /// Fails with `SocketTimeout` when a response is overdue.
    pub fn is_stream_broken(&self, inactive: Duration) -> Result<()> {
        self.is_stream_broken_at(inactive, Instant::now())
    }

/// Like [`Channel::is_stream_broken`] with an explicit clock.
    pub fn is_stream_broken_at(&self, inactive: Duration, now: Instant) -> Result<()> {
        let state = self.lock();
        let timeout = Duration::from_secs(self.config().stream_timeout_secs);
        if inactive < timeout {
            return Ok(());
        }
        if state.wait_barrier.is_some_and(|barrier| now < barrier) {
            return Ok(());
        }
        // only ids outstanding for longer than the timeout count
        let overdue = now
            .checked_sub(timeout)
            .is_some_and(|cutoff| state.sids.any_issued_before(cutoff));
        if !overdue {
            return Ok(());
        }

        warn!(
            stream = %state.stream_name,
            inactive_secs = inactive.as_secs(),
            "stream inactive with outstanding requests, declaring it broken"
        );
        Err(TransportError::SocketTimeout {
            stream: state.stream_name.clone(),
            timeout_secs: timeout.as_secs(),
        })
    }
}

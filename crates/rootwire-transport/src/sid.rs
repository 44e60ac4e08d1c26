//! Correlation id allocation for in-flight requests of one channel.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::codec::StreamId;
use crate::error::{Result, TransportError};

/// Issues 2-byte stream ids and remembers when each one went out.
///
/// Ids that timed out stay reserved until [`release_timed_out`] so that a
/// late reply can still be recognized and dropped.
///
/// [`release_timed_out`]: StreamIdAllocator::release_timed_out
#[derive(Debug)]
pub struct StreamIdAllocator {
    ceiling: u16,
    next: u32,
    free: Vec<u16>,
    issued: HashMap<u16, Instant>,
    timed_out: HashSet<u16>,
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamIdAllocator {
    /// Id 0 is never issued; it marks handshake traffic.
    pub fn new() -> Self {
        Self::with_ceiling(u16::MAX)
    }

    /// Limits the id space to `1..=ceiling`.
    pub fn with_ceiling(ceiling: u16) -> Self {
        Self {
            ceiling: ceiling.max(1),
            next: 1,
            free: Vec::new(),
            issued: HashMap::new(),
            timed_out: HashSet::new(),
        }
    }

/// Reserves a free id, reusing released ones first.
    pub fn allocate(&mut self) -> Result<StreamId> {
        self.allocate_at(Instant::now())
    }

    /// Issues an id, recording `now` as its issue time.
    pub fn allocate_at(&mut self, now: Instant) -> Result<StreamId> {
        let id = match self.free.pop() {
            Some(id) => id,
            None if self.next <= u32::from(self.ceiling) => {
                let id = self.next as u16;
                self.next += 1;
                id
            }
            None => {
                return Err(TransportError::StreamIdsExhausted {
                    allocated: usize::from(self.ceiling),
                })
            }
        };
        self.issued.insert(id, now);
        Ok(id.to_be_bytes())
    }

    /// Returns an id after its response has been handled.
    pub fn release(&mut self, sid: StreamId) {
        let id = u16::from_be_bytes(sid);
        if self.issued.remove(&id).is_some() || self.timed_out.remove(&id) {
            self.free.push(id);
        }
    }

    /// Moves an id to the timed-out set without freeing it.
    pub fn mark_timed_out(&mut self, sid: StreamId) {
        let id = u16::from_be_bytes(sid);
        if self.issued.remove(&id).is_some() {
            self.timed_out.insert(id);
        }
    }

/// True if `sid` was marked timed out and not released since.
    pub fn is_timed_out(&self, sid: StreamId) -> bool {
        self.timed_out.contains(&u16::from_be_bytes(sid))
    }

    /// Frees every timed-out id.
    pub fn release_timed_out(&mut self) {
        self.free.extend(self.timed_out.drain());
    }

    /// Ids awaiting a response, timed-out ones excluded.
    pub fn allocated_count(&self) -> usize {
        self.issued.len()
    }

/// Ids kept reserved after a timeout.
    pub fn timed_out_count(&self) -> usize {
        self.timed_out.len()
    }

    /// True if some outstanding id was issued before `cutoff`.
    pub fn any_issued_before(&self, cutoff: Instant) -> bool {
        self.issued.values().any(|issued| *issued < cutoff)
    }
}

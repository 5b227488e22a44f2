//! Splitting oversized messages into FRAGMENT frames and reassembling them.
//!
//! A message is the inner frame serialized as its command byte followed by
//! its body. Messages longer than [`MAX_FRAGMENT_BODY`] are cut at that
//! boundary; every chunk shares the base sequence (the sequence number of
//! the message's first fragment) and states the declared total, so the
//! receiver can detect completion without a final-fragment marker.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

use log::{debug, warn};
use protocol::gameserver::MAX_FRAGMENT_BODY;

/// A reassembly buffer not completed within this window is dropped; the
/// reliable channel retransmits the missing pieces anyway.
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound on a declared message size.
pub const MAX_MESSAGE_SIZE: u32 = 1 << 20;
/// Reassembly buffers held at once; beyond this the oldest is shed.
pub const MAX_BUFFERS: usize = 256;

/// Splits a message into `(offset, chunk)` pairs. Returns `None` when the
/// message fits a single datagram and needs no fragmenting.
pub fn split_message(message: &[u8]) -> Option<Vec<(u32, &[u8])>> {
    if message.len() <= MAX_FRAGMENT_BODY {
        return None;
    }
    Some(
        message
            .chunks(MAX_FRAGMENT_BODY)
            .enumerate()
            .map(|(i, chunk)| ((i * MAX_FRAGMENT_BODY) as u32, chunk))
            .collect(),
    )
}

#[derive(Debug)]
struct FragmentBuffer {
    total: u32,
    first_fragment: Instant,
    chunks: BTreeMap<u32, Vec<u8>>,
}

impl FragmentBuffer {
    /// Complete when the stored ranges cover `0..total` without gaps.
    fn try_assemble(&self) -> Option<Vec<u8>> {
        let mut cursor = 0u32;
        for (offset, chunk) in &self.chunks {
            if *offset != cursor {
                return None;
            }
            cursor = cursor.checked_add(chunk.len() as u32)?;
        }
        if cursor != self.total {
            return None;
        }
        let mut message = Vec::with_capacity(self.total as usize);
        for chunk in self.chunks.values() {
            message.extend_from_slice(chunk);
        }
        Some(message)
    }
}

/// Reassembly state keyed by `(peer, base sequence)`.
#[derive(Debug)]
pub struct Reassembler<K> {
    buffers: HashMap<(K, u32), FragmentBuffer>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> Reassembler<K> {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }

    /// Stores one fragment. Returns the complete message once the declared
    /// total is exactly covered.
    pub fn insert(
        &mut self,
        peer: K,
        base_seq: u32,
        total: u32,
        offset: u32,
        data: &[u8],
        now: Instant,
    ) -> Option<Vec<u8>> {
        if total == 0 || total > MAX_MESSAGE_SIZE {
            debug!("rejecting fragment with absurd total {}", total);
            return None;
        }
        if offset as u64 + data.len() as u64 > total as u64 {
            debug!("rejecting fragment past its declared total");
            return None;
        }

        let key = (peer, base_seq);
        if !self.buffers.contains_key(&key) && self.buffers.len() >= MAX_BUFFERS {
            self.shed_oldest();
        }

        let buffer = self.buffers.entry(key.clone()).or_insert_with(|| FragmentBuffer {
            total,
            first_fragment: now,
            chunks: BTreeMap::new(),
        });
        if buffer.total != total {
            debug!("fragment disagrees on total for {:?}, ignoring", key);
            return None;
        }
        // Duplicate offsets are idempotent; the first arrival wins.
        buffer.chunks.entry(offset).or_insert_with(|| data.to_vec());

        let message = buffer.try_assemble()?;
        self.buffers.remove(&key);
        Some(message)
    }

    /// Drops buffers whose first fragment is older than the timeout.
    pub fn sweep(&mut self, now: Instant) {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now.duration_since(buffer.first_fragment) < FRAGMENT_TIMEOUT);
        let dropped = before - self.buffers.len();
        if dropped > 0 {
            debug!("dropped {} timed-out fragment buffer(s)", dropped);
        }
    }

    /// Forgets everything a departing peer was assembling.
    pub fn remove_peer(&mut self, peer: &K) {
        self.buffers.retain(|(owner, _), _| owner != peer);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn shed_oldest(&mut self) {
        if let Some(key) = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.first_fragment)
            .map(|(key, _)| key.clone())
        {
            warn!("fragment buffer cap reached, dropping oldest {:?}", key);
            self.buffers.remove(&key);
        }
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> Default for Reassembler<K> {
    fn default() -> Self {
        Self::new()
    }
}

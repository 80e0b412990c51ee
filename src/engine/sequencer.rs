//! # Chunk Sequencer
//!
//! The synthesis collaborator may deliver an utterance as several chunks,
//! and the transport does not promise arrival order. The sequencer sits
//! between the wire and the playback queue and decides when each chunk may
//! be released.
//!
//! ## Ordering policies:
//! - **Strict**: chunks carry a 1-based per-utterance sequence index.
//!   Arrivals are parked in a pending buffer until every predecessor has
//!   been released. This is the default.
//! - **Immediate**: every chunk is released the instant it arrives and the
//!   index is ignored. Minimum latency, but transport reordering becomes
//!   audible. Kept as an explicit policy rather than dead code.
//!
//! Chunks without an index are treated as already-next-in-order under
//! either policy: released at once, consuming no index.

use std::collections::HashMap;
use std::str::FromStr;

/// Release policy for synthesized chunks, selected per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingPolicy {
    /// Hold out-of-order chunks until predecessors arrive
    Strict,
    /// Release every chunk on arrival, ignoring its index
    Immediate,
}

impl FromStr for OrderingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(OrderingPolicy::Strict),
            "immediate" => Ok(OrderingPolicy::Immediate),
            _ => Err(format!(
                "Unknown ordering policy: {} (expected \"strict\" or \"immediate\")",
                s
            )),
        }
    }
}

impl Default for OrderingPolicy {
    fn default() -> Self {
        OrderingPolicy::Strict
    }
}

/// One synthesized speech fragment as received from the collaborator.
///
/// A single tagged shape replaces the wire's two historical forms (bare
/// payload vs. indexed object).
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedChunk {
    /// Encoded audio bytes (container or raw PCM; the codec disambiguates)
    pub payload: Vec<u8>,

    /// 1-based per-utterance ordinal; `None` means already-next-in-order
    pub sequence_index: Option<u32>,

    /// Marks the last chunk of the utterance
    pub end_of_utterance: bool,
}

impl SynthesizedChunk {
    pub fn new(payload: Vec<u8>, sequence_index: Option<u32>) -> Self {
        Self {
            payload,
            sequence_index,
            end_of_utterance: false,
        }
    }

    pub fn final_chunk(payload: Vec<u8>, sequence_index: Option<u32>) -> Self {
        Self {
            payload,
            sequence_index,
            end_of_utterance: true,
        }
    }
}

/// Orders synthesized chunks for release to playback.
///
/// ## Invariants:
/// - Under strict ordering, index `k` is released only after `1..k-1`
///   have been released, for any arrival permutation.
/// - A pending index is removed exactly once, when released.
/// - `reset` returns `next_expected` to 1 and clears the pending buffer.
pub struct ChunkSequencer {
    policy: OrderingPolicy,
    next_expected: u32,
    pending: HashMap<u32, Vec<u8>>,
}

impl ChunkSequencer {
    pub fn new(policy: OrderingPolicy) -> Self {
        Self {
            policy,
            next_expected: 1,
            pending: HashMap::new(),
        }
    }

    pub fn policy(&self) -> OrderingPolicy {
        self.policy
    }

    /// Accept one chunk and return every payload now eligible for playback,
    /// in release order.
    pub fn receive(&mut self, chunk: SynthesizedChunk) -> Vec<Vec<u8>> {
        match self.policy {
            OrderingPolicy::Immediate => vec![chunk.payload],
            OrderingPolicy::Strict => match chunk.sequence_index {
                None => {
                    // Unindexed chunks are already-next-in-order: release
                    // immediately without consuming an index.
                    let mut released = vec![chunk.payload];
                    released.extend(self.drain_ready());
                    released
                }
                Some(index) => {
                    if index < self.next_expected {
                        // Duplicate or stale index; its slot was already
                        // released once.
                        tracing::warn!(
                            index,
                            next_expected = self.next_expected,
                            "discarding stale synthesis chunk"
                        );
                        return Vec::new();
                    }
                    self.pending.insert(index, chunk.payload);
                    self.drain_ready()
                }
            },
        }
    }

    /// Release consecutively-available pending chunks starting at
    /// `next_expected`.
    fn drain_ready(&mut self) -> Vec<Vec<u8>> {
        let mut released = Vec::new();
        while let Some(payload) = self.pending.remove(&self.next_expected) {
            released.push(payload);
            self.next_expected += 1;
        }
        released
    }

    /// Discard all pending chunks and restart indexing for a new utterance.
    pub fn reset(&mut self) {
        self.next_expected = 1;
        self.pending.clear();
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32) -> SynthesizedChunk {
        SynthesizedChunk::new(vec![index as u8], Some(index))
    }

    #[test]
    fn test_ordering_policy_parsing() {
        assert_eq!("strict".parse::<OrderingPolicy>().unwrap(), OrderingPolicy::Strict);
        assert_eq!("Immediate".parse::<OrderingPolicy>().unwrap(), OrderingPolicy::Immediate);
        assert!("random".parse::<OrderingPolicy>().is_err());
    }

    #[test]
    fn test_in_order_arrival_releases_immediately() {
        let mut seq = ChunkSequencer::new(OrderingPolicy::Strict);
        assert_eq!(seq.receive(chunk(1)), vec![vec![1]]);
        assert_eq!(seq.receive(chunk(2)), vec![vec![2]]);
        assert_eq!(seq.pending_len(), 0);
        assert_eq!(seq.next_expected(), 3);
    }

    #[test]
    fn test_out_of_order_arrival_is_held() {
        // Scenario: chunks arrive as (2, 1) — chunk 1 must play before 2.
        let mut seq = ChunkSequencer::new(OrderingPolicy::Strict);
        assert!(seq.receive(chunk(2)).is_empty());
        assert_eq!(seq.pending_len(), 1);
        assert_eq!(seq.receive(chunk(1)), vec![vec![1], vec![2]]);
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn test_arbitrary_permutation_releases_in_index_order() {
        let mut seq = ChunkSequencer::new(OrderingPolicy::Strict);
        let mut released = Vec::new();
        for index in [4u32, 2, 5, 1, 3] {
            released.extend(seq.receive(chunk(index)));
        }
        assert_eq!(released, vec![vec![1], vec![2], vec![3], vec![4], vec![5]]);
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn test_immediate_policy_ignores_indices() {
        let mut seq = ChunkSequencer::new(OrderingPolicy::Immediate);
        assert_eq!(seq.receive(chunk(5)), vec![vec![5]]);
        assert_eq!(seq.receive(chunk(2)), vec![vec![2]]);
        assert_eq!(seq.pending_len(), 0);
    }

    #[test]
    fn test_unindexed_chunk_is_already_next() {
        let mut seq = ChunkSequencer::new(OrderingPolicy::Strict);
        assert!(seq.receive(chunk(2)).is_empty());
        // No index: plays now, does not consume index 1's slot
        assert_eq!(
            seq.receive(SynthesizedChunk::new(vec![99], None)),
            vec![vec![99]]
        );
        assert_eq!(seq.receive(chunk(1)), vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_stale_index_discarded() {
        let mut seq = ChunkSequencer::new(OrderingPolicy::Strict);
        seq.receive(chunk(1));
        assert!(seq.receive(chunk(1)).is_empty());
        assert_eq!(seq.next_expected(), 2);
    }

    #[test]
    fn test_reset_clears_pending_and_restarts() {
        let mut seq = ChunkSequencer::new(OrderingPolicy::Strict);
        seq.receive(chunk(1));
        seq.receive(chunk(3));
        assert_eq!(seq.pending_len(), 1);

        seq.reset();
        assert_eq!(seq.next_expected(), 1);
        assert_eq!(seq.pending_len(), 0);
        // A fresh utterance indexes from 1 again
        assert_eq!(seq.receive(chunk(1)), vec![vec![1]]);
    }
}

//! Space reclaim: which stored chunks to evict, and in what order.

use crate::protocol::ChunkKey;

/// A stored chunk considered for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub key: ChunkKey,
    /// observed - desired.
    pub slack: i64,
    pub size: u64,
}

/// Order candidates for a greedy eviction pass: most over-replicated first, chunks
/// below their desired degree last. Ties break by chunk key so the order is stable.
pub fn order_for_eviction(mut candidates: Vec<EvictionCandidate>) -> Vec<EvictionCandidate> {
    candidates.sort_by(|a, b| b.slack.cmp(&a.slack).then_with(|| a.key.cmp(&b.key)));
    candidates
}

/// Bytes that must be freed to get `current` under `max`. Zero when within budget
/// or when no ceiling is set.
pub fn bytes_over(current: u64, max: i64) -> u64 {
    if max < 0 {
        return 0;
    }
    current.saturating_sub(max as u64)
}

/// The prefix of `ordered` a greedy pass evicts to free at least `needed` bytes.
/// Returns every candidate when they cannot free enough.
pub fn select(ordered: &[EvictionCandidate], needed: u64) -> &[EvictionCandidate] {
    if needed == 0 {
        return &[];
    }
    let mut freed = 0u64;
    for (i, candidate) in ordered.iter().enumerate() {
        freed = freed.saturating_add(candidate.size);
        if freed >= needed {
            return &ordered[..=i];
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FileId;

    fn candidate(no: u32, slack: i64, size: u64) -> EvictionCandidate {
        EvictionCandidate {
            key: ChunkKey::new(FileId::derive("f", 1, 1), no),
            slack,
            size,
        }
    }

    #[test]
    fn most_over_replicated_first() {
        let ordered = order_for_eviction(vec![
            candidate(0, -1, 10),
            candidate(1, 2, 10),
            candidate(2, 0, 10),
        ]);
        let order: Vec<u32> = ordered.iter().map(|c| c.key.chunk_no).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn ties_break_by_key() {
        let ordered = order_for_eviction(vec![candidate(5, 1, 1), candidate(3, 1, 1)]);
        assert_eq!(ordered[0].key.chunk_no, 3);
    }

    #[test]
    fn over_budget_amounts() {
        assert_eq!(bytes_over(100, -1), 0);
        assert_eq!(bytes_over(100, 150), 0);
        assert_eq!(bytes_over(100, 60), 40);
        assert_eq!(bytes_over(100, 0), 100);
    }

    #[test]
    fn greedy_prefix() {
        let ordered = vec![candidate(0, 1, 30), candidate(1, 0, 30), candidate(2, 0, 30)];
        assert_eq!(select(&ordered, 0).len(), 0);
        assert_eq!(select(&ordered, 30).len(), 1);
        assert_eq!(select(&ordered, 31).len(), 2);
        assert_eq!(select(&ordered, 1_000).len(), 3);
    }
}

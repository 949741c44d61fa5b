//! Rendezvous (highest-random-weight) hashing of poll targets onto live instances.
//!
//! Every instance computes the same preferred owner from the same inputs, so
//! load is spread without any coordination. When one instance joins or leaves,
//! only the targets it wins (or used to win) change hands.

use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Weight of `candidate` for `target_id`: the first 8 bytes of
/// SHA-256(candidate || target_id), read big-endian.
pub fn weight(candidate: &str, target_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(candidate.as_bytes());
    hasher.update(target_id.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// The instance that should own `target_id` among `nodes`, or `None` if there are none.
///
/// Highest weight wins; equal weights go to the lexicographically smaller ID,
/// so the result is total and independent of the order of `nodes`.
pub fn preferred_owner<'a, S: AsRef<str>>(target_id: &str, nodes: &'a [S]) -> Option<&'a str> {
    nodes
        .iter()
        .map(|n| n.as_ref())
        .map(|n| (weight(n, target_id), n))
        .max_by(|(wa, a), (wb, b)| match wa.cmp(wb) {
            Ordering::Equal => b.cmp(a),
            other => other,
        })
        .map(|(_, n)| n)
}

/// Whether `instance_id` is the preferred owner of `target_id` among `nodes`.
pub fn is_preferred<S: AsRef<str>>(instance_id: &str, target_id: &str, nodes: &[S]) -> bool {
    preferred_owner(target_id, nodes) == Some(instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn nodes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_node_set_has_no_owner() {
        let empty: Vec<String> = vec![];
        assert_eq!(preferred_owner("target-1", &empty), None);
    }

    #[test]
    fn test_single_node_always_wins() {
        let set = nodes(&["node-a"]);
        for i in 0..20 {
            assert_eq!(preferred_owner(&format!("t-{}", i), &set), Some("node-a"));
        }
    }

    #[test]
    fn test_deterministic_and_order_independent() {
        let forward = nodes(&["node-a", "node-b", "node-c"]);
        let reversed = nodes(&["node-c", "node-b", "node-a"]);
        for i in 1..=50 {
            let target = format!("target-{}", i);
            let first = preferred_owner(&target, &forward);
            assert_eq!(first, preferred_owner(&target, &forward));
            assert_eq!(first, preferred_owner(&target, &reversed));
        }
    }

    #[test]
    fn test_known_assignment() {
        let set = nodes(&["node-a", "node-b", "node-c"]);
        let owners: Vec<&str> = (1..=9)
            .map(|i| preferred_owner(&format!("target-{}", i), &set).unwrap())
            .collect();
        assert_eq!(
            owners,
            vec![
                "node-b", "node-b", "node-c", "node-c", "node-a", "node-a", "node-c", "node-a",
                "node-b"
            ]
        );
    }

    #[test]
    fn test_removing_non_owner_keeps_assignment() {
        let five = nodes(&["node-1", "node-2", "node-3", "node-4", "node-5"]);
        for _ in 0..200 {
            let target = uuid::Uuid::new_v4().to_string();
            let owner = preferred_owner(&target, &five).unwrap().to_string();

            for removed in five.iter().filter(|n| **n != owner) {
                let four: Vec<String> = five.iter().filter(|n| *n != removed).cloned().collect();
                assert_eq!(
                    preferred_owner(&target, &four),
                    Some(owner.as_str()),
                    "removing {} moved {}",
                    removed,
                    target
                );
            }
        }
    }

    #[test]
    fn test_removing_owner_moves_only_its_targets() {
        let five = nodes(&["node-1", "node-2", "node-3", "node-4", "node-5"]);
        let four = nodes(&["node-1", "node-2", "node-3", "node-4"]);
        for i in 0..500 {
            let target = format!("session-{}", i);
            let before = preferred_owner(&target, &five).unwrap();
            let after = preferred_owner(&target, &four).unwrap();
            if before != "node-5" {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_spread_is_roughly_uniform() {
        let set = nodes(&["node-a", "node-b", "node-c"]);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for i in 0..3000 {
            let owner = preferred_owner(&format!("session-{}", i), &set).unwrap();
            *counts.entry(owner).or_default() += 1;
        }
        for id in ["node-a", "node-b", "node-c"] {
            let n = counts.get(id).copied().unwrap_or(0);
            assert!((800..=1200).contains(&n), "{} got {}", id, n);
        }
    }

    #[test]
    fn test_is_preferred() {
        let set = nodes(&["node-a", "node-b", "node-c"]);
        assert!(is_preferred("node-b", "target-1", &set));
        assert!(!is_preferred("node-a", "target-1", &set));
    }
}

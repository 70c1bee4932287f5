//! Index bookkeeping shared by both backends.
//!
//! Clip items, album items and albums all carry a 1-based `index` that must stay
//! dense (1..N) after every insert, delete and reorder. The backends fetch the
//! current order, run one of these helpers and write back only what changed.

use std::collections::BTreeSet;
use std::fmt::Display;

use crate::errors::{Result, StorageError};

/// Drops repeated ids, keeping the first occurrence.
pub fn unique<T: Ord + Copy>(ids: &[T]) -> Vec<T> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Resolves every id or fails with `NotFound` naming the first missing one.
pub fn resolve_all<K, V>(
    ids: &[K],
    what: &str,
    mut lookup: impl FnMut(K) -> Result<Option<V>>,
) -> Result<Vec<V>>
where
    K: Ord + Copy + Display,
{
    let mut values = Vec::with_capacity(ids.len());
    for id in unique(ids) {
        match lookup(id)? {
            Some(value) => values.push(value),
            None => return Err(StorageError::NotFound(format!("{} {}", what, id))),
        }
    }
    Ok(values)
}

/// Checks that `requested` is a permutation of `current`.
pub fn require_same_members<T: Ord + Copy>(requested: &[T], current: &[T], what: &str) -> Result<()> {
    let requested_set: BTreeSet<T> = requested.iter().copied().collect();
    let current_set: BTreeSet<T> = current.iter().copied().collect();
    if requested_set.len() != requested.len() {
        return Err(StorageError::InvalidParameter(format!(
            "{} order contains repeated entries",
            what
        )));
    }
    if requested_set != current_set {
        return Err(StorageError::InvalidParameter(format!(
            "{} order does not match the current members",
            what
        )));
    }
    Ok(())
}

/// Fails with `InvalidParameter` naming the first value that repeats.
pub fn require_distinct<'a>(values: impl IntoIterator<Item = &'a str>, what: &str) -> Result<()> {
    let mut seen = BTreeSet::new();
    for value in values {
        if !seen.insert(value) {
            return Err(StorageError::InvalidParameter(format!("{} {:?} repeats", what, value)));
        }
    }
    Ok(())
}

/// Positions 1..N for ids already in their final order.
pub fn dense_positions<T: Copy>(ordered: &[T]) -> Vec<(T, i64)> {
    ordered
        .iter()
        .enumerate()
        .map(|(offset, id)| (*id, offset as i64 + 1))
        .collect()
}

/// Sorts `(id, index)` pairs by index and returns only the entries whose index
/// has to change to close gaps.
pub fn renumber<T: Copy>(entries: &[(T, i64)]) -> Vec<(T, i64)> {
    let mut sorted: Vec<(T, i64)> = entries.to_vec();
    sorted.sort_by_key(|(_, index)| *index);
    sorted
        .iter()
        .enumerate()
        .filter_map(|(offset, (id, index))| {
            let expected = offset as i64 + 1;
            (*index != expected).then_some((*id, expected))
        })
        .collect()
}

/// Next index for an append: one past the current maximum.
pub fn next_index(indices: impl IntoIterator<Item = i64>) -> i64 {
    indices.into_iter().max().unwrap_or(0) + 1
}

/// Replaces `targets` inside `order` with `replacement`, placed where the first
/// target sat. Returns `None` when no target is a member.
pub fn splice_members<T: Copy + PartialEq>(order: &[T], targets: &[T], replacement: &[T]) -> Option<Vec<T>> {
    let position = order.iter().position(|id| targets.contains(id))?;
    let mut result: Vec<T> = order[..position]
        .iter()
        .copied()
        .filter(|id| !targets.contains(id))
        .collect();
    for id in replacement {
        if !result.contains(id) {
            result.push(*id);
        }
    }
    for id in &order[position..] {
        if !targets.contains(id) && !result.contains(id) {
            result.push(*id);
        }
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_keeps_first_occurrence() {
        assert_eq!(unique(&[3, 1, 3, 2, 1]), vec![3, 1, 2]);
    }

    #[test]
    fn test_resolve_all_fails_on_first_missing() {
        let result = resolve_all(&[1, 2, 3], "clip", |id| Ok((id != 2).then_some(id * 10)));
        assert!(matches!(result, Err(StorageError::NotFound(ref m)) if m == "clip 2"));
    }

    #[test]
    fn test_resolve_all_collapses_repeats() {
        let values = resolve_all(&[1, 1, 2], "tag", |id| Ok(Some(id))).unwrap();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_require_same_members_accepts_permutation() {
        assert!(require_same_members(&[3, 1, 2], &[1, 2, 3], "item").is_ok());
    }

    #[test]
    fn test_require_same_members_rejects_subset() {
        let result = require_same_members(&[1, 2], &[1, 2, 3], "item");
        assert!(matches!(result, Err(StorageError::InvalidParameter(_))));
    }

    #[test]
    fn test_require_same_members_rejects_repeats() {
        let result = require_same_members(&[1, 1, 2], &[1, 2], "item");
        assert!(matches!(result, Err(StorageError::InvalidParameter(_))));
    }

    #[test]
    fn test_require_distinct_names_first_repeat() {
        let result = require_distinct(["a", "b", "a"], "image file name");
        assert!(matches!(result, Err(StorageError::InvalidParameter(ref m)) if m.contains("\"a\"")));
        assert!(require_distinct(["a", "b"], "image file name").is_ok());
    }

    #[test]
    fn test_dense_positions() {
        assert_eq!(dense_positions(&['a', 'b']), vec![('a', 1), ('b', 2)]);
    }

    #[test]
    fn test_renumber_closes_gap() {
        let changes = renumber(&[('a', 1), ('c', 3), ('d', 4)]);
        assert_eq!(changes, vec![('c', 2), ('d', 3)]);
    }

    #[test]
    fn test_renumber_dense_is_noop() {
        assert!(renumber(&[('b', 2), ('a', 1)]).is_empty());
    }

    #[test]
    fn test_next_index() {
        assert_eq!(next_index(vec![]), 1);
        assert_eq!(next_index(vec![1, 4, 2]), 5);
    }

    #[test]
    fn test_splice_members_replaces_in_place() {
        let spliced = splice_members(&[1, 2, 3], &[2], &[7, 8]).unwrap();
        assert_eq!(spliced, vec![1, 7, 8, 3]);
    }

    #[test]
    fn test_splice_members_uses_first_target_position() {
        let spliced = splice_members(&[1, 2, 3, 4], &[4, 2], &[9]).unwrap();
        assert_eq!(spliced, vec![1, 9, 3]);
    }

    #[test]
    fn test_splice_members_skips_existing_replacement() {
        let spliced = splice_members(&[5, 1, 2, 3], &[2], &[3, 5, 3, 6]).unwrap();
        assert_eq!(spliced, vec![5, 1, 3, 6]);
    }

    #[test]
    fn test_splice_members_without_target() {
        assert!(splice_members(&[1, 2], &[5], &[9]).is_none());
    }
}

//! Condition matching in the u64 key domain of an index.
//!
//! `match_tree` evaluates a condition exactly against the keys of a loaded
//! pack. `maybe_match_tree` only looks at pack statistics and may return
//! false positives but never false negatives.

use roaring::RoaringBitmap;

use crate::index::state::PackStats;

/// A single key condition. List variants hold sorted, deduplicated keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    Equal(u64),
    In(Vec<u64>),
    NotIn(Vec<u64>),
    Lt(u64),
    Le(u64),
    Gt(u64),
    Ge(u64),
    Range(u64, u64),
}

impl KeyMatch {
    pub fn in_list(mut keys: Vec<u64>) -> Self {
        keys.sort_unstable();
        keys.dedup();
        KeyMatch::In(keys)
    }

    pub fn not_in_list(mut keys: Vec<u64>) -> Self {
        keys.sort_unstable();
        keys.dedup();
        KeyMatch::NotIn(keys)
    }

    pub fn matches(&self, k: u64) -> bool {
        match self {
            KeyMatch::Equal(v) => k == *v,
            KeyMatch::In(list) => list.binary_search(&k).is_ok(),
            KeyMatch::NotIn(list) => list.binary_search(&k).is_err(),
            KeyMatch::Lt(v) => k < *v,
            KeyMatch::Le(v) => k <= *v,
            KeyMatch::Gt(v) => k > *v,
            KeyMatch::Ge(v) => k >= *v,
            KeyMatch::Range(from, to) => *from <= k && k <= *to,
        }
    }

    /// Reports whether any key in `[min, max]` can match.
    pub fn match_range(&self, min: u64, max: u64) -> bool {
        if min > max {
            return false;
        }
        match self {
            KeyMatch::Equal(v) => min <= *v && *v <= max,
            KeyMatch::In(list) => {
                let i = list.partition_point(|k| *k < min);
                i < list.len() && list[i] <= max
            }
            KeyMatch::NotIn(list) => {
                // false only when every key in the range is excluded
                let lo = list.partition_point(|k| *k < min);
                let hi = list.partition_point(|k| *k <= max);
                ((hi - lo) as u128) < (max - min) as u128 + 1
            }
            KeyMatch::Lt(v) => min < *v,
            KeyMatch::Le(v) => min <= *v,
            KeyMatch::Gt(v) => max > *v,
            KeyMatch::Ge(v) => max >= *v,
            KeyMatch::Range(from, to) => *from <= max && min <= *to,
        }
    }

    /// Smallest interval containing every matching key, or `None` when no
    /// key can match.
    pub fn bounds(&self) -> Option<(u64, u64)> {
        match self {
            KeyMatch::Equal(v) => Some((*v, *v)),
            KeyMatch::In(list) => Some((*list.first()?, *list.last()?)),
            KeyMatch::NotIn(_) => Some((0, u64::MAX)),
            KeyMatch::Lt(v) => v.checked_sub(1).map(|m| (0, m)),
            KeyMatch::Le(v) => Some((0, *v)),
            KeyMatch::Gt(v) => v.checked_add(1).map(|m| (m, u64::MAX)),
            KeyMatch::Ge(v) => Some((*v, u64::MAX)),
            KeyMatch::Range(from, to) if from <= to => Some((*from, *to)),
            KeyMatch::Range(..) => None,
        }
    }
}

/// A tree of key conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    Leaf(KeyMatch),
    And(Vec<KeyFilter>),
    Or(Vec<KeyFilter>),
}

impl KeyFilter {
    pub fn matches(&self, k: u64) -> bool {
        match self {
            KeyFilter::Leaf(m) => m.matches(k),
            KeyFilter::And(c) => c.iter().all(|f| f.matches(k)),
            KeyFilter::Or(c) => c.iter().any(|f| f.matches(k)),
        }
    }

    /// Returns the positions in `keys` that satisfy the tree.
    pub fn match_tree(&self, keys: &[u64]) -> RoaringBitmap {
        match self {
            KeyFilter::Leaf(m) => keys
                .iter()
                .enumerate()
                .filter(|(_, k)| m.matches(**k))
                .map(|(i, _)| i as u32)
                .collect(),
            KeyFilter::And(children) => {
                let mut iter = children.iter();
                let Some(first) = iter.next() else {
                    return (0..keys.len() as u32).collect();
                };
                let mut bits = first.match_tree(keys);
                for c in iter {
                    if bits.is_empty() {
                        break;
                    }
                    bits &= c.match_tree(keys);
                }
                bits
            }
            KeyFilter::Or(children) => {
                let mut bits = RoaringBitmap::new();
                for c in children {
                    bits |= c.match_tree(keys);
                }
                bits
            }
        }
    }

    /// Decides from pack statistics whether the pack may hold a match.
    /// Empty packs never match.
    pub fn maybe_match_tree(&self, stats: &PackStats) -> bool {
        if stats.n_values == 0 {
            return false;
        }
        self.maybe_match_range(stats.min_key, stats.max_key)
    }

    fn maybe_match_range(&self, min: u64, max: u64) -> bool {
        match self {
            KeyFilter::Leaf(m) => m.match_range(min, max),
            KeyFilter::And(c) => c.iter().all(|f| f.maybe_match_range(min, max)),
            KeyFilter::Or(c) => c.iter().any(|f| f.maybe_match_range(min, max)),
        }
    }

    /// Hull of all keys that can match, used to bound a scan.
    pub fn bounds(&self) -> Option<(u64, u64)> {
        match self {
            KeyFilter::Leaf(m) => m.bounds(),
            KeyFilter::And(children) => {
                let mut hull = (0, u64::MAX);
                for c in children {
                    let (lo, hi) = c.bounds()?;
                    hull = (hull.0.max(lo), hull.1.min(hi));
                    if hull.0 > hull.1 {
                        return None;
                    }
                }
                Some(hull)
            }
            KeyFilter::Or(children) => children
                .iter()
                .filter_map(|c| c.bounds())
                .reduce(|a, b| (a.0.min(b.0), a.1.max(b.1))),
        }
    }
}

//! The sparse primary-key index and mark-range selection.

use strata_error::Result;
use strata_types::Field;

use crate::part::DataPart;

/// Inclusive bounds on one key column. `None` = unbounded.
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    pub min: Option<Field>,
    pub max: Option<Field>,
}

impl KeyRange {
    #[must_use]
    pub fn point(value: Field) -> Self {
        Self {
            min: Some(value.clone()),
            max: Some(value),
        }
    }

    #[must_use]
    pub fn at_least(value: Field) -> Self {
        Self {
            min: Some(value),
            max: None,
        }
    }

    #[must_use]
    pub fn at_most(value: Field) -> Self {
        Self {
            min: None,
            max: Some(value),
        }
    }
}

/// A conjunction of per-key-column ranges, the reader's predicate over
/// the primary key.
///
/// Pruning is conservative: only the condition on the first key column
/// can exclude a mark interval outright (the index is sorted by the
/// full tuple, so later columns only bound rows within equal prefixes).
/// A condition that cannot exclude an interval keeps it.
#[derive(Debug, Clone, Default)]
pub struct KeyCondition {
    /// `(key column position, range)` conjuncts.
    pub ranges: Vec<(usize, KeyRange)>,
}

impl KeyCondition {
    /// Matches everything.
    #[must_use]
    pub fn always() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_range(column: usize, range: KeyRange) -> Self {
        Self {
            ranges: vec![(column, range)],
        }
    }

    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether rows with first-key values in `[left, right]` may match.
    /// `right = None` means unbounded above.
    #[must_use]
    pub fn may_match_first_key(&self, left: &Field, right: Option<&Field>) -> bool {
        for (column, range) in &self.ranges {
            if *column != 0 {
                continue;
            }
            if let Some(min) = &range.min {
                // The whole interval is below the required minimum; an
                // interval unbounded above always reaches it.
                if let Some(right) = right {
                    if right.cmp_with_nan_hint(min, 1).is_lt() {
                        return false;
                    }
                }
            }
            if let Some(max) = &range.max {
                // The whole interval is above the required maximum.
                if left.cmp_with_nan_hint(max, 1).is_gt() {
                    return false;
                }
            }
        }
        true
    }
}

/// A half-open interval of marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkRange {
    pub begin: usize,
    pub end: usize,
}

impl MarkRange {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.begin
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
}

/// Narrow the part's marks to the ranges that may satisfy `condition`.
///
/// Coarse binary refinement: starting from the whole part, every
/// candidate interval longer than `coarse_granularity` is split into
/// `coarse_granularity` sub-intervals; sub-intervals whose key bounds
/// cannot match are dropped, survivors are refined further. Adjacent
/// surviving ranges merge in the result.
pub fn select_mark_ranges(
    part: &DataPart,
    condition: &KeyCondition,
    coarse_granularity: usize,
) -> Result<Vec<MarkRange>> {
    let marks = part.marks;
    if marks == 0 {
        return Ok(Vec::new());
    }
    if condition.is_trivial() || part.key_arity == 0 {
        return Ok(vec![MarkRange {
            begin: 0,
            end: marks,
        }]);
    }

    let coarse = coarse_granularity.max(2);
    let mut result: Vec<MarkRange> = Vec::new();
    // Depth-first with the leftmost interval on top keeps the result
    // ordered without a sort.
    let mut stack = vec![MarkRange {
        begin: 0,
        end: marks,
    }];

    while let Some(range) = stack.pop() {
        let left_key = &part.index_row(range.begin)[0];
        // The first key of the mark after the range bounds it above;
        // the last range is unbounded.
        let right_key = if range.end < marks {
            Some(&part.index_row(range.end)[0])
        } else {
            None
        };
        if !condition.may_match_first_key(left_key, right_key) {
            continue;
        }

        if range.len() <= 1 {
            match result.last_mut() {
                Some(last) if last.end == range.begin => last.end = range.end,
                _ => result.push(range),
            }
            continue;
        }

        // Split right-to-left so the leftmost piece is popped first.
        let step = range.len().div_ceil(coarse);
        let mut piece_end = range.end;
        while piece_end > range.begin {
            let piece_begin = piece_end.saturating_sub(step).max(range.begin);
            stack.push(MarkRange {
                begin: piece_begin,
                end: piece_end,
            });
            piece_end = piece_begin;
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::Checksums;
    use crate::part::PartInfo;
    use parking_lot::{Mutex, RwLock};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    /// A part skeleton with a given first-key index (one key column).
    fn part_with_index(keys: Vec<u64>) -> DataPart {
        let marks = keys.len();
        DataPart {
            info: PartInfo::parse("201612_1_1_0").expect("info"),
            name: "201612_1_1_0".into(),
            storage_path: std::path::PathBuf::from("/nonexistent"),
            rows: (marks * 10) as u64,
            marks,
            size_in_bytes: 0,
            index: keys.into_iter().map(Field::UInt64).collect(),
            key_arity: 1,
            checksums: RwLock::new(Checksums::new()),
            columns: RwLock::new(Vec::new()),
            columns_lock: Arc::new(RwLock::new(())),
            alter_mutex: Arc::new(Mutex::new(())),
            currently_merging: AtomicBool::new(false),
            remove_time: Mutex::new(None),
        }
    }

    #[test]
    fn test_trivial_condition_selects_everything() {
        let part = part_with_index((0..32).map(|i| i * 100).collect());
        let ranges =
            select_mark_ranges(&part, &KeyCondition::always(), 8).expect("select");
        assert_eq!(ranges, vec![MarkRange { begin: 0, end: 32 }]);
    }

    #[test]
    fn test_point_lookup_narrows() {
        let part = part_with_index((0..64).map(|i| i * 100).collect());
        let condition = KeyCondition::with_range(0, KeyRange::point(Field::UInt64(1_234)));
        let ranges = select_mark_ranges(&part, &condition, 8).expect("select");
        let total: usize = ranges.iter().map(MarkRange::len).sum();
        assert!(total <= 4, "selected {total} marks for a point lookup");
        // Key 1234 lives in the mark whose range [1200, 1300) holds it.
        assert!(ranges.iter().any(|r| r.begin <= 12 && r.end > 12));
    }

    #[test]
    fn test_range_condition_keeps_order_and_merges() {
        let part = part_with_index((0..100).collect());
        let condition = KeyCondition::with_range(
            0,
            KeyRange {
                min: Some(Field::UInt64(10)),
                max: Some(Field::UInt64(40)),
            },
        );
        let ranges = select_mark_ranges(&part, &condition, 4).expect("select");
        for window in ranges.windows(2) {
            assert!(window[0].end <= window[1].begin, "ranges must be ordered");
        }
        let total: usize = ranges.iter().map(MarkRange::len).sum();
        assert!(total >= 31, "lost marks containing matching keys");
        assert!(total < 100, "no pruning happened");
    }

    #[test]
    fn test_out_of_range_prunes_all() {
        let part = part_with_index((0..32).map(|i| i * 2).collect());
        let condition =
            KeyCondition::with_range(0, KeyRange::at_least(Field::UInt64(1_000_000)));
        let ranges = select_mark_ranges(&part, &condition, 8).expect("select");
        // Only the unbounded tail range may survive.
        let total: usize = ranges.iter().map(MarkRange::len).sum();
        assert!(total <= 1);
    }
}

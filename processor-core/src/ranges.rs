//! Event-id intervals inside one source-data unit. A task that only covers part of a unit stores
//! its ranges serialized as `1-4,9,12-20`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InclusiveRange {
    pub min: i64,
    pub max: i64,
}

impl InclusiveRange {
    pub fn new(min: i64, max: i64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn count(&self) -> u64 {
        (self.max - self.min) as u64 + 1
    }

    pub fn contains(&self, id: i64) -> bool {
        id >= self.min && id <= self.max
    }

    /// Overlapping or directly adjacent ranges can be merged into one.
    fn touches(&self, other: &InclusiveRange) -> bool {
        self.min <= other.max.saturating_add(1) && other.min <= self.max.saturating_add(1)
    }
}

impl fmt::Display for InclusiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// Sorted, disjoint and non-adjacent ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusiveRanges {
    ranges: Vec<InclusiveRange>,
}

impl InclusiveRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, id: i64) {
        self.add_range(InclusiveRange::new(id, id));
    }

    pub fn add_range(&mut self, range: InclusiveRange) {
        // events usually arrive in order, so try the tail first
        if let Some(last) = self.ranges.last_mut() {
            if last.max < range.min && last.touches(&range) {
                last.max = range.max;
                return;
            }
            if last.max.saturating_add(1) < range.min {
                self.ranges.push(range);
                return;
            }
        }

        let mut merged = range;
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        let mut inserted = false;
        for existing in self.ranges.drain(..) {
            if existing.touches(&merged) {
                merged = InclusiveRange::new(existing.min.min(merged.min), existing.max.max(merged.max));
            } else if existing.max < merged.min {
                result.push(existing);
            } else {
                if !inserted {
                    result.push(merged);
                    inserted = true;
                }
                result.push(existing);
            }
        }
        if !inserted {
            result.push(merged);
        }
        self.ranges = result;
    }

    pub fn ranges(&self) -> &[InclusiveRange] {
        &self.ranges
    }

    /// Number of distinct ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of events covered.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(InclusiveRange::count).sum()
    }

    pub fn outer_range(&self) -> Option<InclusiveRange> {
        match (self.ranges.first(), self.ranges.last()) {
            (Some(first), Some(last)) => Some(InclusiveRange::new(first.min, last.max)),
            _ => None,
        }
    }

    /// The first `n` ranges.
    pub fn sub_ranges(&self, n: usize) -> InclusiveRanges {
        InclusiveRanges {
            ranges: self.ranges.iter().take(n).copied().collect(),
        }
    }
}

impl fmt::Display for InclusiveRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

impl FromStr for InclusiveRanges {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = InclusiveRanges::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let parse = |v: &str| {
                v.trim()
                    .parse::<i64>()
                    .map_err(|e| Error::Store(format!("invalid event range '{part}': {e}")))
            };
            // a leading '-' belongs to a negative number, so split after the first char
            let range = match part.get(1..).and_then(|rest| rest.find('-')) {
                Some(idx) => InclusiveRange::new(parse(&part[..=idx])?, parse(&part[idx + 2..])?),
                None => {
                    let id = parse(part)?;
                    InclusiveRange::new(id, id)
                }
            };
            ranges.add_range(range);
        }
        Ok(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjacent_events_merge() {
        let mut ranges = InclusiveRanges::new();
        for id in [1, 2, 3, 7, 8, 5] {
            ranges.add_event(id);
        }
        assert_eq!(ranges.to_string(), "1-3,5,7-8");
        assert_eq!(ranges.count(), 6);

        ranges.add_event(4);
        ranges.add_event(6);
        assert_eq!(ranges.to_string(), "1-8");
        assert_eq!(ranges.len(), 1);
    }

    #[test]
    fn test_overlapping_range_swallows_neighbours() {
        let mut ranges: InclusiveRanges = "1-2,5-6,10-12".parse().unwrap();
        ranges.add_range(InclusiveRange::new(3, 10));
        assert_eq!(ranges.ranges(), &[InclusiveRange::new(1, 12)]);
    }

    #[test]
    fn test_outer_and_sub_ranges() {
        let ranges: InclusiveRanges = "4,9-11,20".parse().unwrap();
        assert_eq!(ranges.outer_range(), Some(InclusiveRange::new(4, 20)));
        assert_eq!(ranges.sub_ranges(2).to_string(), "4,9-11");
        assert_eq!(InclusiveRanges::new().outer_range(), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("1-x".parse::<InclusiveRanges>().is_err());
    }
}

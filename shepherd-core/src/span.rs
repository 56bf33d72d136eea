use serde::{Deserialize, Serialize};
use std::cmp::{max, min};
use std::fmt::{self, Debug, Display};

/// Half-open one-dimensional index range `[offset, offset + length)`.
///
/// This is the unit of work for the distribution engine: an array dimension or a loop range is
/// described by a `Span` and every device is assigned a sub-`Span` of it.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub offset: u64,
    pub length: u64,
}

impl Span {
    #[inline(always)]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Span `[lo, hi)`. Returns an empty span at `lo` if `hi < lo`.
    #[inline]
    pub fn from_bounds(lo: u64, hi: u64) -> Self {
        Self {
            offset: lo,
            length: hi.saturating_sub(lo),
        }
    }

    #[inline(always)]
    pub const fn empty_at(offset: u64) -> Self {
        Self { offset, length: 0 }
    }

    #[inline(always)]
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns true if `other` lies entirely within this span. Empty spans are contained if
    /// their offset lies within the bounds (inclusive of the end).
    #[inline]
    pub fn contains(&self, other: Span) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    #[inline]
    pub fn contains_index(&self, index: u64) -> bool {
        self.offset <= index && index < self.end()
    }

    /// Intersection of two spans, `None` if they do not overlap.
    pub fn intersection(self, other: Span) -> Option<Span> {
        let lo = max(self.offset, other.offset);
        let hi = min(self.end(), other.end());

        if lo < hi {
            Some(Span::from_bounds(lo, hi))
        } else {
            None
        }
    }

    /// Clip `other` into this span. The result is always contained in `self`, even if the two
    /// are disjoint (in which case an empty span at the nearest bound is returned).
    pub fn clip(self, other: Span) -> Span {
        let lo = min(max(self.offset, other.offset), self.end());
        let hi = max(min(self.end(), other.end()), lo);
        Span::from_bounds(lo, hi)
    }

    /// Shift this span by `delta`, saturating at zero.
    pub fn shift(self, delta: i64) -> Span {
        let offset = if delta >= 0 {
            self.offset.saturating_add(delta as u64)
        } else {
            self.offset.saturating_sub(delta.unsigned_abs())
        };

        Span::new(offset, self.length)
    }
}

impl Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{})", self.offset, self.end())
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl From<std::ops::Range<u64>> for Span {
    fn from(range: std::ops::Range<u64>) -> Self {
        Span::from_bounds(range.start, range.end)
    }
}

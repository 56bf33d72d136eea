//! Pure partitioning functions. All spans are relative to the start of the range, callers add
//! the range offset.
use crate::prelude::*;
use crate::types::Span;
use shepherd_core::util::div_ceil;

/// Even split where the first `length % count` positions get one extra element.
pub(super) fn block(length: u64, index: usize, count: usize) -> Span {
    let (index, count) = (index as u64, count as u64);
    let base = length / count;
    let rem = length % count;

    Span::new(index * base + min(index, rem), base + (index < rem) as u64)
}

/// Split proportionally to `weights` using cumulative rounding, which guarantees the spans
/// partition the range exactly no matter how the weights round.
pub(super) fn weighted(length: u64, index: usize, weights: &[f64]) -> Span {
    let count = weights.len();
    let valid = all(weights, |w| w.is_finite() && *w >= 0.0);
    let total: f64 = weights.iter().sum();

    if !valid || total <= 0.0 {
        return block(length, index, count);
    }

    let bound = |i: usize| -> u64 {
        if i >= count {
            return length;
        }

        let prefix: f64 = weights[..i].iter().sum();
        let b = (prefix / total * length as f64).round() as u64;
        min(b, length)
    };

    Span::from_bounds(bound(index), bound(index + 1))
}

/// Fixed chunk of `chunk` elements per position, the last position takes the remainder.
pub(super) fn static_chunk(length: u64, index: usize, count: usize, chunk: u64) -> Span {
    let lo = min((index as u64).saturating_mul(chunk), length);
    let hi = if index + 1 == count {
        length
    } else {
        min(lo.saturating_add(chunk), length)
    };

    Span::from_bounds(lo, hi)
}

/// The `round`-th chunk owned by position `index` under round-robin assignment, or an empty
/// span at the end if the range has been exhausted.
pub(super) fn cyclic(length: u64, index: usize, count: usize, chunk: u64, round: u64) -> Span {
    let nth = index as u64 + round * count as u64;
    let lo = nth.saturating_mul(chunk);

    if lo >= length {
        Span::empty_at(length)
    } else {
        Span::from_bounds(lo, min(lo + chunk, length))
    }
}

/// Number of rounds needed to hand out all chunks of a cyclic distribution.
pub(super) fn cyclic_rounds(length: u64, count: usize, chunk: u64) -> u64 {
    div_ceil(div_ceil(length, chunk), count as u64)
}

#[cfg(test)]
mod test {
    use super::*;

    fn check_partition(length: u64, spans: &[Span]) {
        let mut expected = 0;
        for s in spans {
            assert_eq!(s.offset, expected, "{:?}", spans);
            expected = s.end();
        }

        assert_eq!(expected, length, "{:?}", spans);
    }

    #[test]
    fn test_block() {
        let spans = (0..4).map(|i| block(10, i, 4)).collect_vec();
        assert_eq!(
            spans,
            [Span::new(0, 3), Span::new(3, 3), Span::new(6, 2), Span::new(8, 2)]
        );

        for &(length, count) in &[(0, 3), (1, 5), (7, 7), (1000, 3)] {
            let spans = (0..count).map(|i| block(length, i, count)).collect_vec();
            check_partition(length, &spans);
        }
    }

    #[test]
    fn test_weighted() {
        let weights = [1.0, 2.0, 1.0];
        let spans = (0..3).map(|i| weighted(100, i, &weights)).collect_vec();
        assert_eq!(spans, [Span::new(0, 25), Span::new(25, 50), Span::new(75, 25)]);

        let weights = [0.3, 0.3, 0.3];
        let spans = (0..3).map(|i| weighted(10, i, &weights)).collect_vec();
        check_partition(10, &spans);

        // degenerate weights fall back to an even split
        let spans = (0..2).map(|i| weighted(9, i, &[0.0, 0.0])).collect_vec();
        assert_eq!(spans, [Span::new(0, 5), Span::new(5, 4)]);
        let spans = (0..2).map(|i| weighted(9, i, &[f64::NAN, 1.0])).collect_vec();
        check_partition(9, &spans);
    }

    #[test]
    fn test_static_chunk() {
        let spans = (0..3).map(|i| static_chunk(100, i, 3, 20)).collect_vec();
        assert_eq!(spans, [Span::new(0, 20), Span::new(20, 20), Span::new(40, 60)]);

        let spans = (0..3).map(|i| static_chunk(30, i, 3, 20)).collect_vec();
        assert_eq!(spans, [Span::new(0, 20), Span::new(20, 10), Span::new(30, 0)]);
    }

    #[test]
    fn test_cyclic() {
        assert_eq!(cyclic(40, 0, 2, 10, 0), Span::new(0, 10));
        assert_eq!(cyclic(40, 1, 2, 10, 0), Span::new(10, 10));
        assert_eq!(cyclic(40, 0, 2, 10, 1), Span::new(20, 10));
        assert_eq!(cyclic(40, 1, 2, 10, 1), Span::new(30, 10));
        assert_eq!(cyclic(40, 0, 2, 10, 2), Span::empty_at(40));
        assert_eq!(cyclic(45, 0, 2, 10, 2), Span::new(40, 5));

        assert_eq!(cyclic_rounds(40, 2, 10), 2);
        assert_eq!(cyclic_rounds(45, 2, 10), 3);
        assert_eq!(cyclic_rounds(0, 2, 10), 0);
    }
}

use crossbeam::atomic::AtomicCell;
use shepherd_core::util::div_ceil;

use crate::prelude::*;
use crate::types::Span;

/// Shared cursor from which positions claim successive chunks of a range.
///
/// The cursor only ever moves forward. Once it reaches the end of the range every claim
/// returns an empty span at the end of the range.
#[derive(Debug, Default)]
pub struct RaceCounter {
    cursor: AtomicCell<u64>,
}

impl RaceCounter {
    pub fn new() -> Self {
        default()
    }

    /// Number of elements claimed so far (may exceed the range length).
    pub fn position(&self) -> u64 {
        self.cursor.load()
    }

    /// Start handing out chunks from the beginning of the range again.
    pub fn reset(&self) {
        self.cursor.store(0);
    }

    /// Claim the next `chunk` elements of a range of `length` elements.
    pub fn claim_fixed(&self, length: u64, chunk: u64) -> Span {
        let lo = self.cursor.fetch_add(chunk);

        if lo >= length {
            Span::empty_at(length)
        } else {
            Span::from_bounds(lo, min(lo.saturating_add(chunk), length))
        }
    }

    /// Claim a chunk whose size shrinks with the remaining work: `remaining / (2 * count)`
    /// rounded up, but never less than `min_chunk`.
    pub fn claim_guided(&self, length: u64, count: usize, min_chunk: u64) -> Span {
        let mut lo = self.cursor.load();

        loop {
            if lo >= length {
                return Span::empty_at(length);
            }

            let remaining = length - lo;
            let chunk = max(min_chunk, div_ceil(remaining, 2 * count as u64));
            let hi = lo + min(chunk, remaining);

            match self.cursor.compare_exchange(lo, hi) {
                Ok(_) => return Span::from_bounds(lo, hi),
                Err(current) => lo = current,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain<F>(claim: F) -> Vec<Span>
    where
        F: Fn() -> Span,
    {
        let mut spans = vec![];
        loop {
            let s = claim();
            if s.is_empty() {
                break spans;
            }

            spans.push(s);
        }
    }

    #[test]
    fn test_fixed() {
        let counter = RaceCounter::new();
        let spans = drain(|| counter.claim_fixed(25, 10));
        assert_eq!(spans, [Span::new(0, 10), Span::new(10, 10), Span::new(20, 5)]);
        assert_eq!(counter.claim_fixed(25, 10), Span::empty_at(25));

        counter.reset();
        assert_eq!(counter.claim_fixed(25, 10), Span::new(0, 10));
    }

    #[test]
    fn test_guided() {
        let counter = RaceCounter::new();
        let spans = drain(|| counter.claim_guided(100, 2, 5));

        // chunks shrink but never below the minimum (except for the final remainder)
        let lengths = spans.iter().map(|s| s.length).collect_vec();
        assert_eq!(lengths[0], 25);
        assert!(lengths.windows(2).all(|w| w[0] >= w[1]));
        assert!(lengths[..lengths.len() - 1].iter().all(|&l| l >= 5));
        assert_eq!(lengths.iter().sum::<u64>(), 100);
    }

    #[test]
    fn test_concurrent_claims() {
        let counter = RaceCounter::new();
        let claimed = Mutex::new(vec![]);

        crossbeam::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    let mine = drain(|| counter.claim_guided(10_000, 4, 7));
                    claimed.lock().extend(mine);
                });
            }
        })
        .unwrap();

        let mut claimed = claimed.into_inner();
        claimed.sort_by_key(|s| s.offset);

        let mut expected = 0;
        for s in claimed {
            assert_eq!(s.offset, expected);
            expected = s.end();
        }

        assert_eq!(expected, 10_000);
    }
}

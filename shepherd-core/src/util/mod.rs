//! Collection of utility functions.

/// Divide `x` by `y` and round up towards infinity. For example, `21/5 = 4.2` thus
/// `div_ceil(21, 5) == 5`.
///
/// # Panics
/// If `y` is zero.
#[inline]
pub fn div_ceil(x: u64, y: u64) -> u64 {
    let (q, r) = (x / y, x % y);
    if r != 0 {
        q + 1
    } else {
        q
    }
}

/// Product of all values, `1` for an empty slice.
#[inline]
pub fn product(values: &[u64]) -> u64 {
    values.iter().product()
}

/// Returns all divisors of `n` in increasing order. `n` must be nonzero.
pub fn divisors(n: u64) -> Vec<u64> {
    let mut low = vec![];
    let mut high = vec![];
    let mut d = 1;

    while d * d <= n {
        if n % d == 0 {
            low.push(d);
            if d * d != n {
                high.push(n / d);
            }
        }
        d += 1;
    }

    high.reverse();
    low.extend(high);
    low
}

use crate::constants::MODULUS;
use crate::error::{Error, Result};
use rand::rngs::OsRng;
use rand::Rng;

/// Split a private value into three additive shares modulo 2^32.
///
/// The first two shares are drawn uniformly and independently from the OS
/// entropy source; the third is chosen so the three sum to `value` mod 2^32.
/// Any two of the three shares are statistically independent of the value,
/// which is what lets each coordinator hold one share column without
/// learning anything.
///
/// # Arguments
///
/// * `value` - The private value, must be in [0, 2^32).
///
/// # Errors
///
/// Returns `PreconditionFailed` if `value` is outside [0, 2^32).
///
/// # Examples
///
/// ```rust
/// use tallynet::sharing::{split, reconstruct};
///
/// let shares = split(42).unwrap();
/// assert_eq!(reconstruct(&shares), 42);
/// ```
pub fn split(value: u64) -> Result<[u64; 3]> {
    if value >= MODULUS {
        return Err(Error::precondition(format!(
            "value {value} outside [0, {MODULUS})"
        )));
    }

    let mut rng = OsRng;
    let s1 = rng.gen_range(0..MODULUS);
    let s2 = rng.gen_range(0..MODULUS);
    let s3 = (MODULUS + value - (s1 + s2) % MODULUS) % MODULUS;

    Ok([s1, s2, s3])
}

/// Reconstruct a value from its shares: the sum modulo 2^32.
///
/// No other operation on shares is defined; coordinators never compare
/// shares by value.
pub fn reconstruct(shares: &[u64]) -> u64 {
    shares.iter().fold(0, |acc, &s| add_mod(acc, s))
}

/// Modular addition used for share-column sums.
///
/// Both operands must already be reduced; the aggregator relies on the
/// additivity law reconstruct(S1, S2, S3) = sum of values mod 2^32 where
/// each Si is the column sum of one coordinator's shares.
pub fn add_mod(a: u64, b: u64) -> u64 {
    debug_assert!(a < MODULUS && b < MODULUS);
    (a + b) % MODULUS
}

/// Mean of a reconstructed sum over `participants` contributions.
pub fn mean(sum: u64, participants: usize) -> Option<f64> {
    if participants == 0 {
        return None;
    }
    Some(sum as f64 / participants as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_reconstruct() {
        for value in [0u64, 1, 54, 103, MODULUS - 1] {
            let shares = split(value).unwrap();
            assert!(shares.iter().all(|&s| s < MODULUS));
            assert_eq!(reconstruct(&shares), value);
        }
    }

    #[test]
    fn rejects_out_of_range_value() {
        assert!(split(MODULUS).is_err());
        assert!(split(u64::MAX).is_err());
    }

    #[test]
    fn zero_still_produces_nontrivial_shares() {
        // Splitting zero should not leak it through degenerate shares.
        let mut all_zero = 0;
        for _ in 0..32 {
            let shares = split(0).unwrap();
            assert_eq!(reconstruct(&shares), 0);
            if shares == [0, 0, 0] {
                all_zero += 1;
            }
        }
        assert_eq!(all_zero, 0);
    }

    #[test]
    fn splits_are_randomized() {
        let a = split(7).unwrap();
        let b = split(7).unwrap();
        // 2^-64 chance of collision; a hit here means the rng is broken.
        assert_ne!(a, b);
    }

    #[test]
    fn column_sums_reconstruct_the_total() {
        let values = [11u64, 20, 72];
        let mut columns = [0u64; 3];
        for &v in &values {
            let shares = split(v).unwrap();
            for (col, &s) in columns.iter_mut().zip(shares.iter()) {
                *col = add_mod(*col, s);
            }
        }
        let expected: u64 = values.iter().sum::<u64>() % MODULUS;
        assert_eq!(reconstruct(&columns), expected);
    }

    #[test]
    fn column_sums_wrap_at_the_modulus() {
        let values = [MODULUS - 1, MODULUS - 2, 5];
        let mut columns = [0u64; 3];
        for &v in &values {
            let shares = split(v).unwrap();
            for (col, &s) in columns.iter_mut().zip(shares.iter()) {
                *col = add_mod(*col, s);
            }
        }
        let expected = values.iter().fold(0, |acc, &v| add_mod(acc, v));
        assert_eq!(reconstruct(&columns), expected);
    }

    #[test]
    fn mean_of_sum() {
        assert_eq!(mean(103, 3), Some(103.0 / 3.0));
        assert_eq!(mean(54, 1), Some(54.0));
        assert_eq!(mean(10, 0), None);
    }
}

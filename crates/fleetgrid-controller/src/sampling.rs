//! Randomized selection helpers for scaling.

use rand::Rng;

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Pick `k` distinct indices from `0..n`, uniformly and without replacement.
///
/// Partial Fisher–Yates: only the first `k` slots are shuffled. `k` is
/// clamped to `n`. The result is in selection order, not sorted.
pub fn sample_indices<R: Rng + ?Sized>(rng: &mut R, n: usize, k: usize) -> Vec<usize> {
    let k = k.min(n);
    let mut pool: Vec<usize> = (0..n).collect();
    for i in 0..k {
        let j = rng.random_range(i..n);
        pool.swap(i, j);
    }
    pool.truncate(k);
    pool
}

/// Random lowercase alphanumeric string, used to name new instances.
pub fn random_suffix<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    #[test]
    fn picks_are_distinct_and_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let picks = sample_indices(&mut rng, 5, 3);
            assert_eq!(picks.len(), 3);
            let unique: HashSet<_> = picks.iter().copied().collect();
            assert_eq!(unique.len(), 3, "duplicate pick in {picks:?}");
            assert!(picks.iter().all(|&i| i < 5));
        }
    }

    #[test]
    fn k_is_clamped_to_n() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut picks = sample_indices(&mut rng, 3, 10);
        picks.sort_unstable();
        assert_eq!(picks, vec![0, 1, 2]);

        assert!(sample_indices(&mut rng, 0, 2).is_empty());
        assert!(sample_indices(&mut rng, 4, 0).is_empty());
    }

    #[test]
    fn coverage_is_uniform() {
        // Each index of 0..10 should be picked with probability 3/10.
        let mut rng = StdRng::seed_from_u64(7);
        let trials = 20_000;
        let mut counts = [0u32; 10];
        for _ in 0..trials {
            for i in sample_indices(&mut rng, 10, 3) {
                counts[i] += 1;
            }
        }

        let expected = f64::from(trials) * 0.3;
        for (index, &count) in counts.iter().enumerate() {
            let deviation = (f64::from(count) - expected).abs() / expected;
            assert!(deviation < 0.05, "index {index} picked {count} times, expected ~{expected}");
        }
    }

    #[test]
    fn suffix_is_lowercase_alphanumeric() {
        let mut rng = StdRng::seed_from_u64(3);
        let suffix = random_suffix(&mut rng, 5);
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}

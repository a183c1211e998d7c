use rand::Rng;
use rand::seq::IndexedRandom;

/// Byte substituted for an empty base input so there is something to mutate.
pub const DEFAULT_BYTE: u8 = b'a';

/// Default upper bound on stacked mutation passes per candidate.
pub const DEFAULT_MAX_STACKING: usize = 8;

/// Boundary values plus the ASCII letters of "crash", which bias mutations
/// towards instrumented fault paths.
pub const INTERESTING_BYTES: [u8; 8] = [0, 1, 255, b'c', b'r', b'a', b's', b'h'];

const BIT_FLIP_WEIGHT: f64 = 0.3;
const ARITHMETIC_WEIGHT: f64 = 0.3;
const STRUCTURAL_WEIGHT: f64 = 0.2;

/// A `Mutator` derives a new candidate from a base input.
///
/// Implementations must be pure: all randomness comes from `rng`, so the same
/// base and the same random stream always produce the same output. This is
/// what makes a seeded run replayable.
pub trait Mutator<R: Rng + ?Sized> {
    /// Returns a new, non-empty candidate derived from `base`.
    ///
    /// # Arguments
    /// * `base`: The corpus entry to start from. May be empty.
    /// * `rng`: The only source of randomness the mutation may use.
    ///
    /// # Returns
    /// A fresh byte vector of at least one byte. `base` is never modified.
    fn mutate(&self, base: &[u8], rng: &mut R) -> Vec<u8>;
}

/// The individual byte-level edits a havoc pass can make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// XOR one random bit of the byte.
    BitFlip,
    /// Add or subtract one, wrapping.
    Arithmetic,
    /// Insert a printable byte, or delete the byte when more than one remains.
    Structural,
    /// Overwrite with one of [`INTERESTING_BYTES`].
    Interesting,
}

impl MutationKind {
    /// Draws a kind with weights 30/30/20/20.
    pub fn pick<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let roll: f64 = rng.random();
        if roll < BIT_FLIP_WEIGHT {
            MutationKind::BitFlip
        } else if roll < BIT_FLIP_WEIGHT + ARITHMETIC_WEIGHT {
            MutationKind::Arithmetic
        } else if roll < BIT_FLIP_WEIGHT + ARITHMETIC_WEIGHT + STRUCTURAL_WEIGHT {
            MutationKind::Structural
        } else {
            MutationKind::Interesting
        }
    }

    /// Applies this edit at `index`. `bytes` must be non-empty and stays non-empty.
    pub fn apply<R: Rng + ?Sized>(self, bytes: &mut Vec<u8>, index: usize, rng: &mut R) {
        debug_assert!(index < bytes.len());
        match self {
            MutationKind::BitFlip => {
                bytes[index] ^= 1u8 << rng.random_range(0..8u32);
            }
            MutationKind::Arithmetic => {
                bytes[index] = if rng.random_bool(0.5) {
                    bytes[index].wrapping_add(1)
                } else {
                    bytes[index].wrapping_sub(1)
                };
            }
            MutationKind::Structural => {
                if rng.random_bool(0.5) {
                    bytes.insert(index, rng.random_range(32u8..=126u8));
                } else if bytes.len() > 1 {
                    bytes.remove(index);
                }
            }
            MutationKind::Interesting => {
                if let Some(value) = INTERESTING_BYTES.choose(rng) {
                    bytes[index] = *value;
                }
            }
        }
    }
}

/// Stacks between one and `max_stacking` random [`MutationKind`] passes, each
/// at a uniformly chosen position.
#[derive(Debug, Clone, Copy)]
pub struct HavocMutator {
    max_stacking: usize,
}

impl HavocMutator {
    /// `max_stacking` of zero is treated as one.
    pub fn new(max_stacking: usize) -> Self {
        Self {
            max_stacking: max_stacking.max(1),
        }
    }

}

impl Default for HavocMutator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STACKING)
    }
}

impl<R: Rng + ?Sized> Mutator<R> for HavocMutator {
    fn mutate(&self, base: &[u8], rng: &mut R) -> Vec<u8> {
        let mut bytes = if base.is_empty() {
            vec![DEFAULT_BYTE]
        } else {
            base.to_vec()
        };

        let passes = rng.random_range(1..=self.max_stacking);
        for _ in 0..passes {
            let index = rng.random_range(0..bytes.len());
            MutationKind::pick(rng).apply(&mut bytes, index, rng);
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn havoc_never_returns_empty_output() {
        let mutator = HavocMutator::default();
        let mut rng = ChaCha8Rng::from_seed([0u8; 32]);
        let mut current = Vec::new();
        for _ in 0..5000 {
            current = mutator.mutate(&current, &mut rng);
            assert!(!current.is_empty());
        }
        for _ in 0..500 {
            assert!(!mutator.mutate(&[], &mut rng).is_empty());
            assert!(!mutator.mutate(&[7], &mut rng).is_empty());
        }
    }

    #[test]
    fn havoc_is_deterministic_for_a_seed() {
        let mutator = HavocMutator::default();
        let base = b"hello fuzzer".to_vec();
        let run = |seed: u8| {
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            (0..50)
                .map(|_| mutator.mutate(&base, &mut rng))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9), run(10));
    }

    #[test]
    fn length_changes_are_bounded_by_stacking() {
        let mutator = HavocMutator::new(3);
        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        let base = vec![0x41u8; 10];
        for _ in 0..1000 {
            let out = mutator.mutate(&base, &mut rng);
            assert!(out.len() >= 7 && out.len() <= 13, "len {}", out.len());
        }
    }

    #[test]
    fn zero_stacking_is_clamped() {
        let mutator = HavocMutator::new(0);
        let mut rng = ChaCha8Rng::from_seed([4u8; 32]);
        for _ in 0..200 {
            let out = mutator.mutate(b"abc", &mut rng);
            assert!((2..=4).contains(&out.len()), "len {}", out.len());
        }
    }

    #[test]
    fn empty_base_starts_from_default_byte() {
        let mutator = HavocMutator::new(1);
        let mut rng = ChaCha8Rng::from_seed([5u8; 32]);
        for _ in 0..100 {
            let out = mutator.mutate(&[], &mut rng);
            assert!(out.len() == 1 || out.len() == 2);
        }
    }

    #[test]
    fn bit_flip_changes_exactly_one_bit() {
        let mut rng = ChaCha8Rng::from_seed([6u8; 32]);
        for _ in 0..200 {
            let mut bytes = vec![0b1010_1010u8, 0x00];
            MutationKind::BitFlip.apply(&mut bytes, 0, &mut rng);
            assert_eq!((bytes[0] ^ 0b1010_1010).count_ones(), 1);
            assert_eq!(bytes[1], 0);
        }
    }

    #[test]
    fn arithmetic_moves_by_one_and_wraps() {
        let mut rng = ChaCha8Rng::from_seed([7u8; 32]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let mut bytes = vec![0u8];
            MutationKind::Arithmetic.apply(&mut bytes, 0, &mut rng);
            assert!(bytes[0] == 1 || bytes[0] == 255);
            seen.insert(bytes[0]);
        }
        assert_eq!(seen.len(), 2, "both directions should occur");
    }

    #[test]
    fn structural_never_deletes_the_last_byte() {
        let mut rng = ChaCha8Rng::from_seed([8u8; 32]);
        let mut grew = false;
        for _ in 0..200 {
            let mut bytes = vec![b'x'];
            MutationKind::Structural.apply(&mut bytes, 0, &mut rng);
            assert!(!bytes.is_empty());
            if bytes.len() == 2 {
                grew = true;
                assert!((32..=126).contains(&bytes[0]), "inserted byte must be printable");
                assert_eq!(bytes[1], b'x');
            }
        }
        assert!(grew);
    }

    #[test]
    fn structural_can_shrink_longer_inputs() {
        let mut rng = ChaCha8Rng::from_seed([9u8; 32]);
        let mut shrank = false;
        for _ in 0..200 {
            let mut bytes = b"xyz".to_vec();
            MutationKind::Structural.apply(&mut bytes, 1, &mut rng);
            if bytes.len() == 2 {
                shrank = true;
                assert_eq!(bytes, b"xz");
            }
        }
        assert!(shrank);
    }

    #[test]
    fn interesting_writes_a_listed_value() {
        let mut rng = ChaCha8Rng::from_seed([10u8; 32]);
        for _ in 0..200 {
            let mut bytes = vec![0x42u8, 0x42];
            MutationKind::Interesting.apply(&mut bytes, 1, &mut rng);
            assert!(INTERESTING_BYTES.contains(&bytes[1]));
            assert_eq!(bytes[0], 0x42);
        }
    }

    #[test]
    fn kind_weights_roughly_match() {
        let mut rng = ChaCha8Rng::from_seed([11u8; 32]);
        let mut counts = [0usize; 4];
        let draws = 20_000;
        for _ in 0..draws {
            let slot = match MutationKind::pick(&mut rng) {
                MutationKind::BitFlip => 0,
                MutationKind::Arithmetic => 1,
                MutationKind::Structural => 2,
                MutationKind::Interesting => 3,
            };
            counts[slot] += 1;
        }
        let share = |n: usize| n as f64 / draws as f64;
        assert!((share(counts[0]) - 0.3).abs() < 0.03);
        assert!((share(counts[1]) - 0.3).abs() < 0.03);
        assert!((share(counts[2]) - 0.2).abs() < 0.03);
        assert!((share(counts[3]) - 0.2).abs() < 0.03);
    }
}

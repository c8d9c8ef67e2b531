//! Deterministic randomness handed to intercepted code.
//!
//! `getrandom`, `/dev/urandom` reads and the C `rand` family are answered
//! from a ChaCha20 stream seeded from configuration.  The stream position
//! travels with checkpoints so that a restored run sees the same answers.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Domain separation between the configured seed and the key material.
const KEY_DOMAIN: u64 = 0x4C4B_5354_4550;

/// Position of the stream, stored in checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntropyState {
    pub seed: u64,
    pub word_pos: u128,
    pub bytes_served: u64,
}

#[derive(Clone, Debug)]
pub struct DeterministicEntropy {
    seed: u64,
    rng: ChaCha20Rng,
    bytes_served: u64,
}

impl DeterministicEntropy {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: rng_for(seed),
            bytes_served: 0,
        }
    }

    /// Answer a `getrandom`-style request.
    pub fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
        self.bytes_served += buf.len() as u64;
    }

    pub fn next_u64(&mut self) -> u64 {
        self.bytes_served += 8;
        self.rng.next_u64()
    }

    /// Answer a C `rand()` call: a value in `0..=RAND_MAX`.
    pub fn next_c_rand(&mut self) -> i32 {
        self.bytes_served += 4;
        (self.rng.next_u32() & 0x7FFF_FFFF) as i32
    }

    pub fn state(&self) -> EntropyState {
        EntropyState {
            seed: self.seed,
            word_pos: self.rng.get_word_pos(),
            bytes_served: self.bytes_served,
        }
    }

    pub fn restore(&mut self, state: &EntropyState) {
        let mut rng = rng_for(state.seed);
        rng.set_word_pos(state.word_pos);
        self.seed = state.seed;
        self.rng = rng;
        self.bytes_served = state.bytes_served;
    }

    pub fn bytes_served(&self) -> u64 {
        self.bytes_served
    }
}

fn rng_for(seed: u64) -> ChaCha20Rng {
    let mut key = [0u8; 32];
    key[..8].copy_from_slice(&seed.wrapping_add(KEY_DOMAIN).to_le_bytes());
    key[8..16].copy_from_slice(&seed.rotate_left(29).to_le_bytes());
    ChaCha20Rng::from_seed(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_answers() {
        let mut a = DeterministicEntropy::new(9);
        let mut b = DeterministicEntropy::new(9);
        let (mut x, mut y) = ([0u8; 33], [0u8; 33]);
        a.fill(&mut x);
        b.fill(&mut y);
        assert_eq!(x, y);
        assert_eq!(a.next_c_rand(), b.next_c_rand());
    }

    #[test]
    fn c_rand_is_non_negative() {
        let mut e = DeterministicEntropy::new(3);
        for _ in 0..1000 {
            assert!(e.next_c_rand() >= 0);
        }
    }

    #[test]
    fn restore_replays_the_stream() {
        let mut e = DeterministicEntropy::new(11);
        e.next_u64();
        let saved = e.state();
        let expected: Vec<u64> = (0..4).map(|_| e.next_u64()).collect();

        let mut other = DeterministicEntropy::new(500);
        other.restore(&saved);
        let got: Vec<u64> = (0..4).map(|_| other.next_u64()).collect();
        assert_eq!(got, expected);
        assert_eq!(other.bytes_served(), e.bytes_served());
    }

    #[test]
    fn seeds_are_separated() {
        assert_ne!(DeterministicEntropy::new(1).next_u64(), DeterministicEntropy::new(2).next_u64());
    }
}

//! Jenkins-style avalanche hashing.
//!
//! A streaming variant of the SpookyHash short path: input is consumed in
//! 32-byte blocks, each folded into a four-word state with `short_mix`, and
//! the state is finalised with `short_end`. Output is stable across runs and
//! platforms, so fingerprints may be written to traces and compared later.

use std::hash::Hasher;

const SEED: u64 = 0xdead_beef_dead_beef;
const BLOCK: usize = 32;

#[rustfmt::skip]
#[inline(always)]
fn short_mix(h: &mut [u64; 4]) {
    h[2] = h[2].rotate_left(50); h[2] = h[2].wrapping_add(h[3]); h[0] ^= h[2];
    h[3] = h[3].rotate_left(52); h[3] = h[3].wrapping_add(h[0]); h[1] ^= h[3];
    h[0] = h[0].rotate_left(30); h[0] = h[0].wrapping_add(h[1]); h[2] ^= h[0];
    h[1] = h[1].rotate_left(41); h[1] = h[1].wrapping_add(h[2]); h[3] ^= h[1];
    h[2] = h[2].rotate_left(54); h[2] = h[2].wrapping_add(h[3]); h[0] ^= h[2];
    h[3] = h[3].rotate_left(48); h[3] = h[3].wrapping_add(h[0]); h[1] ^= h[3];
    h[0] = h[0].rotate_left(38); h[0] = h[0].wrapping_add(h[1]); h[2] ^= h[0];
    h[1] = h[1].rotate_left(37); h[1] = h[1].wrapping_add(h[2]); h[3] ^= h[1];
    h[2] = h[2].rotate_left(62); h[2] = h[2].wrapping_add(h[3]); h[0] ^= h[2];
    h[3] = h[3].rotate_left(34); h[3] = h[3].wrapping_add(h[0]); h[1] ^= h[3];
    h[0] = h[0].rotate_left(5);  h[0] = h[0].wrapping_add(h[1]); h[2] ^= h[0];
    h[1] = h[1].rotate_left(36); h[1] = h[1].wrapping_add(h[2]); h[3] ^= h[1];
}

#[rustfmt::skip]
#[inline(always)]
fn short_end(h: &mut [u64; 4]) {
    h[3] ^= h[2]; h[2] = h[2].rotate_left(15); h[3] = h[3].wrapping_add(h[2]);
    h[0] ^= h[3]; h[3] = h[3].rotate_left(52); h[0] = h[0].wrapping_add(h[3]);
    h[1] ^= h[0]; h[0] = h[0].rotate_left(26); h[1] = h[1].wrapping_add(h[0]);
    h[2] ^= h[1]; h[1] = h[1].rotate_left(51); h[2] = h[2].wrapping_add(h[1]);
    h[3] ^= h[2]; h[2] = h[2].rotate_left(28); h[3] = h[3].wrapping_add(h[2]);
    h[0] ^= h[3]; h[3] = h[3].rotate_left(9);  h[0] = h[0].wrapping_add(h[3]);
    h[1] ^= h[0]; h[0] = h[0].rotate_left(47); h[1] = h[1].wrapping_add(h[0]);
    h[2] ^= h[1]; h[1] = h[1].rotate_left(54); h[2] = h[2].wrapping_add(h[1]);
    h[3] ^= h[2]; h[2] = h[2].rotate_left(32); h[3] = h[3].wrapping_add(h[2]);
    h[0] ^= h[3]; h[3] = h[3].rotate_left(25); h[0] = h[0].wrapping_add(h[3]);
    h[1] ^= h[0]; h[0] = h[0].rotate_left(63); h[1] = h[1].wrapping_add(h[0]);
}

/// Streaming 128-bit Jenkins hasher.
#[derive(Clone)]
pub struct Jenkins {
    state: [u64; 4],
    buf: [u8; BLOCK],
    buffered: usize,
    length: u64,
}

impl Default for Jenkins {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Jenkins {
    pub fn new(seed1: u64, seed2: u64) -> Self {
        Self {
            state: [seed1, seed2, SEED, SEED],
            buf: [0; BLOCK],
            buffered: 0,
            length: 0,
        }
    }

    #[inline]
    fn absorb(state: &mut [u64; 4], block: &[u8]) {
        for (i, word) in block.chunks_exact(8).enumerate() {
            let mut w = [0u8; 8];
            w.copy_from_slice(word);
            state[i] = state[i].wrapping_add(u64::from_le_bytes(w));
        }
        short_mix(state);
    }

    pub fn update(&mut self, mut bytes: &[u8]) {
        self.length = self.length.wrapping_add(bytes.len() as u64);

        if self.buffered > 0 {
            let take = (BLOCK - self.buffered).min(bytes.len());
            self.buf[self.buffered..self.buffered + take].copy_from_slice(&bytes[..take]);
            self.buffered += take;
            bytes = &bytes[take..];
            if self.buffered < BLOCK {
                return;
            }
            let block = self.buf;
            Self::absorb(&mut self.state, &block);
            self.buffered = 0;
        }

        let mut blocks = bytes.chunks_exact(BLOCK);
        for block in &mut blocks {
            Self::absorb(&mut self.state, block);
        }
        let rest = blocks.remainder();
        self.buf[..rest.len()].copy_from_slice(rest);
        self.buffered = rest.len();
    }

    #[inline]
    pub fn update_u32(&mut self, v: u32) {
        self.update(&v.to_le_bytes());
    }

    /// Finish and return both 64-bit halves.
    pub fn finalize(&self) -> (u64, u64) {
        let mut state = self.state;
        let mut tail = [0u8; BLOCK];
        tail[..self.buffered].copy_from_slice(&self.buf[..self.buffered]);
        state[3] = state[3].wrapping_add(self.length << 56);
        for (i, word) in tail.chunks_exact(8).enumerate() {
            let mut w = [0u8; 8];
            w.copy_from_slice(word);
            state[i] = state[i].wrapping_add(u64::from_le_bytes(w));
        }
        short_end(&mut state);
        (state[0], state[1])
    }
}

impl Hasher for Jenkins {
    fn finish(&self) -> u64 {
        self.finalize().0
    }

    fn write(&mut self, bytes: &[u8]) {
        self.update(bytes);
    }
}

/// One-shot hash of a byte slice.
pub fn spooky(bytes: &[u8]) -> (u64, u64) {
    let mut h = Jenkins::default();
    h.update(bytes);
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 7 + 3) as u8).collect();
        let whole = spooky(&data);
        for split in [0, 1, 5, 31, 32, 33, 64, 199, 200] {
            let mut h = Jenkins::default();
            h.update(&data[..split]);
            h.update(&data[split..]);
            assert_eq!(h.finalize(), whole, "split at {split}");
        }
    }

    #[test]
    fn test_avalanche_on_single_bit() {
        let a = spooky(&[0u8; 16]).0;
        let mut flipped = [0u8; 16];
        flipped[9] = 1;
        let b = spooky(&flipped).0;
        assert!((a ^ b).count_ones() > 16);
    }

    #[test]
    fn test_length_is_hashed() {
        assert_ne!(spooky(&[0u8; 3]), spooky(&[0u8; 4]));
        assert_ne!(spooky(&[]), spooky(&[0u8]));
    }
}

//! Random number generation utilities.

use std::num::NonZeroU32;

use rand_core::{CryptoRng, RngCore};
use ring::rand::SecureRandom;

const RAND_ERROR_CODE: NonZeroU32 =
    match NonZeroU32::new(rand_core::Error::CUSTOM_START) {
        Some(code) => code,
        None => panic!("CUSTOM_START is non-zero"),
    };

/// A succinct trait alias for a Cryptographically Secure PRNG.
pub trait Crng: RngCore + CryptoRng {}

impl<R: RngCore + CryptoRng> Crng for R {}

/// A compatibility wrapper so we can use `ring`'s PRG with `rand` traits.
#[derive(Clone, Debug)]
pub struct SysRng(ring::rand::SystemRandom);

impl SysRng {
    pub fn new() -> Self {
        Self(ring::rand::SystemRandom::new())
    }
}

impl Default for SysRng {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ring::rand::SystemRandom`] is a cryptographically secure PRG.
impl CryptoRng for SysRng {}

impl RngCore for SysRng {
    fn next_u32(&mut self) -> u32 {
        rand_core::impls::next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill_bytes(dest).expect("ring SystemRandom failed")
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.0
            .fill(dest)
            // ring's error type here is empty/unspecified anyway.
            .map_err(|_| rand_core::Error::from(RAND_ERROR_CODE))
    }
}

/// A deterministic, seedable RNG for tests. NOT cryptographically secure,
/// despite the [`CryptoRng`] impl, which exists only so it can stand in for
/// [`SysRng`] behind the [`Crng`] seam.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Clone, Debug)]
pub struct FastRng(u64);

#[cfg(any(test, feature = "test-utils"))]
impl FastRng {
    pub fn from_u64(seed: u64) -> Self {
        Self(seed.max(1))
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl CryptoRng for FastRng {}

#[cfg(any(test, feature = "test-utils"))]
impl RngCore for FastRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    // xorshift64
    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(
        &mut self,
        dest: &mut [u8],
    ) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sys_rng_fills_bytes() {
        let mut rng = SysRng::new();
        let mut buf = [0u8; 32];
        rng.fill_bytes(&mut buf);
        // All-zero output from a 32-byte CSPRNG read is effectively
        // impossible.
        assert_ne!(buf, [0u8; 32]);
    }

    #[test]
    fn fast_rng_is_deterministic() {
        let mut rng1 = FastRng::from_u64(20240801);
        let mut rng2 = FastRng::from_u64(20240801);
        assert_eq!(rng1.next_u64(), rng2.next_u64());
        assert_eq!(rng1.next_u32(), rng2.next_u32());
    }
}

//! Random number generation behind the provider seam.
//!
//! The transport threads an explicit [`Random`] handle through the encoder
//! (padding bytes) and the proposal (cookies) instead of reaching for a
//! global generator.

use rand::RngCore;

/// A cryptographically secure byte source.
pub trait Random: Send + Sync {
    /// Fills `buf` with random bytes.
    fn fill(&self, buf: &mut [u8]);
}

/// The operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRandom;

impl Random for SystemRandom {
    fn fill(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

//! Hash functions used by key exchange and key derivation.

use sha1::Sha1;
use sha2::Sha256;

/// A streaming hash instance.
pub trait Digest: Send {
    /// Output length in bytes.
    fn output_size(&self) -> usize;

    /// Feeds data.
    fn update(&mut self, data: &[u8]);

    /// Produces the digest and resets for reuse.
    fn finalize_reset(&mut self) -> Vec<u8>;
}

/// SHA-1, the hash of the `diffie-hellman-group{1,14}-sha1` methods.
#[derive(Default)]
pub struct Sha1Digest(Sha1);

impl Sha1Digest {
    /// Creates a fresh SHA-1 instance.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Digest for Sha1Digest {
    fn output_size(&self) -> usize {
        20
    }

    fn update(&mut self, data: &[u8]) {
        sha1::Digest::update(&mut self.0, data);
    }

    fn finalize_reset(&mut self) -> Vec<u8> {
        sha1::Digest::finalize_reset(&mut self.0).to_vec()
    }
}

/// SHA-256, used for host key fingerprints.
#[derive(Default)]
pub struct Sha256Digest(Sha256);

impl Sha256Digest {
    /// Creates a fresh SHA-256 instance.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Digest for Sha256Digest {
    fn output_size(&self) -> usize {
        32
    }

    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.0, data);
    }

    fn finalize_reset(&mut self) -> Vec<u8> {
        sha2::Digest::finalize_reset(&mut self.0).to_vec()
    }
}

//! Cryptographic provider for the SSH transport.
//!
//! The transport never hard-codes an algorithm: every primitive it consumes
//! (block cipher, MAC, compression, digest, key exchange, signature
//! verification, PRNG) comes from a [`CryptoProvider`] holding factories
//! keyed by the algorithm's SSH name. Negotiation advertises exactly the
//! names the provider registered, in registration order.
//!
//! The [`CryptoProvider::default_provider`] registers:
//!
//! - Ciphers: `aes128-cbc`, `aes192-cbc`, `aes256-cbc`, `blowfish-cbc`,
//!   `3des-cbc`
//! - MACs: `hmac-sha1`, `hmac-sha1-96`, `hmac-md5`, `hmac-md5-96`
//! - Compression: `none`, `zlib@openssh.com` (delayed), `zlib`
//! - KEX: `diffie-hellman-group14-sha1`, `diffie-hellman-group1-sha1`
//! - Host keys: `ssh-ed25519`, `ssh-rsa`, `ssh-dss`

pub mod cipher;
pub mod compress;
pub mod digest;
pub mod mac;
pub mod provider;
pub mod random;

pub use cipher::{Cipher, CipherDirection, NoneCipher};
pub use compress::Compression;
pub use digest::Digest;
pub use mac::Mac;
pub use provider::{
    CipherSpec, CompressionSpec, CryptoProvider, HostKeySpec, KexSpec, MacSpec,
};
pub use random::{Random, SystemRandom};

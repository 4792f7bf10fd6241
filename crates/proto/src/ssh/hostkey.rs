//! Host keys: blob parsing, signature verification, and the verifier seam.
//!
//! During key exchange the server proves possession of its host key by
//! signing the exchange hash. Verification is two-staged (RFC 4251
//! Section 4.1):
//!
//! 1. the signature over `H` is checked against the key blob `K_S` using the
//!    negotiated host key algorithm, then
//! 2. every registered [`HostKeyVerifier`] is asked whether this key is
//!    acceptable for this host, until one accepts.
//!
//! This module also provides the [`Signer`] seam used by public-key user
//! authentication, with an Ed25519 implementation.
//!
//! # Supported algorithms
//!
//! - `ssh-ed25519` (via `ed25519-dalek`)
//! - `ssh-rsa` (RSASSA-PKCS1-v1_5 with SHA-1, via `ring`)
//! - `ssh-dss` (DSA with SHA-1, via the `dsa` crate)

use std::collections::HashSet;
use std::net::SocketAddr;

use base64::Engine;
use capstan_platform::{TransportError, TransportResult};
use ed25519_dalek::Verifier as _;
use sha1::Digest as _;
use sha2::Sha256;
use signature::hazmat::PrehashVerifier;

use crate::ssh::buffer::SshBuffer;

/// A server host public key, as received in `K_S`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPublicKey {
    algorithm: String,
    blob: Vec<u8>,
}

impl HostPublicKey {
    /// Parses the key blob, extracting the leading algorithm name.
    pub fn parse(blob: &[u8]) -> TransportResult<Self> {
        let mut buf = SshBuffer::from_payload(blob.to_vec());
        let algorithm = buf.get_string()?;
        if algorithm.is_empty() {
            return Err(TransportError::protocol("host key algorithm name is empty"));
        }
        Ok(Self {
            algorithm,
            blob: blob.to_vec(),
        })
    }

    /// The key algorithm name (e.g. "ssh-rsa").
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The raw key blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// SHA-256 fingerprint in the OpenSSH presentation.
    ///
    /// # Example
    ///
    /// ```rust
    /// use capstan_proto::ssh::hostkey::HostPublicKey;
    ///
    /// let mut blob = Vec::new();
    /// blob.extend_from_slice(&11u32.to_be_bytes());
    /// blob.extend_from_slice(b"ssh-ed25519");
    /// blob.extend_from_slice(&4u32.to_be_bytes());
    /// blob.extend_from_slice(&[0u8; 4]);
    /// let key = HostPublicKey::parse(&blob).unwrap();
    /// assert!(key.fingerprint().starts_with("SHA256:"));
    /// ```
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        sha2::Digest::update(&mut hasher, &self.blob);
        let hash = hasher.finalize();
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD.encode(hash)
        )
    }
}

/// Decides whether a host key is acceptable for a host.
///
/// Called on every key exchange, including re-keys, after the signature over
/// the exchange hash has already been checked.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns `true` to accept the key.
    fn verify(&self, host: &SocketAddr, key: &HostPublicKey) -> bool;
}

/// Accepts every host key. For tests and first-contact tooling only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, _host: &SocketAddr, _key: &HostPublicKey) -> bool {
        true
    }
}

/// Accepts keys whose SHA-256 fingerprint is in a known set.
#[derive(Debug, Clone)]
pub struct FingerprintVerifier {
    allowed: HashSet<String>,
}

impl FingerprintVerifier {
    /// Creates a verifier from `SHA256:...` fingerprint strings.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: fingerprints.into_iter().map(Into::into).collect(),
        }
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn verify(&self, _host: &SocketAddr, key: &HostPublicKey) -> bool {
        self.allowed.contains(&key.fingerprint())
    }
}

fn split_signature_blob(sig_blob: &[u8]) -> TransportResult<(String, Vec<u8>)> {
    let mut buf = SshBuffer::from_payload(sig_blob.to_vec());
    let format = buf.get_string()?;
    let sig = buf.get_bytes()?;
    Ok((format, sig))
}

/// Verifies an `ssh-rsa` (RSASSA-PKCS1-v1_5 / SHA-1) signature.
pub fn verify_ssh_rsa(key_blob: &[u8], data: &[u8], sig_blob: &[u8]) -> TransportResult<bool> {
    let mut key = SshBuffer::from_payload(key_blob.to_vec());
    let alg = key.get_string()?;
    if alg != "ssh-rsa" {
        return Err(TransportError::protocol(format!(
            "host key blob is `{}`, not ssh-rsa",
            alg
        )));
    }
    let e = key.get_mpint()?;
    let n = key.get_mpint()?;

    let (format, sig) = split_signature_blob(sig_blob)?;
    if format != "ssh-rsa" {
        return Ok(false);
    }

    let components = ring::signature::RsaPublicKeyComponents { n: &n, e: &e };
    Ok(components
        .verify(
            &ring::signature::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY,
            data,
            &sig,
        )
        .is_ok())
}

/// Verifies an `ssh-dss` (DSA / SHA-1) signature.
///
/// The wire signature is the fixed 40-byte `r || s` encoding of RFC 4253
/// Section 6.6.
pub fn verify_ssh_dss(key_blob: &[u8], data: &[u8], sig_blob: &[u8]) -> TransportResult<bool> {
    let mut key = SshBuffer::from_payload(key_blob.to_vec());
    let alg = key.get_string()?;
    if alg != "ssh-dss" {
        return Err(TransportError::protocol(format!(
            "host key blob is `{}`, not ssh-dss",
            alg
        )));
    }
    let p = key.get_mpint()?;
    let q = key.get_mpint()?;
    let g = key.get_mpint()?;
    let y = key.get_mpint()?;

    let (format, sig) = split_signature_blob(sig_blob)?;
    if format != "ssh-dss" {
        return Ok(false);
    }
    if sig.len() != 40 {
        return Err(TransportError::protocol(format!(
            "ssh-dss signature must be 40 bytes, got {}",
            sig.len()
        )));
    }

    let components = dsa::Components::from_components(
        dsa::BigUint::from_bytes_be(&p),
        dsa::BigUint::from_bytes_be(&q),
        dsa::BigUint::from_bytes_be(&g),
    )
    .map_err(|_| TransportError::protocol("invalid ssh-dss domain parameters"))?;
    let key = dsa::VerifyingKey::from_components(components, dsa::BigUint::from_bytes_be(&y))
        .map_err(|_| TransportError::protocol("invalid ssh-dss public key"))?;
    let signature = match dsa::Signature::from_components(
        dsa::BigUint::from_bytes_be(&sig[..20]),
        dsa::BigUint::from_bytes_be(&sig[20..]),
    ) {
        Ok(signature) => signature,
        Err(_) => return Ok(false),
    };

    let mut hasher = sha1::Sha1::new();
    sha1::Digest::update(&mut hasher, data);
    let digest = hasher.finalize();

    Ok(key.verify_prehash(digest.as_slice(), &signature).is_ok())
}

/// Verifies an `ssh-ed25519` signature.
pub fn verify_ssh_ed25519(key_blob: &[u8], data: &[u8], sig_blob: &[u8]) -> TransportResult<bool> {
    let mut key = SshBuffer::from_payload(key_blob.to_vec());
    let alg = key.get_string()?;
    if alg != "ssh-ed25519" {
        return Err(TransportError::protocol(format!(
            "host key blob is `{}`, not ssh-ed25519",
            alg
        )));
    }
    let point = key.get_bytes()?;
    let point: [u8; 32] = point
        .try_into()
        .map_err(|_| TransportError::protocol("ssh-ed25519 public key must be 32 bytes"))?;

    let (format, sig) = split_signature_blob(sig_blob)?;
    if format != "ssh-ed25519" {
        return Ok(false);
    }
    let sig: [u8; 64] = match sig.try_into() {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };

    let verifying_key = match ed25519_dalek::VerifyingKey::from_bytes(&point) {
        Ok(key) => key,
        Err(_) => return Ok(false),
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig);
    Ok(verifying_key.verify(data, &signature).is_ok())
}

/// A private key that can sign user-authentication challenges.
///
/// The library never loads key files itself; applications provide a signer,
/// typically wrapping an agent or a decoded key.
pub trait Signer: Send + Sync {
    /// The public key algorithm name.
    fn algorithm(&self) -> &'static str;

    /// The public key blob in SSH wire encoding.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data`, returning the raw signature bytes (not the SSH
    /// signature blob).
    fn sign(&self, data: &[u8]) -> TransportResult<Vec<u8>>;
}

/// An in-memory Ed25519 signer.
pub struct Ed25519Signer {
    key: ed25519_dalek::SigningKey,
}

impl Ed25519Signer {
    /// Creates a signer from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(&seed),
        }
    }

    /// Generates a fresh key from the given random source.
    pub fn generate(random: &dyn crate::ssh::crypto::Random) -> Self {
        let mut seed = [0u8; 32];
        random.fill(&mut seed);
        Self::from_seed(seed)
    }

    /// The verifying half of this key.
    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.key.verifying_key()
    }
}

impl Signer for Ed25519Signer {
    fn algorithm(&self) -> &'static str {
        "ssh-ed25519"
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut blob = SshBuffer::new();
        blob.put_string("ssh-ed25519");
        blob.put_bytes(self.key.verifying_key().as_bytes());
        blob.compact()
    }

    fn sign(&self, data: &[u8]) -> TransportResult<Vec<u8>> {
        use ed25519_dalek::Signer as _;
        Ok(self.key.sign(data).to_bytes().to_vec())
    }
}

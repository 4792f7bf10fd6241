//! The algorithm registry handed to the transport at construction.
//!
//! A [`CryptoProvider`] maps SSH algorithm names to factories. The KEXINIT
//! proposal is generated from the registration order, so the order of the
//! `register_*` calls is the client's preference order. Only names that are
//! actually registered get advertised; a provider stripped down to one
//! cipher negotiates exactly that cipher or fails the exchange.

use std::sync::Arc;

use capstan_platform::{TransportError, TransportResult};

use crate::ssh::crypto::cipher::{cbc_cipher, Cipher, CipherDirection};
use crate::ssh::crypto::compress::{Compression, ZlibCompression};
use crate::ssh::crypto::mac::{self, Mac};
use crate::ssh::crypto::random::{Random, SystemRandom};
use crate::ssh::hostkey;
use crate::ssh::kex_dh::{DhGroupExchange, KexInput, KeyExchange};

/// Factory entry for a block cipher.
pub struct CipherSpec {
    /// SSH algorithm name.
    pub name: &'static str,
    /// Cipher block size in bytes.
    pub block_size: usize,
    /// Key length in bytes.
    pub key_len: usize,
    /// IV length in bytes.
    pub iv_len: usize,
    ctor: fn(CipherDirection, &[u8], &[u8]) -> TransportResult<Box<dyn Cipher>>,
}

/// Factory entry for a MAC.
pub struct MacSpec {
    /// SSH algorithm name.
    pub name: &'static str,
    /// Key length in bytes.
    pub key_len: usize,
    /// Tag length on the wire in bytes.
    pub tag_len: usize,
    ctor: fn(&[u8]) -> TransportResult<Box<dyn Mac>>,
}

/// Factory entry for a compression algorithm. `ctor` is `None` for "none".
pub struct CompressionSpec {
    /// SSH algorithm name.
    pub name: &'static str,
    /// Whether activation waits for authentication.
    pub delayed: bool,
    ctor: Option<fn() -> Box<dyn Compression>>,
}

/// Factory entry for a key exchange method.
pub struct KexSpec {
    /// SSH algorithm name.
    pub name: &'static str,
    /// Whether the method needs a signature-capable host key.
    pub requires_signature_capable: bool,
    ctor: fn(KexInput) -> Box<dyn KeyExchange>,
}

/// Entry for a host key algorithm: signature verification over the exchange
/// hash.
pub struct HostKeySpec {
    /// SSH algorithm name.
    pub name: &'static str,
    /// Whether the algorithm can sign (as opposed to encrypt).
    pub signature_capable: bool,
    verify: fn(&[u8], &[u8], &[u8]) -> TransportResult<bool>,
}

/// Name-keyed factories for every primitive the transport consumes.
pub struct CryptoProvider {
    ciphers: Vec<CipherSpec>,
    macs: Vec<MacSpec>,
    compressions: Vec<CompressionSpec>,
    kexes: Vec<KexSpec>,
    host_keys: Vec<HostKeySpec>,
    random: Arc<dyn Random>,
}

impl CryptoProvider {
    /// Creates an empty provider with the given random source.
    pub fn empty(random: Arc<dyn Random>) -> Self {
        Self {
            ciphers: Vec::new(),
            macs: Vec::new(),
            compressions: Vec::new(),
            kexes: Vec::new(),
            host_keys: Vec::new(),
            random,
        }
    }

    /// The default provider with every built-in algorithm registered.
    pub fn default_provider() -> Arc<Self> {
        let mut p = Self::empty(Arc::new(SystemRandom));

        p.register_kex(KexSpec {
            name: "diffie-hellman-group14-sha1",
            requires_signature_capable: true,
            ctor: |input| Box::new(DhGroupExchange::group14(input)),
        });
        p.register_kex(KexSpec {
            name: "diffie-hellman-group1-sha1",
            requires_signature_capable: true,
            ctor: |input| Box::new(DhGroupExchange::group1(input)),
        });

        p.register_host_key(HostKeySpec {
            name: "ssh-ed25519",
            signature_capable: true,
            verify: hostkey::verify_ssh_ed25519,
        });
        p.register_host_key(HostKeySpec {
            name: "ssh-rsa",
            signature_capable: true,
            verify: hostkey::verify_ssh_rsa,
        });
        p.register_host_key(HostKeySpec {
            name: "ssh-dss",
            signature_capable: true,
            verify: hostkey::verify_ssh_dss,
        });

        p.register_cipher(CipherSpec {
            name: "aes128-cbc",
            block_size: 16,
            key_len: 16,
            iv_len: 16,
            ctor: cbc_cipher::<aes::Aes128>,
        });
        p.register_cipher(CipherSpec {
            name: "aes192-cbc",
            block_size: 16,
            key_len: 24,
            iv_len: 16,
            ctor: cbc_cipher::<aes::Aes192>,
        });
        p.register_cipher(CipherSpec {
            name: "aes256-cbc",
            block_size: 16,
            key_len: 32,
            iv_len: 16,
            ctor: cbc_cipher::<aes::Aes256>,
        });
        p.register_cipher(CipherSpec {
            name: "blowfish-cbc",
            block_size: 8,
            key_len: 16,
            iv_len: 8,
            ctor: cbc_cipher::<blowfish::Blowfish>,
        });
        p.register_cipher(CipherSpec {
            name: "3des-cbc",
            block_size: 8,
            key_len: 24,
            iv_len: 8,
            ctor: cbc_cipher::<des::TdesEde3>,
        });

        p.register_mac(MacSpec {
            name: "hmac-sha1",
            key_len: 20,
            tag_len: 20,
            ctor: mac::hmac_sha1,
        });
        p.register_mac(MacSpec {
            name: "hmac-sha1-96",
            key_len: 20,
            tag_len: 12,
            ctor: mac::hmac_sha1_96,
        });
        p.register_mac(MacSpec {
            name: "hmac-md5",
            key_len: 16,
            tag_len: 16,
            ctor: mac::hmac_md5,
        });
        p.register_mac(MacSpec {
            name: "hmac-md5-96",
            key_len: 16,
            tag_len: 12,
            ctor: mac::hmac_md5_96,
        });

        p.register_compression(CompressionSpec {
            name: "none",
            delayed: false,
            ctor: None,
        });
        p.register_compression(CompressionSpec {
            name: "zlib@openssh.com",
            delayed: true,
            ctor: Some(|| Box::new(ZlibCompression::new_delayed())),
        });
        p.register_compression(CompressionSpec {
            name: "zlib",
            delayed: false,
            ctor: Some(|| Box::new(ZlibCompression::new())),
        });

        Arc::new(p)
    }

    /// Registers a cipher (appended to the preference order).
    pub fn register_cipher(&mut self, spec: CipherSpec) {
        self.ciphers.push(spec);
    }

    /// Registers a MAC.
    pub fn register_mac(&mut self, spec: MacSpec) {
        self.macs.push(spec);
    }

    /// Registers a compression algorithm.
    pub fn register_compression(&mut self, spec: CompressionSpec) {
        self.compressions.push(spec);
    }

    /// Registers a key exchange method.
    pub fn register_kex(&mut self, spec: KexSpec) {
        self.kexes.push(spec);
    }

    /// Registers a host key algorithm.
    pub fn register_host_key(&mut self, spec: HostKeySpec) {
        self.host_keys.push(spec);
    }

    /// The random source.
    pub fn random(&self) -> Arc<dyn Random> {
        Arc::clone(&self.random)
    }

    /// Cipher names in preference order.
    pub fn cipher_names(&self) -> Vec<String> {
        self.ciphers.iter().map(|s| s.name.to_string()).collect()
    }

    /// MAC names in preference order.
    pub fn mac_names(&self) -> Vec<String> {
        self.macs.iter().map(|s| s.name.to_string()).collect()
    }

    /// Compression names in preference order.
    pub fn compression_names(&self) -> Vec<String> {
        self.compressions.iter().map(|s| s.name.to_string()).collect()
    }

    /// KEX method names in preference order.
    pub fn kex_names(&self) -> Vec<String> {
        self.kexes.iter().map(|s| s.name.to_string()).collect()
    }

    /// Host key algorithm names in preference order.
    pub fn host_key_names(&self) -> Vec<String> {
        self.host_keys.iter().map(|s| s.name.to_string()).collect()
    }

    fn unsupported(kind: &str, name: &str) -> TransportError {
        TransportError::KexFailed(format!("unsupported {} algorithm `{}`", kind, name))
    }

    /// Looks up a cipher spec.
    pub fn cipher_spec(&self, name: &str) -> TransportResult<&CipherSpec> {
        self.ciphers
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Self::unsupported("cipher", name))
    }

    /// Looks up a MAC spec.
    pub fn mac_spec(&self, name: &str) -> TransportResult<&MacSpec> {
        self.macs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Self::unsupported("MAC", name))
    }

    /// Looks up a compression spec.
    pub fn compression_spec(&self, name: &str) -> TransportResult<&CompressionSpec> {
        self.compressions
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Self::unsupported("compression", name))
    }

    /// Looks up a KEX spec.
    pub fn kex_spec(&self, name: &str) -> TransportResult<&KexSpec> {
        self.kexes
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Self::unsupported("key exchange", name))
    }

    /// Looks up a host key spec.
    pub fn host_key_spec(&self, name: &str) -> TransportResult<&HostKeySpec> {
        self.host_keys
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Self::unsupported("host key", name))
    }

    /// Instantiates a cipher.
    pub fn create_cipher(
        &self,
        name: &str,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> TransportResult<Box<dyn Cipher>> {
        let spec = self.cipher_spec(name)?;
        (spec.ctor)(direction, &key[..spec.key_len], &iv[..spec.iv_len])
    }

    /// Instantiates a MAC.
    pub fn create_mac(&self, name: &str, key: &[u8]) -> TransportResult<Box<dyn Mac>> {
        let spec = self.mac_spec(name)?;
        (spec.ctor)(&key[..spec.key_len])
    }

    /// Instantiates a compression context, or `None` for "none".
    pub fn create_compression(&self, name: &str) -> TransportResult<Option<Box<dyn Compression>>> {
        let spec = self.compression_spec(name)?;
        Ok(spec.ctor.map(|ctor| ctor()))
    }

    /// Instantiates a key exchange run.
    pub fn create_kex(&self, name: &str, input: KexInput) -> TransportResult<Box<dyn KeyExchange>> {
        let spec = self.kex_spec(name)?;
        Ok((spec.ctor)(input))
    }

    /// Verifies a host key signature over `data` with the named algorithm.
    pub fn verify_host_key_signature(
        &self,
        name: &str,
        key_blob: &[u8],
        data: &[u8],
        sig_blob: &[u8],
    ) -> TransportResult<bool> {
        let spec = self.host_key_spec(name)?;
        (spec.verify)(key_blob, data, sig_blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_provider_advertises_minimums() {
        let p = CryptoProvider::default_provider();
        let ciphers = p.cipher_names();
        for name in ["aes128-cbc", "aes192-cbc", "aes256-cbc", "blowfish-cbc", "3des-cbc"] {
            assert!(ciphers.contains(&name.to_string()), "missing {}", name);
        }
        let macs = p.mac_names();
        for name in ["hmac-sha1", "hmac-sha1-96", "hmac-md5", "hmac-md5-96"] {
            assert!(macs.contains(&name.to_string()), "missing {}", name);
        }
        let comps = p.compression_names();
        for name in ["none", "zlib", "zlib@openssh.com"] {
            assert!(comps.contains(&name.to_string()), "missing {}", name);
        }
        assert_eq!(
            p.kex_names(),
            vec!["diffie-hellman-group14-sha1", "diffie-hellman-group1-sha1"]
        );
    }

    #[test]
    fn test_create_cipher_both_directions() {
        let p = CryptoProvider::default_provider();
        let key = vec![1u8; 32];
        let iv = vec![2u8; 16];
        for name in p.cipher_names() {
            let enc = p
                .create_cipher(&name, CipherDirection::Encrypt, &key, &iv)
                .unwrap();
            let spec = p.cipher_spec(&name).unwrap();
            assert_eq!(enc.block_size(), spec.block_size, "{}", name);
            p.create_cipher(&name, CipherDirection::Decrypt, &key, &iv)
                .unwrap();
        }
    }

    #[test]
    fn test_create_mac_tag_lengths() {
        let p = CryptoProvider::default_provider();
        let key = vec![3u8; 20];
        for name in p.mac_names() {
            let mac = p.create_mac(&name, &key).unwrap();
            assert_eq!(mac.size(), p.mac_spec(&name).unwrap().tag_len, "{}", name);
        }
    }

    #[test]
    fn test_none_compression_is_none() {
        let p = CryptoProvider::default_provider();
        assert!(p.create_compression("none").unwrap().is_none());
        assert!(p.create_compression("zlib").unwrap().is_some());
        let delayed = p.create_compression("zlib@openssh.com").unwrap().unwrap();
        assert!(delayed.is_delayed());
    }

    #[test]
    fn test_unknown_algorithm_errors() {
        let p = CryptoProvider::default_provider();
        assert!(p.cipher_spec("rot13-cbc").is_err());
        assert!(p.mac_spec("hmac-crc32").is_err());
        assert!(p.kex_spec("kex-strange").is_err());
    }
}

//! Diffie-Hellman key exchange methods (RFC 4253 Section 8).
//!
//! Implements `diffie-hellman-group1-sha1` (the 1024-bit Oakley Group 2 of
//! RFC 2409) and `diffie-hellman-group14-sha1` (the 2048-bit MODP group of
//! RFC 3526). Both hash with SHA-1 and run the same two-message followup:
//!
//! ```text
//! C -> S:  SSH_MSG_KEXDH_INIT   (e = g^x mod p)
//! S -> C:  SSH_MSG_KEXDH_REPLY  (K_S || f || signature over H)
//! ```
//!
//! The exchange hash is
//! `H = HASH(V_C || V_S || I_C || I_S || K_S || e || f || K)`.
//!
//! # Security
//!
//! - Peer public values are range-checked (`1 < f < p-1`)
//! - Private exponents are zeroized on drop

use capstan_platform::{TransportError, TransportResult};
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use zeroize::Zeroize;

use crate::ssh::buffer::SshBuffer;
use crate::ssh::crypto::digest::{Digest, Sha1Digest};
use crate::ssh::message::MessageType;

/// Identification strings and KEXINIT payloads that feed the exchange hash.
#[derive(Debug, Clone)]
pub struct KexInput {
    /// Our identification line, without CR LF.
    pub client_id: String,
    /// The server's identification line, without CR LF.
    pub server_id: String,
    /// Our SSH_MSG_KEXINIT payload.
    pub client_kexinit: Vec<u8>,
    /// The server's SSH_MSG_KEXINIT payload.
    pub server_kexinit: Vec<u8>,
}

/// One run of a key exchange method.
///
/// Created by the provider when KEXINIT negotiation picks the method.
/// [`KeyExchange::start`] yields the first followup packet to send; each
/// received followup is fed to [`KeyExchange::next`] until it reports
/// completion, after which `K`, `H`, the host key blob and the signature are
/// available for verification and key derivation.
pub trait KeyExchange: Send {
    /// Begins the exchange, returning the first packet to send.
    fn start(&mut self) -> TransportResult<SshBuffer>;

    /// Feeds one received followup packet. Returns `true` when the exchange
    /// is complete.
    fn next(&mut self, msg: MessageType, buf: &mut SshBuffer) -> TransportResult<bool>;

    /// A fresh instance of the method's hash, for key derivation.
    fn digest(&self) -> Box<dyn Digest>;

    /// The shared secret `K`, once complete.
    fn shared_secret(&self) -> Option<&[u8]>;

    /// The exchange hash `H`, once complete.
    fn exchange_hash(&self) -> Option<&[u8]>;

    /// The server host key blob `K_S`, once complete.
    fn host_key_blob(&self) -> Option<&[u8]>;

    /// The server's signature blob over `H`, once complete.
    fn signature_blob(&self) -> Option<&[u8]>;
}

struct ModpGroup {
    p: Lazy<BigUint>,
    g: u32,
}

/// Oakley Group 2 (RFC 2409 Section 6.2), used by diffie-hellman-group1-sha1.
static GROUP1: ModpGroup = ModpGroup {
    p: Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                 29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                 EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                 E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                 EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
                 FFFFFFFFFFFFFFFF",
            )
            .expect("group1 prime hex"),
        )
    }),
    g: 2,
};

/// 2048-bit MODP group (RFC 3526 Section 3), used by diffie-hellman-group14-sha1.
static GROUP14: ModpGroup = ModpGroup {
    p: Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                 29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                 EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                 E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                 EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                 C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                 83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                 670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                 E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                 DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                 15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .expect("group14 prime hex"),
        )
    }),
    g: 2,
};

/// Fixed-group Diffie-Hellman exchange.
pub struct DhGroupExchange {
    input: KexInput,
    group: &'static ModpGroup,
    /// Private exponent bytes; zeroized on drop.
    x: Vec<u8>,
    /// Our public value e, big-endian.
    e: Vec<u8>,
    k: Option<Vec<u8>>,
    h: Option<Vec<u8>>,
    host_key: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
}

impl DhGroupExchange {
    /// Creates a `diffie-hellman-group1-sha1` exchange.
    pub fn group1(input: KexInput) -> Self {
        Self::new(input, &GROUP1)
    }

    /// Creates a `diffie-hellman-group14-sha1` exchange.
    pub fn group14(input: KexInput) -> Self {
        Self::new(input, &GROUP14)
    }

    fn new(input: KexInput, group: &'static ModpGroup) -> Self {
        Self {
            input,
            group,
            x: Vec::new(),
            e: Vec::new(),
            k: None,
            h: None,
            host_key: None,
            signature: None,
        }
    }

    fn compute_exchange_hash(&self, k: &[u8], f: &[u8], host_key: &[u8]) -> Vec<u8> {
        let mut buf = SshBuffer::new();
        buf.put_string(&self.input.client_id);
        buf.put_string(&self.input.server_id);
        buf.put_bytes(&self.input.client_kexinit);
        buf.put_bytes(&self.input.server_kexinit);
        buf.put_bytes(host_key);
        buf.put_mpint(&self.e);
        buf.put_mpint(f);
        buf.put_mpint(k);

        let mut hash = Sha1Digest::new();
        hash.update(buf.payload());
        hash.finalize_reset()
    }
}

impl KeyExchange for DhGroupExchange {
    fn start(&mut self) -> TransportResult<SshBuffer> {
        let p: &BigUint = &self.group.p;
        let g = BigUint::from(self.group.g);

        // x in [2, p-2]
        let mut rng = rand::thread_rng();
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &(p - 1u32));
        let e = g.modpow(&x, p);

        self.x = x.to_bytes_be();
        self.e = e.to_bytes_be();

        let mut packet = SshBuffer::for_message(MessageType::KexdhInit);
        packet.put_mpint(&self.e);
        Ok(packet)
    }

    fn next(&mut self, msg: MessageType, buf: &mut SshBuffer) -> TransportResult<bool> {
        if msg != MessageType::KexdhReply {
            return Err(TransportError::UnexpectedMessage {
                expected: MessageType::KexdhReply.name().to_string(),
                got: msg.to_string(),
            });
        }
        if self.x.is_empty() {
            return Err(TransportError::KexFailed(
                "KEXDH_REPLY before KEXDH_INIT was sent".to_string(),
            ));
        }

        let host_key = buf.get_bytes()?;
        let f_bytes = buf.get_mpint()?;
        let signature = buf.get_bytes()?;

        let p: &BigUint = &self.group.p;
        let f = BigUint::from_bytes_be(&f_bytes);
        if f <= BigUint::from(1u32) || f >= p - 1u32 {
            return Err(TransportError::KexFailed(
                "server DH public value out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.x);
        let k = f.modpow(&x, p).to_bytes_be();

        let h = self.compute_exchange_hash(&k, &f_bytes, &host_key);

        self.k = Some(k);
        self.h = Some(h);
        self.host_key = Some(host_key);
        self.signature = Some(signature);
        Ok(true)
    }

    fn digest(&self) -> Box<dyn Digest> {
        Box::new(Sha1Digest::new())
    }

    fn shared_secret(&self) -> Option<&[u8]> {
        self.k.as_deref()
    }

    fn exchange_hash(&self) -> Option<&[u8]> {
        self.h.as_deref()
    }

    fn host_key_blob(&self) -> Option<&[u8]> {
        self.host_key.as_deref()
    }

    fn signature_blob(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }
}

impl Drop for DhGroupExchange {
    fn drop(&mut self) {
        self.x.zeroize();
        if let Some(k) = &mut self.k {
            k.zeroize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_input() -> KexInput {
        KexInput {
            client_id: "SSH-2.0-Capstan_0.1.0".to_string(),
            server_id: "SSH-2.0-OpenSSH_8.9".to_string(),
            client_kexinit: vec![20, 1, 2, 3],
            server_kexinit: vec![20, 4, 5, 6],
        }
    }

    /// Plays the server side of the exchange by hand.
    fn server_reply(e_bytes: &[u8], group: &ModpGroup) -> (SshBuffer, Vec<u8>, Vec<u8>) {
        let p: &BigUint = &group.p;
        let g = BigUint::from(group.g);
        let y = BigUint::from(0x1234_5678u32);
        let f = g.modpow(&y, p);
        let e = BigUint::from_bytes_be(e_bytes);
        let k = e.modpow(&y, p).to_bytes_be();

        let host_key = b"fake host key blob".to_vec();
        let mut reply = SshBuffer::new();
        reply.put_bytes(&host_key);
        reply.put_mpint(&f.to_bytes_be());
        reply.put_bytes(b"fake signature");
        (reply, k, f.to_bytes_be())
    }

    #[test]
    fn test_group14_exchange_completes() {
        let mut kex = DhGroupExchange::group14(test_input());
        let init = kex.start().unwrap();
        assert_eq!(init.payload()[0], MessageType::KexdhInit as u8);

        let (mut reply, expected_k, _f) = server_reply(&kex.e.clone(), &GROUP14);
        let done = kex.next(MessageType::KexdhReply, &mut reply).unwrap();
        assert!(done);
        assert_eq!(kex.shared_secret().unwrap(), &expected_k[..]);
        assert_eq!(kex.exchange_hash().unwrap().len(), 20);
        assert_eq!(kex.host_key_blob().unwrap(), b"fake host key blob");
        assert_eq!(kex.signature_blob().unwrap(), b"fake signature");
    }

    #[test]
    fn test_group1_exchange_completes() {
        let mut kex = DhGroupExchange::group1(test_input());
        kex.start().unwrap();
        let (mut reply, expected_k, _f) = server_reply(&kex.e.clone(), &GROUP1);
        assert!(kex.next(MessageType::KexdhReply, &mut reply).unwrap());
        assert_eq!(kex.shared_secret().unwrap(), &expected_k[..]);
    }

    #[test]
    fn test_out_of_range_f_rejected() {
        let mut kex = DhGroupExchange::group14(test_input());
        kex.start().unwrap();

        let mut reply = SshBuffer::new();
        reply.put_bytes(b"host key");
        reply.put_mpint(&[1]); // f = 1 is invalid
        reply.put_bytes(b"sig");
        assert!(matches!(
            kex.next(MessageType::KexdhReply, &mut reply),
            Err(TransportError::KexFailed(_))
        ));
    }

    #[test]
    fn test_wrong_followup_message() {
        let mut kex = DhGroupExchange::group14(test_input());
        kex.start().unwrap();
        let mut buf = SshBuffer::new();
        assert!(matches!(
            kex.next(MessageType::NewKeys, &mut buf),
            Err(TransportError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn test_exchange_hash_depends_on_ids() {
        let mut kex_a = DhGroupExchange::group14(test_input());
        kex_a.start().unwrap();
        let x = kex_a.x.clone();
        let e = kex_a.e.clone();

        let mut other = test_input();
        other.server_id = "SSH-2.0-Other_1.0".to_string();
        let mut kex_b = DhGroupExchange::group14(other);
        kex_b.start().unwrap();
        // Force identical key material so only the ids differ.
        kex_b.x = x;
        kex_b.e = e;

        let (mut reply_a, _, _) = server_reply(&kex_a.e.clone(), &GROUP14);
        let (mut reply_b, _, _) = server_reply(&kex_b.e.clone(), &GROUP14);
        kex_a.next(MessageType::KexdhReply, &mut reply_a).unwrap();
        kex_b.next(MessageType::KexdhReply, &mut reply_b).unwrap();

        assert_ne!(kex_a.exchange_hash().unwrap(), kex_b.exchange_hash().unwrap());
    }
}

//! KEXINIT proposals and algorithm negotiation (RFC 4253 Section 7.1).
//!
//! Each side's SSH_MSG_KEXINIT carries a 16-byte random cookie and ten
//! name-lists ordered by preference. Negotiation picks, for every slot, the
//! first client entry that also appears in the server list; an empty
//! intersection fails the exchange.
//!
//! For the kex and host-key slots the choice is joint: a key exchange method
//! that needs a signature-capable host key is only eligible if a compatible
//! host key algorithm is in both lists.

use capstan_platform::{TransportError, TransportResult};

use crate::ssh::buffer::SshBuffer;
use crate::ssh::crypto::CryptoProvider;
use crate::ssh::message::MessageType;

/// The ten name-lists plus cookie of one side's SSH_MSG_KEXINIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    cookie: [u8; 16],
    /// Key exchange methods.
    pub kex_algorithms: Vec<String>,
    /// Server host key algorithms.
    pub server_host_key_algorithms: Vec<String>,
    /// Ciphers, client to server.
    pub encryption_client_to_server: Vec<String>,
    /// Ciphers, server to client.
    pub encryption_server_to_client: Vec<String>,
    /// MACs, client to server.
    pub mac_client_to_server: Vec<String>,
    /// MACs, server to client.
    pub mac_server_to_client: Vec<String>,
    /// Compression, client to server.
    pub compression_client_to_server: Vec<String>,
    /// Compression, server to client.
    pub compression_server_to_client: Vec<String>,
    /// Languages, client to server (normally empty).
    pub languages_client_to_server: Vec<String>,
    /// Languages, server to client (normally empty).
    pub languages_server_to_client: Vec<String>,
    /// Whether a guessed first KEX packet follows.
    pub first_kex_packet_follows: bool,
}

impl Proposal {
    /// Builds our proposal from the provider's registered algorithms, in
    /// registration (preference) order.
    pub fn from_provider(provider: &CryptoProvider) -> Self {
        let mut cookie = [0u8; 16];
        provider.random().fill(&mut cookie);

        Self {
            cookie,
            kex_algorithms: provider.kex_names(),
            server_host_key_algorithms: provider.host_key_names(),
            encryption_client_to_server: provider.cipher_names(),
            encryption_server_to_client: provider.cipher_names(),
            mac_client_to_server: provider.mac_names(),
            mac_server_to_client: provider.mac_names(),
            compression_client_to_server: provider.compression_names(),
            compression_server_to_client: provider.compression_names(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Serializes as a ready-to-send packet.
    pub fn to_packet(&self) -> SshBuffer {
        let mut buf = SshBuffer::for_message(MessageType::KexInit);
        buf.put_raw(&self.cookie);
        buf.put_name_list(&self.kex_algorithms);
        buf.put_name_list(&self.server_host_key_algorithms);
        buf.put_name_list(&self.encryption_client_to_server);
        buf.put_name_list(&self.encryption_server_to_client);
        buf.put_name_list(&self.mac_client_to_server);
        buf.put_name_list(&self.mac_server_to_client);
        buf.put_name_list(&self.compression_client_to_server);
        buf.put_name_list(&self.compression_server_to_client);
        buf.put_name_list(&self.languages_client_to_server);
        buf.put_name_list(&self.languages_server_to_client);
        buf.put_bool(self.first_kex_packet_follows);
        buf.put_u32(0); // reserved
        buf
    }

    /// Parses a KEXINIT payload, message byte included.
    pub fn parse(buf: &mut SshBuffer) -> TransportResult<Self> {
        let msg = buf.get_message()?;
        if msg != MessageType::KexInit {
            return Err(TransportError::UnexpectedMessage {
                expected: MessageType::KexInit.name().to_string(),
                got: msg.to_string(),
            });
        }
        let cookie_bytes = buf.get_raw(16)?;
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&cookie_bytes);

        Ok(Self {
            cookie,
            kex_algorithms: buf.get_name_list()?,
            server_host_key_algorithms: buf.get_name_list()?,
            encryption_client_to_server: buf.get_name_list()?,
            encryption_server_to_client: buf.get_name_list()?,
            mac_client_to_server: buf.get_name_list()?,
            mac_server_to_client: buf.get_name_list()?,
            compression_client_to_server: buf.get_name_list()?,
            compression_server_to_client: buf.get_name_list()?,
            languages_client_to_server: buf.get_name_list()?,
            languages_server_to_client: buf.get_name_list()?,
            first_kex_packet_follows: buf.get_bool()?,
        })
    }

    /// Negotiates against the server's proposal, client preference winning.
    pub fn negotiate(
        &self,
        server: &Proposal,
        provider: &CryptoProvider,
    ) -> TransportResult<NegotiatedAlgorithms> {
        // Joint kex/host-key choice: a kex method is eligible only if a host
        // key algorithm satisfying its signing requirement is available.
        let mut chosen_kex = None;
        for kex_name in &self.kex_algorithms {
            if !server.kex_algorithms.contains(kex_name) {
                continue;
            }
            let Ok(kex_spec) = provider.kex_spec(kex_name) else {
                continue;
            };
            let host_key = self
                .server_host_key_algorithms
                .iter()
                .find(|hk| {
                    server.server_host_key_algorithms.contains(*hk)
                        && provider.host_key_spec(hk).map_or(false, |spec| {
                            !kex_spec.requires_signature_capable || spec.signature_capable
                        })
                })
                .cloned();
            if let Some(host_key) = host_key {
                chosen_kex = Some((kex_name.clone(), host_key));
                break;
            }
        }
        let (kex, host_key) = chosen_kex.ok_or_else(|| {
            TransportError::KexFailed(
                "no common key exchange / host key algorithm".to_string(),
            )
        })?;

        Ok(NegotiatedAlgorithms {
            kex,
            host_key,
            cipher_client_to_server: first_match(
                "cipher c2s",
                &self.encryption_client_to_server,
                &server.encryption_client_to_server,
            )?,
            cipher_server_to_client: first_match(
                "cipher s2c",
                &self.encryption_server_to_client,
                &server.encryption_server_to_client,
            )?,
            mac_client_to_server: first_match(
                "mac c2s",
                &self.mac_client_to_server,
                &server.mac_client_to_server,
            )?,
            mac_server_to_client: first_match(
                "mac s2c",
                &self.mac_server_to_client,
                &server.mac_server_to_client,
            )?,
            compression_client_to_server: first_match(
                "compression c2s",
                &self.compression_client_to_server,
                &server.compression_client_to_server,
            )?,
            compression_server_to_client: first_match(
                "compression s2c",
                &self.compression_server_to_client,
                &server.compression_server_to_client,
            )?,
        })
    }
}

/// The first client entry that the server also lists.
fn first_match(slot: &str, client: &[String], server: &[String]) -> TransportResult<String> {
    client
        .iter()
        .find(|name| server.contains(name))
        .cloned()
        .ok_or_else(|| {
            TransportError::KexFailed(format!(
                "no common {} algorithm (client [{}], server [{}])",
                slot,
                client.join(","),
                server.join(",")
            ))
        })
}

/// The outcome of negotiation: one algorithm per slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method.
    pub kex: String,
    /// Host key algorithm.
    pub host_key: String,
    /// Cipher, client to server.
    pub cipher_client_to_server: String,
    /// Cipher, server to client.
    pub cipher_server_to_client: String,
    /// MAC, client to server.
    pub mac_client_to_server: String,
    /// MAC, server to client.
    pub mac_server_to_client: String,
    /// Compression, client to server.
    pub compression_client_to_server: String,
    /// Compression, server to client.
    pub compression_server_to_client: String,
}

impl std::fmt::Display for NegotiatedAlgorithms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kex={} hostkey={} c2s={}/{}/{} s2c={}/{}/{}",
            self.kex,
            self.host_key,
            self.cipher_client_to_server,
            self.mac_client_to_server,
            self.compression_client_to_server,
            self.cipher_server_to_client,
            self.mac_server_to_client,
            self.compression_server_to_client,
        )
    }
}

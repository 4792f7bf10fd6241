//! Key exchange state machine (RFC 4253 Sections 7 and 9).
//!
//! The exchanger cycles through three expected-message states:
//!
//! ```text
//! KEXINIT -> FOLLOWUP -> NEWKEYS -> KEXINIT (re-key loop)
//! ```
//!
//! Either side may start a (re-)key exchange by sending SSH_MSG_KEXINIT at
//! any time while the transport is running. Non-KEX writers block on the
//! `done` event until the new algorithms are installed.
//!
//! The NEWKEYS switch-over is asymmetric per RFC 4253 Section 7.3: outbound
//! algorithms are installed the moment our NEWKEYS is queued (atomically,
//! under the write lock), inbound algorithms when the peer's NEWKEYS is
//! received.
//!
//! Host key acceptance is two-staged: the signature over the exchange hash
//! is verified with the negotiated algorithm, then every registered
//! [`HostKeyVerifier`] is consulted until one accepts the key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use capstan_platform::{Event, TransportError, TransportResult};
use tracing::{debug, info};

use crate::ssh::buffer::SshBuffer;
use crate::ssh::codec::Decoder;
use crate::ssh::crypto::{Cipher, Compression, CryptoProvider, Digest, Mac};
use crate::ssh::hostkey::{HostKeyVerifier, HostPublicKey};
use crate::ssh::kex_dh::{KexInput, KeyExchange};
use crate::ssh::message::MessageType;
use crate::ssh::proposal::{NegotiatedAlgorithms, Proposal};
use crate::ssh::transport::Transport;

/// One direction's freshly derived algorithm instances.
pub(crate) struct AlgoSet {
    pub(crate) cipher: Box<dyn Cipher>,
    pub(crate) mac: Option<Box<dyn Mac>>,
    pub(crate) compression: Option<Box<dyn Compression>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expected {
    /// We have sent or are sending KEXINIT and expect the server's.
    KexInit,
    /// We expect method-specific followup data.
    Followup,
    /// We expect SSH_MSG_NEWKEYS.
    NewKeys,
}

struct KexState {
    expected: Expected,
    kex: Option<Box<dyn KeyExchange>>,
    client_proposal: Option<Proposal>,
    client_payload: Vec<u8>,
    negotiated: Option<NegotiatedAlgorithms>,
    pending_inbound: Option<AlgoSet>,
}

/// Algorithm negotiation and key exchange.
pub(crate) struct KeyExchanger {
    state: Mutex<KexState>,
    ongoing: AtomicBool,
    kex_init_sent: Event<(), TransportError>,
    done: Event<(), TransportError>,
    session_id: Mutex<Option<Vec<u8>>>,
    verifiers: Mutex<Vec<Arc<dyn HostKeyVerifier>>>,
}

impl KeyExchanger {
    pub(crate) fn new(verifiers: Vec<Arc<dyn HostKeyVerifier>>) -> Self {
        Self {
            state: Mutex::new(KexState {
                expected: Expected::KexInit,
                kex: None,
                client_proposal: None,
                client_payload: Vec::new(),
                negotiated: None,
                pending_inbound: None,
            }),
            ongoing: AtomicBool::new(false),
            kex_init_sent: Event::new("kexinit sent"),
            done: Event::new("kex done"),
            session_id: Mutex::new(None),
            verifiers: Mutex::new(verifiers),
        }
    }

    /// Adds a host key verifier to the chain.
    pub(crate) fn add_verifier(&self, verifier: Arc<dyn HostKeyVerifier>) {
        self.verifiers.lock().expect("kex lock poisoned").push(verifier);
    }

    /// The session identifier: `H` from the first exchange, immutable after.
    pub(crate) fn session_id(&self) -> Option<Vec<u8>> {
        self.session_id.lock().expect("kex lock poisoned").clone()
    }

    pub(crate) fn is_ongoing(&self) -> bool {
        self.ongoing.load(Ordering::SeqCst)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.is_set()
    }

    pub(crate) async fn wait_done(&self, timeout: Option<std::time::Duration>) -> TransportResult<()> {
        self.done.wait(timeout).await
    }

    /// Starts key exchange by sending SSH_MSG_KEXINIT, unless one is already
    /// in flight. With `wait` the call blocks until the exchange completes.
    pub(crate) async fn start(&self, transport: &Transport, wait: bool) -> TransportResult<()> {
        let initiate = {
            // Clear the events before flagging the exchange ongoing, so a
            // writer that observes the flag never waits on a stale event.
            let _state = self.state.lock().expect("kex lock poisoned");
            if self.ongoing.load(Ordering::SeqCst) {
                false
            } else {
                self.done.clear();
                self.kex_init_sent.clear();
                self.ongoing.store(true, Ordering::SeqCst);
                true
            }
        };
        if initiate {
            self.send_kexinit(transport).await?;
        }
        if wait {
            self.wait_done(transport.timeout()).await?;
        }
        Ok(())
    }

    async fn send_kexinit(&self, transport: &Transport) -> TransportResult<()> {
        let proposal = Proposal::from_provider(&transport.provider());
        let packet = proposal.to_packet();
        {
            let mut state = self.state.lock().expect("kex lock poisoned");
            state.client_payload = packet.payload().to_vec();
            state.client_proposal = Some(proposal);
        }
        info!("sending SSH_MSG_KEXINIT");
        transport.write_packet(packet, true).await?;
        self.kex_init_sent.set(());
        Ok(())
    }

    fn ensure_ongoing(&self) -> TransportResult<()> {
        if !self.is_ongoing() {
            return Err(TransportError::protocol(
                "key exchange packet received when key exchange was not ongoing",
            ));
        }
        Ok(())
    }

    /// Handles one packet routed here by the transport's read pump.
    ///
    /// The decoder is the read pump's own; inbound algorithms are installed
    /// into it between packets when NEWKEYS arrives.
    pub(crate) async fn handle(
        &self,
        transport: &Transport,
        msg: MessageType,
        mut buf: SshBuffer,
        decoder: &mut Decoder,
    ) -> TransportResult<()> {
        let expected = self.state.lock().expect("kex lock poisoned").expected;
        match expected {
            Expected::KexInit => {
                if msg != MessageType::KexInit {
                    return Err(TransportError::UnexpectedMessage {
                        expected: MessageType::KexInit.name().to_string(),
                        got: msg.to_string(),
                    });
                }
                info!("received SSH_MSG_KEXINIT");
                // Starts the exchange if the server initiated this re-key.
                self.start(transport, false).await?;
                // Wait until our own KEXINIT is out; the server's may have
                // crossed ours on the wire.
                self.kex_init_sent.wait(transport.timeout()).await?;

                buf.set_rpos(buf.rpos() - 1); // un-read the message byte
                let server_payload = buf.payload().to_vec();
                let server_proposal = Proposal::parse(&mut buf)?;

                let (client_proposal, client_payload) = {
                    let state = self.state.lock().expect("kex lock poisoned");
                    let proposal = state.client_proposal.clone().ok_or_else(|| {
                        TransportError::KexFailed("client proposal missing".to_string())
                    })?;
                    (proposal, state.client_payload.clone())
                };

                let provider = transport.provider();
                let negotiated = client_proposal.negotiate(&server_proposal, &provider)?;
                debug!(%negotiated, "negotiated algorithms");

                let input = KexInput {
                    client_id: transport.client_id().to_string(),
                    server_id: transport.server_id().to_string(),
                    client_kexinit: client_payload,
                    server_kexinit: server_payload,
                };
                let mut kex = provider.create_kex(&negotiated.kex, input)?;
                let first = kex.start()?;
                {
                    let mut state = self.state.lock().expect("kex lock poisoned");
                    state.kex = Some(kex);
                    state.negotiated = Some(negotiated);
                    state.expected = Expected::Followup;
                }
                transport.write_packet(first, true).await?;
                Ok(())
            }

            Expected::Followup => {
                self.ensure_ongoing()?;
                if !msg.is_kex_specific() {
                    return Err(TransportError::UnexpectedMessage {
                        expected: "key exchange followup".to_string(),
                        got: msg.to_string(),
                    });
                }
                debug!(%msg, "received kex followup");
                let complete = {
                    let mut state = self.state.lock().expect("kex lock poisoned");
                    let kex = state.kex.as_mut().ok_or_else(|| {
                        TransportError::KexFailed("no key exchange in progress".to_string())
                    })?;
                    kex.next(msg, &mut buf)?
                };
                if complete {
                    self.finish_followup(transport).await?;
                }
                Ok(())
            }

            Expected::NewKeys => {
                self.ensure_ongoing()?;
                if msg != MessageType::NewKeys {
                    return Err(TransportError::UnexpectedMessage {
                        expected: MessageType::NewKeys.name().to_string(),
                        got: msg.to_string(),
                    });
                }
                info!("received SSH_MSG_NEWKEYS");
                let inbound = {
                    let mut state = self.state.lock().expect("kex lock poisoned");
                    state.kex = None;
                    state.expected = Expected::KexInit;
                    state.pending_inbound.take().ok_or_else(|| {
                        TransportError::KexFailed("inbound algorithms not derived".to_string())
                    })?
                };
                decoder.set_algorithms(inbound.cipher, inbound.mac, inbound.compression);
                transport.reset_rekey_tracking();
                self.set_done();
                Ok(())
            }
        }
    }

    /// Signature check, host verification, key derivation, NEWKEYS.
    async fn finish_followup(&self, transport: &Transport) -> TransportResult<()> {
        let (k, h, host_key_blob, signature, negotiated, mut digest) = {
            let state = self.state.lock().expect("kex lock poisoned");
            let kex = state.kex.as_ref().ok_or_else(|| {
                TransportError::KexFailed("no key exchange in progress".to_string())
            })?;
            let missing =
                || TransportError::KexFailed("key exchange output missing".to_string());
            (
                kex.shared_secret().ok_or_else(missing)?.to_vec(),
                kex.exchange_hash().ok_or_else(missing)?.to_vec(),
                kex.host_key_blob().ok_or_else(missing)?.to_vec(),
                kex.signature_blob().ok_or_else(missing)?.to_vec(),
                state.negotiated.clone().ok_or_else(missing)?,
                kex.digest(),
            )
        };

        let provider = transport.provider();
        let host_key = HostPublicKey::parse(&host_key_blob)?;
        if host_key.algorithm() != negotiated.host_key {
            return Err(TransportError::KexFailed(format!(
                "server sent a `{}` host key but `{}` was negotiated",
                host_key.algorithm(),
                negotiated.host_key
            )));
        }
        let valid = provider.verify_host_key_signature(
            &negotiated.host_key,
            &host_key_blob,
            &h,
            &signature,
        )?;
        if !valid {
            return Err(TransportError::KexFailed(
                "host key signature over the exchange hash is invalid".to_string(),
            ));
        }
        self.verify_host(transport, &host_key)?;

        // H from the first exchange becomes the session id, for good.
        let session_id = {
            let mut sid = self.session_id.lock().expect("kex lock poisoned");
            sid.get_or_insert_with(|| h.clone()).clone()
        };

        let (outbound, inbound) =
            derive_algorithm_sets(&provider, &negotiated, digest.as_mut(), &k, &h, &session_id)?;

        // Queue NEWKEYS and install outbound algorithms in one critical
        // section, so no later packet can slip out under the old keys.
        transport.send_newkeys(outbound).await?;
        {
            let mut state = self.state.lock().expect("kex lock poisoned");
            state.pending_inbound = Some(inbound);
            state.expected = Expected::NewKeys;
        }
        Ok(())
    }

    /// Tries every registered verifier until one accepts the key.
    fn verify_host(&self, transport: &Transport, key: &HostPublicKey) -> TransportResult<()> {
        let verifiers = self.verifiers.lock().expect("kex lock poisoned");
        for verifier in verifiers.iter() {
            debug!("trying host key verifier");
            if verifier.verify(&transport.remote_addr(), key) {
                return Ok(());
            }
        }
        Err(TransportError::HostKeyNotVerifiable(format!(
            "could not verify `{}` host key with fingerprint `{}` for `{}`",
            key.algorithm(),
            key.fingerprint(),
            transport.remote_addr()
        )))
    }

    fn set_done(&self) {
        self.ongoing.store(false, Ordering::SeqCst);
        self.kex_init_sent.clear();
        self.done.set(());
    }

    /// Fails all exchange waiters after a fatal transport error.
    pub(crate) fn notify_error(&self, err: &TransportError) {
        debug!(%err, "key exchanger notified of error");
        self.kex_init_sent.notify_error(err);
        self.done.notify_error(err);
    }
}

/// Derives the six key blocks of RFC 4253 Section 7.2 and instantiates both
/// directions' algorithm sets.
///
/// Each block is `HASH(K || H || X || session_id)` for X in 'A'..'F',
/// extended by `HASH(K || H || prior)` until it covers the algorithm's
/// required length.
fn derive_algorithm_sets(
    provider: &CryptoProvider,
    negotiated: &NegotiatedAlgorithms,
    hash: &mut dyn Digest,
    k: &[u8],
    h: &[u8],
    session_id: &[u8],
) -> TransportResult<(AlgoSet, AlgoSet)> {
    let derive = |hash: &mut dyn Digest, marker: u8, needed: usize| -> Vec<u8> {
        let mut seed = SshBuffer::new();
        seed.put_mpint(k);
        seed.put_raw(h);
        seed.put_u8(marker);
        seed.put_raw(session_id);
        hash.update(seed.payload());
        let mut key = hash.finalize_reset();

        while key.len() < needed {
            let mut more = SshBuffer::new();
            more.put_mpint(k);
            more.put_raw(h);
            more.put_raw(&key);
            hash.update(more.payload());
            let block = hash.finalize_reset();
            key.extend_from_slice(&block);
        }
        key
    };

    let c2s_cipher = provider.cipher_spec(&negotiated.cipher_client_to_server)?;
    let s2c_cipher = provider.cipher_spec(&negotiated.cipher_server_to_client)?;
    let c2s_mac = provider.mac_spec(&negotiated.mac_client_to_server)?;
    let s2c_mac = provider.mac_spec(&negotiated.mac_server_to_client)?;

    let iv_c2s = derive(hash, b'A', c2s_cipher.iv_len);
    let iv_s2c = derive(hash, b'B', s2c_cipher.iv_len);
    let key_c2s = derive(hash, b'C', c2s_cipher.key_len);
    let key_s2c = derive(hash, b'D', s2c_cipher.key_len);
    let mac_c2s = derive(hash, b'E', c2s_mac.key_len);
    let mac_s2c = derive(hash, b'F', s2c_mac.key_len);

    use crate::ssh::crypto::CipherDirection;
    let outbound = AlgoSet {
        cipher: provider.create_cipher(
            &negotiated.cipher_client_to_server,
            CipherDirection::Encrypt,
            &key_c2s,
            &iv_c2s,
        )?,
        mac: Some(provider.create_mac(&negotiated.mac_client_to_server, &mac_c2s)?),
        compression: provider.create_compression(&negotiated.compression_client_to_server)?,
    };
    let inbound = AlgoSet {
        cipher: provider.create_cipher(
            &negotiated.cipher_server_to_client,
            CipherDirection::Decrypt,
            &key_s2c,
            &iv_s2c,
        )?,
        mac: Some(provider.create_mac(&negotiated.mac_server_to_client, &mac_s2c)?),
        compression: provider.create_compression(&negotiated.compression_server_to_client)?,
    };
    Ok((outbound, inbound))
}

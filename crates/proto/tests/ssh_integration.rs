//! Integration tests against a scripted in-process SSH server.
//!
//! The peer speaks real wire bytes over a loopback TCP connection: it runs
//! the identification exchange, a genuine diffie-hellman-group14-sha1 key
//! exchange with an Ed25519 host key, and then drives authentication and
//! channels packet by packet. The server side reuses the crate's own
//! encoder/decoder with the server-direction keys, so every byte crosses the
//! same framing, cipher and MAC paths a real deployment would.

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use capstan_platform::{ConnectionError, TransportError};
use capstan_proto::ssh::buffer::SshBuffer;
use capstan_proto::ssh::client::{Client, ClientConfig};
use capstan_proto::ssh::codec::{Decoder, Encoder};
use capstan_proto::ssh::crypto::cipher::CipherDirection;
use capstan_proto::ssh::crypto::{CryptoProvider, SystemRandom};
use capstan_proto::ssh::hostkey::{
    AcceptAnyHostKey, Ed25519Signer, FingerprintVerifier, HostKeyVerifier, HostPublicKey, Signer,
};
use capstan_proto::ssh::message::MessageType;
use capstan_proto::ssh::proposal::Proposal;
use capstan_proto::ssh::transport::{Transport, TransportConfig, TransportState};
use num_bigint::BigUint;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const GROUP14_P: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                         29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                         EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                         E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                         EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                         C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                         83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                         670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                         E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                         DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                         15728E5A8AACAA68FFFFFFFFFFFFFFFF";

const WAIT: Duration = Duration::from_secs(10);

fn sha1_of(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// RFC 4253 Section 7.2 key derivation, server-side copy for the harness.
fn derive_key(k: &[u8], h: &[u8], session_id: &[u8], marker: u8, needed: usize) -> Vec<u8> {
    let mut seed = SshBuffer::new();
    seed.put_mpint(k);
    seed.put_raw(h);
    seed.put_u8(marker);
    seed.put_raw(session_id);
    let mut key = sha1_of(seed.payload());
    while key.len() < needed {
        let mut more = SshBuffer::new();
        more.put_mpint(k);
        more.put_raw(h);
        more.put_raw(&key);
        key.extend_from_slice(&sha1_of(more.payload()));
    }
    key
}

/// The scripted server side of one connection.
struct TestServer {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    provider: Arc<CryptoProvider>,
    signer: Ed25519Signer,
    client_id: String,
    server_id: String,
    session_id: Option<Vec<u8>>,
}

impl TestServer {
    async fn accept(listener: TcpListener, signer: Ed25519Signer) -> Self {
        let (mut stream, _) = listener.accept().await.unwrap();

        let server_id = "SSH-2.0-TestServer_1.0".to_string();
        stream
            .write_all(format!("{}\r\n", server_id).as_bytes())
            .await
            .unwrap();

        // Read the client identification line.
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let client_id = String::from_utf8(line).unwrap();
        assert!(client_id.starts_with("SSH-2.0-"));

        let authed = Arc::new(AtomicBool::new(true));
        let traffic = Arc::new(AtomicU64::new(0));
        let encoder = Encoder::new(
            Arc::new(SystemRandom),
            Arc::clone(&authed),
            Arc::clone(&traffic),
        );
        let decoder = Decoder::new(authed, traffic);

        Self {
            stream,
            encoder,
            decoder,
            provider: CryptoProvider::default_provider(),
            signer,
            client_id,
            server_id,
            session_id: None,
        }
    }

    async fn send(&mut self, mut buf: SshBuffer) {
        self.encoder.encode(&mut buf).unwrap();
        self.stream.write_all(&buf.compact()).await.unwrap();
    }

    /// Sends a correctly encoded packet with one ciphertext byte flipped.
    async fn send_tampered(&mut self, mut buf: SshBuffer) {
        self.encoder.encode(&mut buf).unwrap();
        let mut wire = buf.compact();
        let packet_len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        wire[packet_len + 3] ^= 0x01;
        self.stream.write_all(&wire).await.unwrap();
    }

    async fn recv(&mut self) -> SshBuffer {
        loop {
            if let Some((_seq, buf)) = self.decoder.poll().unwrap() {
                return buf;
            }
            let mut chunk = vec![0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed while expecting a packet");
            self.decoder.feed(&chunk[..n]);
        }
    }

    async fn recv_expect(&mut self, expected: MessageType) -> SshBuffer {
        let mut buf = self.recv().await;
        let msg = MessageType::from_u8(buf.get_u8().unwrap()).unwrap();
        assert_eq!(msg, expected);
        buf
    }

    /// Runs one full key exchange (initial or re-key) from the server side.
    async fn run_kex(&mut self) {
        // Exchange KEXINIT payloads.
        let client_kexinit = {
            let buf = self.recv().await;
            assert_eq!(buf.payload()[0], MessageType::KexInit as u8);
            buf.payload().to_vec()
        };
        let server_proposal = Proposal::from_provider(&self.provider);
        let server_kexinit_packet = server_proposal.to_packet();
        let server_kexinit = server_kexinit_packet.payload().to_vec();
        self.send(server_kexinit_packet).await;

        // KEXDH_INIT: the client's ephemeral public value.
        let mut kexdh_init = self.recv_expect(MessageType::KexdhInit).await;
        let e_bytes = kexdh_init.get_mpint().unwrap();

        let p = BigUint::from_bytes_be(&hex::decode(GROUP14_P).unwrap());
        let g = BigUint::from(2u32);
        let y = BigUint::from(0x0123_4567_89ab_cdefu64);
        let f = g.modpow(&y, &p);
        let e = BigUint::from_bytes_be(&e_bytes);
        let k = e.modpow(&y, &p).to_bytes_be();
        let f_bytes = f.to_bytes_be();

        let host_key_blob = self.signer.public_key_blob();

        // H = SHA1(V_C || V_S || I_C || I_S || K_S || e || f || K)
        let mut hash_input = SshBuffer::new();
        hash_input.put_string(&self.client_id);
        hash_input.put_string(&self.server_id);
        hash_input.put_bytes(&client_kexinit);
        hash_input.put_bytes(&server_kexinit);
        hash_input.put_bytes(&host_key_blob);
        hash_input.put_mpint(&e_bytes);
        hash_input.put_mpint(&f_bytes);
        hash_input.put_mpint(&k);
        let h = sha1_of(hash_input.payload());

        let session_id = self.session_id.get_or_insert_with(|| h.clone()).clone();

        let raw_signature = self.signer.sign(&h).unwrap();
        let mut signature_blob = SshBuffer::new();
        signature_blob.put_string("ssh-ed25519");
        signature_blob.put_bytes(&raw_signature);

        let mut reply = SshBuffer::for_message(MessageType::KexdhReply);
        reply.put_bytes(&host_key_blob);
        reply.put_mpint(&f_bytes);
        reply.put_bytes(&signature_blob.compact());
        self.send(reply).await;

        // NEWKEYS out, then switch the outbound (server-to-client) side.
        self.send(SshBuffer::for_message(MessageType::NewKeys)).await;
        let iv_s2c = derive_key(&k, &h, &session_id, b'B', 16);
        let key_s2c = derive_key(&k, &h, &session_id, b'D', 16);
        let mac_s2c = derive_key(&k, &h, &session_id, b'F', 20);
        self.encoder.set_algorithms(
            self.provider
                .create_cipher("aes128-cbc", CipherDirection::Encrypt, &key_s2c, &iv_s2c)
                .unwrap(),
            Some(self.provider.create_mac("hmac-sha1", &mac_s2c).unwrap()),
            None,
        );

        // NEWKEYS in, then switch the inbound (client-to-server) side.
        self.recv_expect(MessageType::NewKeys).await;
        let iv_c2s = derive_key(&k, &h, &session_id, b'A', 16);
        let key_c2s = derive_key(&k, &h, &session_id, b'C', 16);
        let mac_c2s = derive_key(&k, &h, &session_id, b'E', 20);
        self.decoder.set_algorithms(
            self.provider
                .create_cipher("aes128-cbc", CipherDirection::Decrypt, &key_c2s, &iv_c2s)
                .unwrap(),
            Some(self.provider.create_mac("hmac-sha1", &mac_c2s).unwrap()),
            None,
        );
    }

    /// SERVICE_REQUEST/ACCEPT handshake for ssh-userauth.
    async fn accept_userauth_service(&mut self) {
        let mut req = self.recv_expect(MessageType::ServiceRequest).await;
        assert_eq!(req.get_string().unwrap(), "ssh-userauth");
        let mut accept = SshBuffer::for_message(MessageType::ServiceAccept);
        accept.put_string("ssh-userauth");
        self.send(accept).await;
    }

    /// Rejects the `none` probe, then accepts a password attempt.
    async fn run_password_auth(&mut self, user: &str, password: &str) {
        let mut probe = self.recv_expect(MessageType::UserauthRequest).await;
        assert_eq!(probe.get_string().unwrap(), user);
        assert_eq!(probe.get_string().unwrap(), "ssh-connection");
        assert_eq!(probe.get_string().unwrap(), "none");

        let mut failure = SshBuffer::for_message(MessageType::UserauthFailure);
        failure.put_name_list(&["password".to_string()]);
        failure.put_bool(false);
        self.send(failure).await;

        let mut attempt = self.recv_expect(MessageType::UserauthRequest).await;
        assert_eq!(attempt.get_string().unwrap(), user);
        assert_eq!(attempt.get_string().unwrap(), "ssh-connection");
        assert_eq!(attempt.get_string().unwrap(), "password");
        assert!(!attempt.get_bool().unwrap());
        assert_eq!(attempt.get_string().unwrap(), password);

        self.send(SshBuffer::for_message(MessageType::UserauthSuccess))
            .await;
    }

    /// Confirms a session open with the given remote window parameters.
    /// Returns (client channel id, our channel id).
    async fn accept_session(&mut self, window: u32, max_packet: u32) -> (u32, u32) {
        let mut open = self.recv_expect(MessageType::ChannelOpen).await;
        assert_eq!(open.get_string().unwrap(), "session");
        let client_channel = open.get_u32().unwrap();
        let _client_window = open.get_u32().unwrap();
        let _client_max_packet = open.get_u32().unwrap();

        let server_channel = 7;
        let mut confirm = SshBuffer::for_message(MessageType::ChannelOpenConfirmation);
        confirm.put_u32(client_channel);
        confirm.put_u32(server_channel);
        confirm.put_u32(window);
        confirm.put_u32(max_packet);
        self.send(confirm).await;
        (client_channel, server_channel)
    }

    async fn channel_msg(&mut self, msg: MessageType, client_channel: u32) -> SshBuffer {
        let mut buf = SshBuffer::for_message(msg);
        buf.put_u32(client_channel);
        buf
    }
}

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.transport.timeout = Some(WAIT);
    config
}

fn accept_any() -> Vec<Arc<dyn HostKeyVerifier>> {
    vec![Arc::new(AcceptAnyHostKey)]
}

async fn start_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    (listener, addr)
}

#[tokio::test]
async fn test_connect_performs_version_and_key_exchange() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);

    let server = tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;
        server
    });

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut config = TransportConfig::default();
    config.timeout = Some(WAIT);
    let transport = timeout(
        WAIT,
        Transport::connect(
            stream,
            config,
            CryptoProvider::default_provider(),
            accept_any(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(transport.server_id(), "SSH-2.0-TestServer_1.0");
    assert!(transport.client_id().starts_with("SSH-2.0-Capstan_"));
    assert!(transport.is_running());
    assert_eq!(transport.state(), TransportState::Running);

    let server = timeout(WAIT, server).await.unwrap().unwrap();
    // Both sides agree on the session id (H of the first exchange).
    assert_eq!(transport.session_id().unwrap(), server.session_id.unwrap());
}

#[tokio::test]
async fn test_identification_preamble_skipped() {
    let (listener, addr) = start_server().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Preamble lines before the identification, per RFC 4253 4.2.
        stream
            .write_all(b"Welcome to the machine\r\nno SSH here yet\r\n")
            .await
            .unwrap();
        stream
            .write_all(b"SSH-2.0-TestServer_1.0\r\n")
            .await
            .unwrap();
        // Never send KEXINIT; hold the socket open past the client timeout.
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(stream);
    });

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut config = TransportConfig::default();
    config.timeout = Some(Duration::from_millis(500));

    let result = timeout(
        WAIT,
        Transport::connect(
            stream,
            config,
            CryptoProvider::default_provider(),
            accept_any(),
        ),
    )
    .await
    .unwrap();
    // Timeout waiting for kex - the preamble and identification both parsed.
    assert!(matches!(result, Err(TransportError::Timeout)));
}

#[tokio::test]
async fn test_host_key_rejected_fails_kex() {
    struct RejectAll;
    impl HostKeyVerifier for RejectAll {
        fn verify(&self, _host: &std::net::SocketAddr, _key: &HostPublicKey) -> bool {
            false
        }
    }

    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);
    tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        // The client dies before NEWKEYS; play the script as far as the
        // socket allows.
        server.run_kex().await;
    });

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut config = TransportConfig::default();
    config.timeout = Some(WAIT);
    let result = timeout(
        WAIT,
        Transport::connect(
            stream,
            config,
            CryptoProvider::default_provider(),
            vec![Arc::new(RejectAll)],
        ),
    )
    .await
    .unwrap();

    assert!(matches!(
        result,
        Err(TransportError::HostKeyNotVerifiable(_))
    ));
}

#[tokio::test]
async fn test_fingerprint_verifier_accepts_pinned_key() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);
    let fingerprint = HostPublicKey::parse(&signer.public_key_blob())
        .unwrap()
        .fingerprint();

    tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;
    });

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut config = TransportConfig::default();
    config.timeout = Some(WAIT);
    let transport = timeout(
        WAIT,
        Transport::connect(
            stream,
            config,
            CryptoProvider::default_provider(),
            vec![Arc::new(FingerprintVerifier::new([fingerprint]))],
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(transport.is_running());
}

#[tokio::test]
async fn test_password_auth_and_exec() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);

    let server = tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;
        server.accept_userauth_service().await;
        server.run_password_auth("alice", "hunter2").await;

        let (client_channel, _server_channel) = server.accept_session(32768, 16384).await;

        // exec "whoami" with want_reply.
        let mut req = server.recv_expect(MessageType::ChannelRequest).await;
        assert_eq!(req.get_u32().unwrap(), 7); // our channel id at their end
        assert_eq!(req.get_string().unwrap(), "exec");
        assert!(req.get_bool().unwrap());
        assert_eq!(req.get_string().unwrap(), "whoami");
        let reply = server
            .channel_msg(MessageType::ChannelSuccess, client_channel)
            .await;
        server.send(reply).await;

        // Output, exit status, EOF, close.
        let mut data = server
            .channel_msg(MessageType::ChannelData, client_channel)
            .await;
        data.put_bytes(b"alice\n");
        server.send(data).await;

        let mut status = server
            .channel_msg(MessageType::ChannelRequest, client_channel)
            .await;
        status.put_string("exit-status");
        status.put_bool(false);
        status.put_u32(0);
        server.send(status).await;

        let eof = server
            .channel_msg(MessageType::ChannelEof, client_channel)
            .await;
        server.send(eof).await;
        let close = server
            .channel_msg(MessageType::ChannelClose, client_channel)
            .await;
        server.send(close).await;

        // The client answers with exactly one CHANNEL_CLOSE.
        let mut client_close = server.recv_expect(MessageType::ChannelClose).await;
        assert_eq!(client_close.get_u32().unwrap(), 7);
        server
    });

    let client = timeout(WAIT, Client::connect(&addr, test_config(), accept_any()))
        .await
        .unwrap()
        .unwrap();
    client.auth_password("alice", "hunter2").await.unwrap();
    assert!(client.transport().is_authenticated());

    let channel = client.open_session().await.unwrap();
    channel.request_exec("whoami").await.unwrap();

    let mut output = Vec::new();
    while let Some(chunk) = timeout(WAIT, channel.read()).await.unwrap().unwrap() {
        output.extend_from_slice(&chunk);
    }
    assert_eq!(output, b"alice\n");

    timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(
        channel.exit_status(),
        Some(capstan_proto::ssh::channel::ExitStatus::Code(0))
    );
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_window_backpressure() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);

    let server = tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;
        server.accept_userauth_service().await;
        server.run_password_auth("alice", "pw").await;
        // Remote window 32768, max packet 16384: the first 50_000-byte write
        // must arrive as two full packets, then stall.
        let (client_channel, _) = server.accept_session(32768, 16384).await;

        let mut received = 0usize;
        for _ in 0..2 {
            let mut data = server.recv_expect(MessageType::ChannelData).await;
            assert_eq!(data.get_u32().unwrap(), 7);
            let chunk = data.get_bytes().unwrap();
            assert_eq!(chunk.len(), 16384);
            received += chunk.len();
        }
        assert_eq!(received, 32768);

        // Nothing more may arrive while the window is exhausted.
        let stalled = timeout(Duration::from_millis(300), server.recv()).await;
        assert!(stalled.is_err(), "data arrived with an empty window");

        // Refill the window; the remaining 17_232 bytes flush.
        let mut adjust = server
            .channel_msg(MessageType::ChannelWindowAdjust, client_channel)
            .await;
        adjust.put_u32(32768);
        server.send(adjust).await;

        while received < 50_000 {
            let mut data = server.recv_expect(MessageType::ChannelData).await;
            assert_eq!(data.get_u32().unwrap(), 7);
            received += data.get_bytes().unwrap().len();
        }
        assert_eq!(received, 50_000);
    });

    let client = timeout(WAIT, Client::connect(&addr, test_config(), accept_any()))
        .await
        .unwrap()
        .unwrap();
    client.auth_password("alice", "pw").await.unwrap();
    let channel = client.open_session().await.unwrap();
    assert_eq!(channel.remote_window_size(), 32768);
    assert_eq!(channel.remote_max_packet(), 16384);

    let payload = vec![0x5au8; 50_000];
    timeout(WAIT, channel.write(&payload)).await.unwrap().unwrap();

    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_mac_tamper_triggers_disconnect() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);

    let server = tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;

        // A tampered packet must be rejected before delivery.
        let mut ignore = SshBuffer::for_message(MessageType::Ignore);
        ignore.put_bytes(b"tampered");
        server.send_tampered(ignore).await;

        // The client responds with DISCONNECT, reason MAC_ERROR (5).
        let mut disconnect = server.recv_expect(MessageType::Disconnect).await;
        assert_eq!(disconnect.get_u32().unwrap(), 5);
    });

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut config = TransportConfig::default();
    config.timeout = Some(WAIT);
    let transport = timeout(
        WAIT,
        Transport::connect(
            stream,
            config,
            CryptoProvider::default_provider(),
            accept_any(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    let result = timeout(WAIT, transport.join()).await.unwrap();
    assert!(matches!(result, Err(TransportError::MacMismatch)));
    assert!(!transport.is_running());
    assert_eq!(transport.state(), TransportState::Dead);

    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_data_for_closed_channel_is_fatal() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);

    let server = tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;
        server.accept_userauth_service().await;
        server.run_password_auth("alice", "pw").await;
        let (client_channel, _) = server.accept_session(32768, 16384).await;

        // Close the channel from our side; the client answers in kind and
        // removes it from the table.
        let close = server
            .channel_msg(MessageType::ChannelClose, client_channel)
            .await;
        server.send(close).await;
        let mut client_close = server.recv_expect(MessageType::ChannelClose).await;
        assert_eq!(client_close.get_u32().unwrap(), 7);

        // Addressing the dead channel is a protocol violation.
        let mut stale = server
            .channel_msg(MessageType::ChannelData, client_channel)
            .await;
        stale.put_bytes(b"ghost");
        server.send(stale).await;

        let mut disconnect = server.recv_expect(MessageType::Disconnect).await;
        assert_eq!(disconnect.get_u32().unwrap(), 2); // PROTOCOL_ERROR
    });

    let client = timeout(WAIT, Client::connect(&addr, test_config(), accept_any()))
        .await
        .unwrap()
        .unwrap();
    client.auth_password("alice", "pw").await.unwrap();
    let channel = client.open_session().await.unwrap();

    // Peer-initiated close: our read sees EOF, the channel closes.
    let read = timeout(WAIT, channel.read()).await.unwrap();
    assert!(matches!(read, Ok(None) | Err(ConnectionError::Transport(_))));

    let result = timeout(WAIT, client.transport().join()).await.unwrap();
    assert!(matches!(
        result,
        Err(TransportError::Protocol { .. })
    ));

    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rekey_preserves_session() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);

    let server = tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;
        server.accept_userauth_service().await;
        server.run_password_auth("alice", "pw").await;

        let first_session_id = server.session_id.clone().unwrap();

        // Client-initiated re-key: a second full exchange over the
        // encrypted transport. Sequence numbers continue (the MACs would
        // fail otherwise) and the session id stays pinned to the first H.
        server.run_kex().await;
        assert_eq!(server.session_id.clone().unwrap(), first_session_id);

        // The new keys must carry traffic both ways.
        let (client_channel, _) = server.accept_session(32768, 16384).await;
        let mut data = server.recv_expect(MessageType::ChannelData).await;
        assert_eq!(data.get_u32().unwrap(), 7);
        assert_eq!(data.get_bytes().unwrap(), b"post-rekey");

        let mut echo = server
            .channel_msg(MessageType::ChannelData, client_channel)
            .await;
        echo.put_bytes(b"echo");
        server.send(echo).await;
    });

    let client = timeout(WAIT, Client::connect(&addr, test_config(), accept_any()))
        .await
        .unwrap()
        .unwrap();
    client.auth_password("alice", "pw").await.unwrap();

    let session_id_before = client.transport().session_id().unwrap();
    timeout(WAIT, client.rekey()).await.unwrap().unwrap();
    assert_eq!(client.transport().session_id().unwrap(), session_id_before);

    let channel = client.open_session().await.unwrap();
    channel.write(b"post-rekey").await.unwrap();
    let echoed = timeout(WAIT, channel.read()).await.unwrap().unwrap().unwrap();
    assert_eq!(&echoed[..], b"echo");

    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_global_request_failure_is_delivered() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);

    let server = tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;
        server.accept_userauth_service().await;
        server.run_password_auth("alice", "pw").await;

        let mut req = server.recv_expect(MessageType::GlobalRequest).await;
        assert_eq!(req.get_string().unwrap(), "tcpip-forward");
        assert!(req.get_bool().unwrap());
        server
            .send(SshBuffer::for_message(MessageType::RequestFailure))
            .await;
    });

    let client = timeout(WAIT, Client::connect(&addr, test_config(), accept_any()))
        .await
        .unwrap()
        .unwrap();
    client.auth_password("alice", "pw").await.unwrap();

    let mut payload = SshBuffer::new();
    payload.put_string("127.0.0.1");
    payload.put_u32(8080);
    let result = timeout(
        WAIT,
        client
            .connection()
            .global_request("tcpip-forward", true, payload),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(ConnectionError::RequestFailed)));

    timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_explicit_disconnect_is_clean_and_idempotent() {
    let (listener, addr) = start_server().await;
    let signer = Ed25519Signer::generate(&SystemRandom);

    let server = tokio::spawn(async move {
        let mut server = TestServer::accept(listener, signer).await;
        server.run_kex().await;
        let mut disconnect = server.recv_expect(MessageType::Disconnect).await;
        assert_eq!(disconnect.get_u32().unwrap(), 11); // BY_APPLICATION
    });

    let client = timeout(WAIT, Client::connect(&addr, test_config(), accept_any()))
        .await
        .unwrap()
        .unwrap();

    client.disconnect().await;
    client.disconnect().await; // safe to repeat
    let result = timeout(WAIT, client.transport().join()).await.unwrap();
    assert!(result.is_ok());

    // Public calls after the fatal path report Stopped.
    let write = client.transport().send_keepalive().await;
    assert!(matches!(write, Err(TransportError::Stopped)));

    timeout(WAIT, server).await.unwrap().unwrap();
}

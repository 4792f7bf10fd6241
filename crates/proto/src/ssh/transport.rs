//! The SSH transport protocol (RFC 4253).
//!
//! A [`Transport`] owns the TCP socket and two pump tasks:
//!
//! - the *read pump* feeds socket bytes to the [`Decoder`] and dispatches
//!   each completed packet by message id - transport generics are handled
//!   here, key exchange packets go to the [`KeyExchanger`], everything else
//!   to the active [`Service`];
//! - the *write pump* takes finished ciphertext frames from a one-slot
//!   handoff queue and writes them to the socket, preserving encode order.
//!
//! [`Transport::write`] serializes encodes under a writer lock and blocks
//! while a key exchange is in flight (key exchange packets themselves are
//! exempt), so no packet can cross a NEWKEYS boundary under the wrong keys.
//!
//! Any fatal error - decode failure, MAC mismatch, socket error, protocol
//! violation - funnels into a single teardown path that fans the error out
//! to every outstanding waiter, sends a best-effort SSH_MSG_DISCONNECT and
//! releases the socket and pump tasks exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use capstan_platform::{DisconnectReason, Event, TransportError, TransportResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ssh::buffer::SshBuffer;
use crate::ssh::codec::{Decoder, Encoder};
use crate::ssh::crypto::CryptoProvider;
use crate::ssh::hostkey::HostKeyVerifier;
use crate::ssh::kex::{AlgoSet, KeyExchanger};
use crate::ssh::message::MessageType;
use crate::ssh::service::Service;
use crate::ssh::version::{Version, MAX_PREAMBLE};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Software version sent in our identification line.
    pub software_version: String,

    /// Timeout applied to handshake and event waits. `None` waits forever.
    pub timeout: Option<Duration>,

    /// Bytes of traffic after which a re-key is initiated (default 1 GiB).
    pub rekey_bytes_limit: u64,

    /// Wall-clock interval after which a re-key is initiated (default 1 h).
    pub rekey_time_limit: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            software_version: format!("Capstan_{}", env!("CARGO_PKG_VERSION")),
            timeout: Some(Duration::from_secs(30)),
            rekey_bytes_limit: 1024 * 1024 * 1024,
            rekey_time_limit: Duration::from_secs(3600),
        }
    }
}

/// Coarse transport lifecycle, derived from the live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Connected, first key exchange not yet completed.
    Init,
    /// A re-key threshold has passed and an exchange is due.
    KexNeeded,
    /// A key exchange is in flight; non-KEX writes are blocked.
    KexOngoing,
    /// A SERVICE_REQUEST is awaiting its SERVICE_ACCEPT.
    ServiceRequested,
    /// Normal operation.
    Running,
    /// A fatal error or explicit disconnect ended the transport.
    Dead,
}

struct Writer {
    encoder: Encoder,
    tx: mpsc::Sender<Vec<u8>>,
}

struct TransportInner {
    config: TransportConfig,
    provider: Arc<CryptoProvider>,
    client_id: String,
    server_id: String,
    remote_addr: SocketAddr,
    writer: tokio::sync::Mutex<Writer>,
    kexer: KeyExchanger,
    service: Mutex<Option<Arc<dyn Service>>>,
    service_accept: Event<(), TransportError>,
    authed: Arc<AtomicBool>,
    traffic: Arc<AtomicU64>,
    last_kex: Mutex<Instant>,
    dead: Mutex<Option<TransportError>>,
    closed: Event<(), TransportError>,
    shutdown: tokio::sync::Notify,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Handle to one SSH connection's transport layer. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Runs the identification exchange and initial key exchange over an
    /// established TCP connection, returning a running transport.
    ///
    /// Blocks until the first key exchange has completed; the returned
    /// transport is ready for [`Transport::request_service`].
    pub async fn connect(
        stream: TcpStream,
        config: TransportConfig,
        provider: Arc<CryptoProvider>,
        verifiers: Vec<Arc<dyn HostKeyVerifier>>,
    ) -> TransportResult<Self> {
        let remote_addr = stream.peer_addr()?;
        let (mut read_half, mut write_half) = stream.into_split();

        let client_id = format!("SSH-2.0-{}", config.software_version);
        info!(%client_id, "client identification");
        write_half
            .write_all(format!("{}\r\n", client_id).as_bytes())
            .await?;
        let server_id = read_identification(&mut read_half).await?;
        info!(%server_id, "server identification");

        let authed = Arc::new(AtomicBool::new(false));
        let traffic = Arc::new(AtomicU64::new(0));
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(1);
        let encoder = Encoder::new(provider.random(), Arc::clone(&authed), Arc::clone(&traffic));
        let decoder = Decoder::new(Arc::clone(&authed), Arc::clone(&traffic));

        let transport = Transport {
            inner: Arc::new(TransportInner {
                config,
                provider,
                client_id,
                server_id,
                remote_addr,
                writer: tokio::sync::Mutex::new(Writer { encoder, tx: out_tx }),
                kexer: KeyExchanger::new(verifiers),
                service: Mutex::new(None),
                service_accept: Event::new("service accept"),
                authed,
                traffic,
                last_kex: Mutex::new(Instant::now()),
                dead: Mutex::new(None),
                closed: Event::new("transport closed"),
                shutdown: tokio::sync::Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        // The write pump is not tracked for abort: it drains the handoff
        // queue and exits on the shutdown signal, so a final DISCONNECT
        // always reaches the socket.
        tokio::spawn(write_pump(transport.clone(), out_rx, write_half));
        let read_task = tokio::spawn(read_pump(transport.clone(), read_half, decoder));
        transport
            .inner
            .tasks
            .lock()
            .expect("transport lock poisoned")
            .push(read_task);

        if let Err(err) = transport.inner.kexer.start(&transport, true).await {
            transport.die(err.clone());
            return Err(err);
        }
        Ok(transport)
    }

    /// Our identification line.
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// The server's identification line.
    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// The peer's socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// The crypto provider this transport was built with.
    pub fn provider(&self) -> Arc<CryptoProvider> {
        Arc::clone(&self.inner.provider)
    }

    /// The configured wait timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.config.timeout
    }

    /// The session identifier (`H` of the first key exchange).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.inner.kexer.session_id()
    }

    /// Whether the transport is alive (no fatal error recorded).
    pub fn is_running(&self) -> bool {
        self.inner.dead.lock().expect("transport lock poisoned").is_none()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TransportState {
        if !self.is_running() {
            return TransportState::Dead;
        }
        if self.inner.kexer.is_ongoing() {
            return TransportState::KexOngoing;
        }
        if !self.inner.kexer.is_done() {
            return TransportState::Init;
        }
        if self.rekey_due() {
            return TransportState::KexNeeded;
        }
        let service_pending = self
            .inner
            .service
            .lock()
            .expect("transport lock poisoned")
            .is_some()
            && !self.inner.service_accept.is_set();
        if service_pending {
            return TransportState::ServiceRequested;
        }
        TransportState::Running
    }

    fn rekey_due(&self) -> bool {
        let traffic = self.inner.traffic.load(Ordering::Relaxed);
        let elapsed = self
            .inner
            .last_kex
            .lock()
            .expect("transport lock poisoned")
            .elapsed();
        traffic >= self.inner.config.rekey_bytes_limit
            || elapsed >= self.inner.config.rekey_time_limit
    }

    /// Whether user authentication has completed.
    pub fn is_authenticated(&self) -> bool {
        self.inner.authed.load(Ordering::Relaxed)
    }

    /// Marks the transport authenticated, activating delayed compression.
    pub fn set_authenticated(&self) {
        self.inner.authed.store(true, Ordering::Relaxed);
    }

    /// Adds a host key verifier, consulted on every (re-)key exchange.
    pub fn add_host_key_verifier(&self, verifier: Arc<dyn HostKeyVerifier>) {
        self.inner.kexer.add_verifier(verifier);
    }

    /// Encodes and queues one packet, returning its sequence number.
    ///
    /// Blocks while a key exchange is in flight and while the handoff queue
    /// is full, preserving total packet order.
    pub async fn write(&self, buf: SshBuffer) -> TransportResult<u32> {
        self.write_packet(buf, false).await
    }

    pub(crate) async fn write_packet(
        &self,
        mut buf: SshBuffer,
        kex_msg: bool,
    ) -> TransportResult<u32> {
        let mut writer = loop {
            self.check_alive()?;
            if !kex_msg && self.inner.kexer.is_ongoing() {
                self.inner.kexer.wait_done(self.timeout()).await?;
                continue;
            }
            let writer = self.inner.writer.lock().await;
            if !kex_msg && self.inner.kexer.is_ongoing() {
                // A re-key started while we were acquiring the lock.
                drop(writer);
                continue;
            }
            break writer;
        };
        self.check_alive()?;
        let seq = writer.encoder.encode(&mut buf)?;
        writer
            .tx
            .send(buf.compact())
            .await
            .map_err(|_| TransportError::Stopped)?;
        Ok(seq)
    }

    /// Queues NEWKEYS and installs the outbound algorithm set in the same
    /// writer critical section.
    pub(crate) async fn send_newkeys(&self, outbound: AlgoSet) -> TransportResult<()> {
        let mut writer = self.inner.writer.lock().await;
        let mut buf = SshBuffer::for_message(MessageType::NewKeys);
        writer.encoder.encode(&mut buf)?;
        writer
            .tx
            .send(buf.compact())
            .await
            .map_err(|_| TransportError::Stopped)?;
        writer
            .encoder
            .set_algorithms(outbound.cipher, outbound.mac, outbound.compression);
        info!("sent SSH_MSG_NEWKEYS, outbound algorithms installed");
        Ok(())
    }

    /// Requests a service from the server and installs it as the active
    /// service once the server accepts.
    pub async fn request_service(&self, service: Arc<dyn Service>) -> TransportResult<()> {
        self.inner.service_accept.clear();
        self.set_active_service(Arc::clone(&service));

        info!(service = service.name(), "sending SSH_MSG_SERVICE_REQUEST");
        let mut buf = SshBuffer::for_message(MessageType::ServiceRequest);
        buf.put_string(service.name());
        self.write(buf).await?;

        self.inner.service_accept.wait(self.timeout()).await
    }

    /// Installs the active service without a SERVICE_REQUEST handshake
    /// (the server switches to `ssh-connection` implicitly after
    /// authentication succeeds).
    pub fn set_active_service(&self, service: Arc<dyn Service>) {
        debug!(service = service.name(), "setting active service");
        *self.inner.service.lock().expect("transport lock poisoned") = Some(service);
    }

    pub(crate) fn active_service(&self) -> Option<Arc<dyn Service>> {
        self.inner.service.lock().expect("transport lock poisoned").clone()
    }

    /// Initiates a re-key and waits for it to complete.
    pub async fn rekey(&self) -> TransportResult<()> {
        self.check_alive()?;
        self.inner.kexer.start(self, true).await
    }

    pub(crate) fn reset_rekey_tracking(&self) {
        self.inner.traffic.store(0, Ordering::Relaxed);
        *self.inner.last_kex.lock().expect("transport lock poisoned") = Instant::now();
    }

    async fn maybe_rekey(&self) {
        if !self.is_running() || self.inner.kexer.is_ongoing() || !self.inner.kexer.is_done() {
            return;
        }
        if self.rekey_due() {
            info!("re-key threshold reached");
            if let Err(err) = self.inner.kexer.start(self, false).await {
                self.die(err);
            }
        }
    }

    /// Sends SSH_MSG_IGNORE with random payload, as a keep-alive.
    pub async fn send_keepalive(&self) -> TransportResult<()> {
        let mut data = [0u8; 16];
        self.inner.provider.random().fill(&mut data);
        let mut buf = SshBuffer::for_message(MessageType::Ignore);
        buf.put_bytes(&data);
        self.write(buf).await.map(|_| ())
    }

    pub(crate) async fn send_unimplemented(&self, seq: u32) -> TransportResult<()> {
        debug!(seq, "sending SSH_MSG_UNIMPLEMENTED");
        let mut buf = SshBuffer::for_message(MessageType::Unimplemented);
        buf.put_u32(seq);
        self.write(buf).await.map(|_| ())
    }

    /// Sends SSH_MSG_DISCONNECT and terminates the transport. Idempotent.
    pub async fn disconnect(&self, reason: DisconnectReason, message: &str) {
        if !self.is_running() {
            return;
        }
        info!(%reason, message, "sending SSH_MSG_DISCONNECT");
        let mut buf = SshBuffer::for_message(MessageType::Disconnect);
        buf.put_u32(reason as u32);
        buf.put_string(message);
        buf.put_string("");
        let _ = self.write_packet(buf, true).await;
        self.die(TransportError::Stopped);
    }

    /// Waits until the transport has terminated, returning the error that
    /// ended it (explicit disconnects end it cleanly).
    pub async fn join(&self) -> TransportResult<()> {
        self.inner.closed.wait(None).await
    }

    fn check_alive(&self) -> TransportResult<()> {
        if self.inner.dead.lock().expect("transport lock poisoned").is_some() {
            return Err(TransportError::Stopped);
        }
        Ok(())
    }

    /// The single teardown path: records the error, fans it out to every
    /// waiter, sends a best-effort DISCONNECT, and releases resources.
    /// Only the first caller does any of this.
    pub(crate) fn die(&self, err: TransportError) {
        {
            let mut dead = self.inner.dead.lock().expect("transport lock poisoned");
            if dead.is_some() {
                return;
            }
            *dead = Some(err.clone());
        }
        warn!(%err, "transport terminating");

        // Best-effort DISCONNECT; skipped when the peer already hung up.
        if !matches!(
            err,
            TransportError::Disconnected { .. } | TransportError::Io(_) | TransportError::Stopped
        ) {
            if let Ok(mut writer) = self.inner.writer.try_lock() {
                let mut buf = SshBuffer::for_message(MessageType::Disconnect);
                buf.put_u32(err.disconnect_reason() as u32);
                buf.put_string(&err.to_string());
                buf.put_string("");
                if writer.encoder.encode(&mut buf).is_ok() {
                    let _ = writer.tx.try_send(buf.compact());
                }
            }
        }

        self.inner.kexer.notify_error(&err);
        self.inner.service_accept.notify_error(&err);
        if let Some(service) = self
            .inner
            .service
            .lock()
            .expect("transport lock poisoned")
            .take()
        {
            service.notify_error(&err);
        }

        match err {
            TransportError::Stopped => self.inner.closed.set(()),
            other => self.inner.closed.error(other),
        }

        self.inner.shutdown.notify_one();
        for task in self
            .inner
            .tasks
            .lock()
            .expect("transport lock poisoned")
            .drain(..)
        {
            task.abort();
        }
    }

    /// Dispatches one decoded packet. Runs on the read pump.
    async fn dispatch(
        &self,
        seq: u32,
        mut buf: SshBuffer,
        decoder: &mut Decoder,
    ) -> TransportResult<()> {
        let byte = buf.get_u8()?;
        let Some(msg) = MessageType::from_u8(byte) else {
            if self.inner.kexer.is_ongoing() {
                // Replying would block on the very exchange this packet is
                // stalling; treat it as a violation instead.
                return Err(TransportError::protocol(format!(
                    "unknown message id {} during key exchange",
                    byte
                )));
            }
            debug!(byte, seq, "unknown message id");
            return self.send_unimplemented(seq).await;
        };
        debug!(%msg, seq, "received packet");

        match msg {
            MessageType::Disconnect => {
                let reason = buf.get_u32()?;
                let message = buf.get_string().unwrap_or_default();
                info!(reason, %message, "received SSH_MSG_DISCONNECT");
                Err(TransportError::Disconnected { reason, message })
            }
            MessageType::Ignore => {
                debug!("received SSH_MSG_IGNORE");
                Ok(())
            }
            MessageType::Debug => {
                let always_display = buf.get_bool()?;
                let message = buf.get_string()?;
                debug!(always_display, %message, "received SSH_MSG_DEBUG");
                Ok(())
            }
            MessageType::Unimplemented => {
                let bad_seq = buf.get_u32()?;
                info!(bad_seq, "received SSH_MSG_UNIMPLEMENTED");
                match self.active_service() {
                    Some(service) => service.notify_unimplemented(bad_seq).await,
                    None => Ok(()),
                }
            }
            MessageType::KexInit => self.inner.kexer.handle(self, msg, buf, decoder).await,
            msg if self.inner.kexer.is_ongoing() => {
                self.inner.kexer.handle(self, msg, buf, decoder).await
            }
            MessageType::NewKeys => Err(TransportError::UnexpectedMessage {
                expected: "no NEWKEYS outside key exchange".to_string(),
                got: msg.to_string(),
            }),
            MessageType::ServiceAccept => {
                self.inner.service_accept.set(());
                Ok(())
            }
            _ => match self.active_service() {
                Some(service) => service.handle(seq, msg, buf).await,
                None => self.send_unimplemented(seq).await,
            },
        }
    }
}

/// Scans the identification preamble and returns the server's line.
async fn read_identification(read_half: &mut OwnedReadHalf) -> TransportResult<String> {
    let mut total = 0usize;
    loop {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = read_half.read(&mut byte).await?;
            if n == 0 {
                return Err(TransportError::protocol(
                    "connection closed during identification exchange",
                ));
            }
            total += 1;
            if total > MAX_PREAMBLE {
                return Err(TransportError::protocol(
                    "identification preamble exceeds 16 KiB",
                ));
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > 1024 {
                return Err(TransportError::protocol("identification line too long"));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let text = String::from_utf8_lossy(&line).to_string();
        if text.starts_with("SSH-") {
            Version::parse(&text)?;
            return Ok(text);
        }
        debug!(%text, "skipping identification preamble line");
    }
}

/// Takes ciphertext frames from the handoff queue and writes them out.
/// On shutdown it drains whatever is already queued (the final DISCONNECT)
/// before exiting.
async fn write_pump(transport: Transport, mut rx: mpsc::Receiver<Vec<u8>>, mut half: OwnedWriteHalf) {
    loop {
        tokio::select! {
            biased;
            data = rx.recv() => {
                let Some(data) = data else { break };
                if let Err(err) = half.write_all(&data).await {
                    transport.die(err.into());
                    break;
                }
                debug!(bytes = data.len(), "sent packet");
            }
            _ = transport.inner.shutdown.notified() => {
                while let Ok(data) = rx.try_recv() {
                    let _ = half.write_all(&data).await;
                }
                break;
            }
        }
    }
    let _ = half.shutdown().await;
    debug!("write pump stopping");
}

/// Reads socket bytes, drives the decoder, dispatches packets.
async fn read_pump(transport: Transport, mut half: OwnedReadHalf, mut decoder: Decoder) {
    let mut chunk = vec![0u8; 32 * 1024];
    'outer: while transport.is_running() {
        let n = match half.read(&mut chunk).await {
            Ok(0) => {
                transport.die(TransportError::from(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
                break;
            }
            Ok(n) => n,
            Err(err) => {
                transport.die(err.into());
                break;
            }
        };
        decoder.feed(&chunk[..n]);
        loop {
            match decoder.poll() {
                Ok(Some((seq, buf))) => {
                    if let Err(err) = transport.dispatch(seq, buf, &mut decoder).await {
                        transport.die(err);
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    transport.die(err);
                    break 'outer;
                }
            }
        }
        transport.maybe_rekey().await;
    }
    debug!("read pump stopping");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TransportConfig::default();
        assert!(config.software_version.starts_with("Capstan_"));
        assert_eq!(config.rekey_bytes_limit, 1024 * 1024 * 1024);
        assert_eq!(config.rekey_time_limit, Duration::from_secs(3600));
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
    }

    // Wire-level behavior of the transport (identification exchange, key
    // exchange, dispatch, disconnect semantics) is covered by the scripted
    // peer in tests/ssh_integration.rs.
}

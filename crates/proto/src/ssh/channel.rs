//! Channels: per-channel state machine, streams and flow control (RFC 4254).
//!
//! A channel is addressable from the moment it enters the connection
//! service's table until the close handshake completes; both sides send
//! exactly one CHANNEL_CLOSE and the channel is gone only after both.
//!
//! # Flow control
//!
//! Each direction has a window of unacknowledged bytes:
//!
//! - outgoing writes split into chunks bounded by the remote maximum packet
//!   size and block while the remote window is empty;
//! - incoming data decrements the local window, and once it falls below half
//!   its initial size a WINDOW_ADJUST restores it in one step.
//!
//! # EOF/close sequencing
//!
//! `send_eof` is idempotent and, when the peer's EOF was already seen,
//! rolls straight into the close handshake. A received CHANNEL_CLOSE
//! triggers our own (if not yet sent), closes both streams, removes the
//! channel from the table and resolves the close event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use capstan_platform::{ConnectionError, ConnectionResult, Event, TransportError, TransportResult};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::ssh::buffer::SshBuffer;
use crate::ssh::connection::ConnInner;
use crate::ssh::message::{MessageType, SSH_EXTENDED_DATA_STDERR};
use crate::ssh::transport::Transport;

/// How a session ended, delivered via `exit-status` / `exit-signal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Process exit code.
    Code(u32),
    /// Process killed by a signal.
    Signal {
        /// Signal name without the "SIG" prefix.
        name: String,
        /// Whether a core was dumped.
        core_dumped: bool,
        /// Server-provided message.
        message: String,
    },
}

pub(crate) enum ChannelKind {
    /// Opened by us with CHANNEL_OPEN.
    Direct,
    /// Opened by the peer; carries the type-specific open data.
    Forwarded {
        /// Raw type-specific bytes from the CHANNEL_OPEN.
        type_data: Vec<u8>,
    },
}

#[derive(Default)]
struct ChanFlags {
    recipient: u32,
    open: bool,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    closed: bool,
}

struct WindowState {
    size: i64,
    initial: u32,
    max_packet: u32,
}

/// Credit granted to the peer for data it may send us.
struct LocalWindow {
    state: Mutex<WindowState>,
}

impl LocalWindow {
    fn new(initial: u32, max_packet: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                size: i64::from(initial),
                initial,
                max_packet,
            }),
        }
    }

    fn size(&self) -> i64 {
        self.state.lock().expect("window lock poisoned").size
    }

    fn max_packet(&self) -> u32 {
        self.state.lock().expect("window lock poisoned").max_packet
    }

    /// Consumes credit for received data; returns the adjustment to send
    /// when the window has dropped below half its initial size.
    fn consume(&self, len: u32) -> TransportResult<Option<u32>> {
        let mut state = self.state.lock().expect("window lock poisoned");
        state.size -= i64::from(len);
        if state.size < 0 {
            return Err(TransportError::protocol(format!(
                "peer overflowed the local window by {} bytes",
                -state.size
            )));
        }
        if state.size < i64::from(state.initial / 2) {
            let adjustment = (i64::from(state.initial) - state.size) as u32;
            state.size = i64::from(state.initial);
            Ok(Some(adjustment))
        } else {
            Ok(None)
        }
    }
}

/// Credit the peer granted us; writers block on it.
struct RemoteWindow {
    state: Mutex<WindowState>,
    notify: Notify,
}

impl RemoteWindow {
    fn new() -> Self {
        Self {
            state: Mutex::new(WindowState {
                size: 0,
                initial: 0,
                max_packet: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn init(&self, size: u32, max_packet: u32) {
        let mut state = self.state.lock().expect("window lock poisoned");
        state.size = i64::from(size);
        state.initial = size;
        state.max_packet = max_packet;
    }

    fn size(&self) -> i64 {
        self.state.lock().expect("window lock poisoned").size
    }

    fn max_packet(&self) -> u32 {
        self.state.lock().expect("window lock poisoned").max_packet
    }

    fn expand(&self, n: u32) {
        let mut state = self.state.lock().expect("window lock poisoned");
        state.size += i64::from(n);
        debug!(by = n, up_to = state.size, "remote window expanded");
        drop(state);
        self.notify.notify_waiters();
    }

    fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}

/// One direction of a channel's byte stream.
struct Stream {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl Stream {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn push(&self, data: Bytes) {
        if let Some(tx) = self.tx.lock().expect("stream lock poisoned").as_ref() {
            let _ = tx.send(data);
        }
    }

    /// Drops the sender; pending data stays readable, then EOF.
    fn close(&self) {
        self.tx.lock().expect("stream lock poisoned").take();
    }

    async fn read(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }
}

pub(crate) struct ChannelCore {
    id: u32,
    ctype: String,
    kind: ChannelKind,
    transport: Transport,
    conn: Weak<ConnInner>,
    flags: Mutex<ChanFlags>,
    local: LocalWindow,
    remote: RemoteWindow,
    open_ev: Event<(), ConnectionError>,
    close_ev: Event<(), ConnectionError>,
    reqs: Mutex<VecDeque<Event<(), ConnectionError>>>,
    stdout: Stream,
    stderr: Stream,
    exit: Mutex<Option<ExitStatus>>,
    error: Mutex<Option<ConnectionError>>,
    timeout: Option<Duration>,
}

impl ChannelCore {
    pub(crate) fn new(
        id: u32,
        ctype: String,
        kind: ChannelKind,
        transport: Transport,
        conn: Weak<ConnInner>,
        window_size: u32,
        max_packet_size: u32,
    ) -> Self {
        let timeout = transport.timeout();
        Self {
            id,
            ctype,
            kind,
            transport,
            conn,
            flags: Mutex::new(ChanFlags::default()),
            local: LocalWindow::new(window_size, max_packet_size),
            remote: RemoteWindow::new(),
            open_ev: Event::new("channel open"),
            close_ev: Event::new("channel close"),
            reqs: Mutex::new(VecDeque::new()),
            stdout: Stream::new(),
            stderr: Stream::new(),
            exit: Mutex::new(None),
            error: Mutex::new(None),
            timeout,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn channel_type(&self) -> &str {
        &self.ctype
    }

    pub(crate) fn recipient(&self) -> u32 {
        self.flags.lock().expect("channel lock poisoned").recipient
    }

    pub(crate) fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    pub(crate) fn is_open(&self) -> bool {
        let flags = self.flags.lock().expect("channel lock poisoned");
        flags.open && !flags.close_sent && !flags.closed
    }

    pub(crate) fn local_window_size(&self) -> i64 {
        self.local.size()
    }

    pub(crate) fn local_max_packet(&self) -> u32 {
        self.local.max_packet()
    }

    pub(crate) fn remote_window_size(&self) -> i64 {
        self.remote.size()
    }

    pub(crate) fn remote_max_packet(&self) -> u32 {
        self.remote.max_packet()
    }

    pub(crate) fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.lock().expect("channel lock poisoned").clone()
    }

    pub(crate) fn open_event(&self) -> Event<(), ConnectionError> {
        self.open_ev.clone()
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// A message buffer addressed to the peer's end of this channel.
    fn msg_buffer(&self, msg: MessageType) -> SshBuffer {
        let mut buf = SshBuffer::for_message(msg);
        buf.put_u32(self.recipient());
        buf
    }

    /// Completes a direct open from CHANNEL_OPEN_CONFIRMATION.
    pub(crate) fn confirm_open(&self, buf: &mut SshBuffer) -> TransportResult<()> {
        let recipient = buf.get_u32()?;
        let window = buf.get_u32()?;
        let max_packet = buf.get_u32()?;
        {
            let mut flags = self.flags.lock().expect("channel lock poisoned");
            flags.recipient = recipient;
            flags.open = true;
        }
        self.remote.init(window, max_packet);
        info!(
            id = self.id,
            recipient, window, max_packet, "channel open confirmed"
        );
        self.open_ev.set(());
        Ok(())
    }

    /// Fails a direct open from CHANNEL_OPEN_FAILURE.
    pub(crate) fn fail_open(&self, code: u32, message: String) {
        info!(id = self.id, code, %message, "channel open rejected");
        self.open_ev.error(ConnectionError::OpenRejected { code, message });
    }

    /// Initializes remote-side state for a peer-opened channel.
    pub(crate) fn init_forwarded(&self, recipient: u32, window: u32, max_packet: u32) {
        self.flags.lock().expect("channel lock poisoned").recipient = recipient;
        self.remote.init(window, max_packet);
    }

    /// Marks a forwarded channel open once our confirmation is queued.
    pub(crate) fn mark_open(&self) {
        self.flags.lock().expect("channel lock poisoned").open = true;
        self.open_ev.set(());
    }

    /// Handles one channel-addressed packet (the channel id is already
    /// consumed).
    pub(crate) async fn handle(
        &self,
        seq: u32,
        msg: MessageType,
        mut buf: SshBuffer,
    ) -> TransportResult<()> {
        match msg {
            MessageType::ChannelWindowAdjust => {
                let n = buf.get_u32()?;
                self.remote.expand(n);
                Ok(())
            }
            MessageType::ChannelData => {
                let data = buf.get_bytes()?;
                self.receive_data(&self.stdout, data).await
            }
            MessageType::ChannelExtendedData => {
                let code = buf.get_u32()?;
                if code != SSH_EXTENDED_DATA_STDERR {
                    return Err(TransportError::protocol(format!(
                        "unsupported extended data type {}",
                        code
                    )));
                }
                let data = buf.get_bytes()?;
                self.receive_data(&self.stderr, data).await
            }
            MessageType::ChannelRequest => {
                let rtype = buf.get_string()?;
                let want_reply = buf.get_bool()?;
                self.handle_request(&rtype, want_reply, buf).await
            }
            MessageType::ChannelSuccess => self.got_reply(true),
            MessageType::ChannelFailure => self.got_reply(false),
            MessageType::ChannelEof => {
                info!(id = self.id, "received channel EOF");
                let close_now = {
                    let mut flags = self.flags.lock().expect("channel lock poisoned");
                    flags.eof_received = true;
                    flags.eof_sent
                };
                self.stdout.close();
                self.stderr.close();
                if close_now {
                    self.send_close().await?;
                }
                Ok(())
            }
            MessageType::ChannelClose => self.handle_close().await,
            _ => {
                warn!(id = self.id, %msg, "unknown channel message");
                self.transport.send_unimplemented(seq).await
            }
        }
    }

    async fn receive_data(&self, stream: &Stream, data: Vec<u8>) -> TransportResult<()> {
        if data.len() > self.local.max_packet() as usize {
            return Err(TransportError::protocol(format!(
                "channel data of {} bytes exceeds the local maximum packet size {}",
                data.len(),
                self.local.max_packet()
            )));
        }
        let adjustment = self.local.consume(data.len() as u32)?;
        stream.push(Bytes::from(data));
        if let Some(adjustment) = adjustment {
            debug!(id = self.id, adjustment, "restoring local window");
            let mut buf = self.msg_buffer(MessageType::ChannelWindowAdjust);
            buf.put_u32(adjustment);
            self.transport.write(buf).await?;
        }
        Ok(())
    }

    async fn handle_request(
        &self,
        rtype: &str,
        want_reply: bool,
        mut buf: SshBuffer,
    ) -> TransportResult<()> {
        match rtype {
            "exit-status" => {
                let code = buf.get_u32()?;
                info!(id = self.id, code, "exit status");
                *self.exit.lock().expect("channel lock poisoned") = Some(ExitStatus::Code(code));
            }
            "exit-signal" => {
                let name = buf.get_string()?;
                let core_dumped = buf.get_bool()?;
                let message = buf.get_string()?;
                info!(id = self.id, %name, "exit signal");
                *self.exit.lock().expect("channel lock poisoned") = Some(ExitStatus::Signal {
                    name,
                    core_dumped,
                    message,
                });
            }
            _ => {
                debug!(id = self.id, rtype, "unhandled channel request");
                if want_reply {
                    let reply = self.msg_buffer(MessageType::ChannelFailure);
                    self.transport.write(reply).await?;
                }
                return Ok(());
            }
        }
        if want_reply {
            let reply = self.msg_buffer(MessageType::ChannelSuccess);
            self.transport.write(reply).await?;
        }
        Ok(())
    }

    fn got_reply(&self, success: bool) -> TransportResult<()> {
        let event = self
            .reqs
            .lock()
            .expect("channel lock poisoned")
            .pop_front()
            .ok_or_else(|| {
                TransportError::protocol(
                    "received a reply to a channel request when none was outstanding",
                )
            })?;
        if success {
            event.set(());
        } else {
            event.error(ConnectionError::RequestFailed);
        }
        Ok(())
    }

    /// Sends our CHANNEL_CLOSE exactly once.
    async fn send_close(&self) -> TransportResult<()> {
        let send = {
            let mut flags = self.flags.lock().expect("channel lock poisoned");
            if flags.close_sent {
                false
            } else {
                flags.close_sent = true;
                true
            }
        };
        if send {
            info!(id = self.id, "sending channel close");
            self.transport
                .write(self.msg_buffer(MessageType::ChannelClose))
                .await?;
        }
        Ok(())
    }

    /// Peer-initiated close: answer with ours, tear the channel down.
    async fn handle_close(&self) -> TransportResult<()> {
        info!(id = self.id, "received channel close");
        self.send_close().await?;
        self.flags.lock().expect("channel lock poisoned").closed = true;
        self.stdout.close();
        self.stderr.close();
        self.remote.wake_all();
        if let Some(conn) = self.conn.upgrade() {
            conn.forget(self.id);
        }
        self.close_ev.set(());
        Ok(())
    }

    /// Sends CHANNEL_EOF once; proceeds to close if the peer's EOF was
    /// already received.
    pub(crate) async fn send_eof(&self) -> ConnectionResult<()> {
        let (send, close_after) = {
            let mut flags = self.flags.lock().expect("channel lock poisoned");
            if flags.eof_sent || flags.close_sent || flags.closed {
                (false, false)
            } else {
                flags.eof_sent = true;
                (true, flags.eof_received)
            }
        };
        if send {
            info!(id = self.id, "sending channel EOF");
            self.transport
                .write(self.msg_buffer(MessageType::ChannelEof))
                .await?;
            if close_after {
                self.send_close().await?;
            }
        }
        Ok(())
    }

    /// Closes the channel and waits for the handshake to complete.
    pub(crate) async fn close(&self) -> ConnectionResult<()> {
        if self.flags.lock().expect("channel lock poisoned").closed {
            return Ok(());
        }
        self.send_close().await?;
        self.close_ev.wait(self.timeout).await
    }

    /// Sends a channel request; with `want_reply` the call resolves through
    /// the FIFO reply queue.
    pub(crate) async fn send_request(
        &self,
        rtype: &str,
        want_reply: bool,
        payload: &SshBuffer,
    ) -> ConnectionResult<()> {
        debug!(id = self.id, rtype, "sending channel request");
        let mut buf = self.msg_buffer(MessageType::ChannelRequest);
        buf.put_string(rtype);
        buf.put_bool(want_reply);
        buf.put_buffer(payload);

        let event = if want_reply {
            let event: Event<(), ConnectionError> = Event::new("channel request reply");
            self.reqs
                .lock()
                .expect("channel lock poisoned")
                .push_back(event.clone());
            Some(event)
        } else {
            None
        };

        self.transport.write(buf).await?;
        match event {
            Some(event) => event.wait(self.timeout).await,
            None => Ok(()),
        }
    }

    /// Grants up to `want` bytes of remote window, blocking while empty.
    async fn reserve_remote(&self, want: usize) -> ConnectionResult<usize> {
        loop {
            let notified = self.remote.notify.notified();
            {
                let flags = self.flags.lock().expect("channel lock poisoned");
                if flags.closed || flags.close_sent || flags.eof_sent {
                    return Err(ConnectionError::ChannelClosed);
                }
                if let Some(err) = self.error.lock().expect("channel lock poisoned").clone() {
                    return Err(err);
                }
                drop(flags);
                let mut state = self.remote.state.lock().expect("window lock poisoned");
                if state.size > 0 {
                    let grant = want
                        .min(state.size as usize)
                        .min(state.max_packet as usize);
                    state.size -= grant as i64;
                    return Ok(grant);
                }
            }
            debug!(id = self.id, want, "write blocked on remote window");
            notified.await;
        }
    }

    /// Writes application data, chunked and window-limited.
    pub(crate) async fn write_data(&self, data: &[u8], ext: Option<u32>) -> ConnectionResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let grant = self.reserve_remote(data.len() - offset).await?;
            let chunk = &data[offset..offset + grant];
            let mut buf = match ext {
                None => self.msg_buffer(MessageType::ChannelData),
                Some(code) => {
                    let mut buf = self.msg_buffer(MessageType::ChannelExtendedData);
                    buf.put_u32(code);
                    buf
                }
            };
            buf.put_bytes(chunk);
            self.transport.write(buf).await?;
            offset += grant;
        }
        Ok(())
    }

    async fn read_stream(&self, stream: &Stream) -> ConnectionResult<Option<Bytes>> {
        match stream.read().await {
            Some(data) => Ok(Some(data)),
            None => {
                if let Some(err) = self.error.lock().expect("channel lock poisoned").clone() {
                    Err(err)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Fails every waiter after a fatal transport error.
    pub(crate) fn notify_error(&self, err: &TransportError) {
        *self.error.lock().expect("channel lock poisoned") =
            Some(ConnectionError::Transport(err.clone()));
        self.open_ev.notify_error(err);
        self.close_ev.notify_error(err);
        for event in self.reqs.lock().expect("channel lock poisoned").drain(..) {
            event.notify_error(err);
        }
        self.stdout.close();
        self.stderr.close();
        self.remote.wake_all();
    }
}

/// Application handle to one channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) core: Arc<ChannelCore>,
}

impl Channel {
    /// The local channel id.
    pub fn id(&self) -> u32 {
        self.core.id()
    }

    /// The channel type name ("session", "direct-tcpip", ...).
    pub fn channel_type(&self) -> &str {
        self.core.channel_type()
    }

    /// The peer's id for this channel.
    pub fn recipient(&self) -> u32 {
        self.core.recipient()
    }

    /// Whether the channel is open and not (half-)closed by us.
    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Remaining credit the peer may send us.
    pub fn local_window_size(&self) -> i64 {
        self.core.local_window_size()
    }

    /// Remaining credit we may send the peer.
    pub fn remote_window_size(&self) -> i64 {
        self.core.remote_window_size()
    }

    /// The peer's maximum packet size for this channel.
    pub fn remote_max_packet(&self) -> u32 {
        self.core.remote_max_packet()
    }

    /// Writes data to the channel, blocking on the remote window.
    pub async fn write(&self, data: &[u8]) -> ConnectionResult<()> {
        self.core.write_data(data, None).await
    }

    /// Writes extended data (stderr) to the channel.
    pub async fn write_extended(&self, code: u32, data: &[u8]) -> ConnectionResult<()> {
        self.core.write_data(data, Some(code)).await
    }

    /// Reads the next data chunk; `None` means EOF.
    pub async fn read(&self) -> ConnectionResult<Option<Bytes>> {
        self.core.read_stream(&self.core.stdout).await
    }

    /// Reads the next stderr chunk; `None` means EOF.
    pub async fn read_stderr(&self) -> ConnectionResult<Option<Bytes>> {
        self.core.read_stream(&self.core.stderr).await
    }

    /// Signals that we will send no more data. Idempotent.
    pub async fn send_eof(&self) -> ConnectionResult<()> {
        self.core.send_eof().await
    }

    /// Closes the channel and waits for the peer's CHANNEL_CLOSE.
    pub async fn close(&self) -> ConnectionResult<()> {
        self.core.close().await
    }

    /// Sends a raw channel request.
    pub async fn request(
        &self,
        rtype: &str,
        want_reply: bool,
        payload: SshBuffer,
    ) -> ConnectionResult<()> {
        self.core.send_request(rtype, want_reply, &payload).await
    }

    /// Requests command execution on a session channel.
    pub async fn request_exec(&self, command: &str) -> ConnectionResult<()> {
        let mut payload = SshBuffer::new();
        payload.put_string(command);
        self.core.send_request("exec", true, &payload).await
    }

    /// Requests an interactive shell on a session channel.
    pub async fn request_shell(&self) -> ConnectionResult<()> {
        self.core.send_request("shell", true, &SshBuffer::new()).await
    }

    /// Requests a subsystem (e.g. "sftp") on a session channel.
    pub async fn request_subsystem(&self, name: &str) -> ConnectionResult<()> {
        let mut payload = SshBuffer::new();
        payload.put_string(name);
        self.core.send_request("subsystem", true, &payload).await
    }

    /// Requests a pseudo-terminal on a session channel.
    pub async fn request_pty(
        &self,
        term: &str,
        columns: u32,
        rows: u32,
        width_px: u32,
        height_px: u32,
    ) -> ConnectionResult<()> {
        let mut payload = SshBuffer::new();
        payload.put_string(term);
        payload.put_u32(columns);
        payload.put_u32(rows);
        payload.put_u32(width_px);
        payload.put_u32(height_px);
        payload.put_bytes(&[0]); // TTY_OP_END, no modes
        self.core.send_request("pty-req", true, &payload).await
    }

    /// How the remote process ended, once reported.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.core.exit_status()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("type", &self.channel_type())
            .field("recipient", &self.recipient())
            .field("open", &self.is_open())
            .finish()
    }
}

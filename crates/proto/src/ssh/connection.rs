//! The `ssh-connection` service (RFC 4254): channel table, channel-open
//! routing, and global requests.
//!
//! The service owns the channel table keyed by local id (smallest free id
//! wins), the FIFO of outstanding global-request replies, and the registry
//! of [`ForwardedChannelOpener`]s for peer-initiated channel opens.
//!
//! Channel-addressed packets are routed to the named channel; a packet for
//! an id that is not in the table is a fatal protocol error - a closed
//! channel is gone, and a well-behaved peer never addresses it again.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use capstan_platform::{
    ConnectionError, ConnectionResult, Event, OpenFailureReason, TransportError, TransportResult,
};
use tracing::{debug, info, warn};

use crate::ssh::buffer::SshBuffer;
use crate::ssh::channel::{Channel, ChannelCore, ChannelKind};
use crate::ssh::message::MessageType;
use crate::ssh::service::Service;
use crate::ssh::transport::Transport;

/// Connection-layer configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Initial local window granted per channel (default 2 MiB).
    pub window_size: u32,
    /// Maximum packet size we accept per channel (default 32 KiB).
    pub max_packet_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            window_size: 2 * 1024 * 1024,
            max_packet_size: 32 * 1024,
        }
    }
}

/// Accepts or rejects peer-initiated channel opens of one channel type.
#[async_trait]
pub trait ForwardedChannelOpener: Send + Sync {
    /// The channel type this opener handles (e.g. "forwarded-tcpip").
    fn channel_type(&self) -> &'static str;

    /// Called off the read pump with the half-constructed channel; the
    /// opener completes the handshake with [`ForwardedChannel::confirm`] or
    /// [`ForwardedChannel::reject`].
    async fn handle_open(&self, channel: ForwardedChannel);
}

pub(crate) struct ConnInner {
    transport: Transport,
    config: ConnectionConfig,
    channels: Mutex<HashMap<u32, Arc<ChannelCore>>>,
    global_replies: Mutex<VecDeque<Event<Option<Vec<u8>>, ConnectionError>>>,
    openers: Mutex<HashMap<&'static str, Arc<dyn ForwardedChannelOpener>>>,
}

impl ConnInner {
    /// Removes a channel from the table once its close handshake is done.
    pub(crate) fn forget(&self, id: u32) {
        if self
            .channels
            .lock()
            .expect("connection lock poisoned")
            .remove(&id)
            .is_some()
        {
            debug!(id, "channel removed from table");
        }
    }
}

/// The `ssh-connection` service. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Creates the service over a connected transport.
    pub fn new(transport: Transport) -> Self {
        Self::with_config(transport, ConnectionConfig::default())
    }

    /// Creates the service with explicit window parameters.
    pub fn with_config(transport: Transport, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                global_replies: Mutex::new(VecDeque::new()),
                openers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers an opener for peer-initiated channels of its type.
    pub fn register_opener(&self, opener: Arc<dyn ForwardedChannelOpener>) {
        let channel_type = opener.channel_type();
        info!(channel_type, "registering forwarded channel opener");
        self.inner
            .openers
            .lock()
            .expect("connection lock poisoned")
            .insert(channel_type, opener);
    }

    /// Opens a session channel.
    pub async fn open_session(&self) -> ConnectionResult<Channel> {
        self.open_channel("session", SshBuffer::new()).await
    }

    /// Opens a direct-tcpip channel through the server.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> ConnectionResult<Channel> {
        let mut data = SshBuffer::new();
        data.put_string(host);
        data.put_u32(port);
        data.put_string(originator_host);
        data.put_u32(originator_port);
        self.open_channel("direct-tcpip", data).await
    }

    /// Opens a channel of an arbitrary type with type-specific data.
    pub async fn open_channel(
        &self,
        channel_type: &str,
        type_specific: SshBuffer,
    ) -> ConnectionResult<Channel> {
        let core = self.new_channel(channel_type, ChannelKind::Direct);
        info!(id = core.id(), channel_type, "opening channel");

        let mut buf = SshBuffer::for_message(MessageType::ChannelOpen);
        buf.put_string(channel_type);
        buf.put_u32(core.id());
        buf.put_u32(self.inner.config.window_size);
        buf.put_u32(self.inner.config.max_packet_size);
        buf.put_buffer(&type_specific);

        if let Err(err) = self.inner.transport.write(buf).await {
            self.inner.forget(core.id());
            return Err(err.into());
        }
        let open = core.open_event();
        if let Err(err) = open.wait(core.timeout()).await {
            self.inner.forget(core.id());
            return Err(err);
        }
        Ok(Channel { core })
    }

    /// Sends a global request; with `want_reply` the reply payload (if any)
    /// is returned once REQUEST_SUCCESS arrives.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: SshBuffer,
    ) -> ConnectionResult<Option<Vec<u8>>> {
        debug!(name, want_reply, "sending global request");
        let mut buf = SshBuffer::for_message(MessageType::GlobalRequest);
        buf.put_string(name);
        buf.put_bool(want_reply);
        buf.put_buffer(&payload);

        let event = if want_reply {
            let event: Event<Option<Vec<u8>>, ConnectionError> = Event::new("global request");
            self.inner
                .global_replies
                .lock()
                .expect("connection lock poisoned")
                .push_back(event.clone());
            Some(event)
        } else {
            None
        };

        self.inner.transport.write(buf).await?;
        match event {
            Some(event) => event.wait(self.inner.transport.timeout()).await,
            None => Ok(None),
        }
    }

    /// Creates a channel core under the smallest free local id.
    fn new_channel(&self, channel_type: &str, kind: ChannelKind) -> Arc<ChannelCore> {
        let mut channels = self.inner.channels.lock().expect("connection lock poisoned");
        let id = (0u32..)
            .find(|id| !channels.contains_key(id))
            .expect("channel id space exhausted");
        let core = Arc::new(ChannelCore::new(
            id,
            channel_type.to_string(),
            kind,
            self.inner.transport.clone(),
            Arc::downgrade(&self.inner),
            self.inner.config.window_size,
            self.inner.config.max_packet_size,
        ));
        channels.insert(id, Arc::clone(&core));
        core
    }

    fn lookup(&self, id: u32) -> TransportResult<Arc<ChannelCore>> {
        self.inner
            .channels
            .lock()
            .expect("connection lock poisoned")
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                TransportError::protocol(format!("packet for unknown channel {}", id))
            })
    }

    /// Handles a peer-initiated CHANNEL_OPEN.
    async fn handle_open(&self, mut buf: SshBuffer) -> TransportResult<()> {
        let channel_type = buf.get_string()?;
        let sender = buf.get_u32()?;
        let window = buf.get_u32()?;
        let max_packet = buf.get_u32()?;
        let type_data = buf.get_raw(buf.available())?;

        let opener = self
            .inner
            .openers
            .lock()
            .expect("connection lock poisoned")
            .get(channel_type.as_str())
            .cloned();
        let Some(opener) = opener else {
            warn!(%channel_type, "no opener for channel type");
            let mut reply = SshBuffer::for_message(MessageType::ChannelOpenFailure);
            reply.put_u32(sender);
            reply.put_u32(OpenFailureReason::UnknownChannelType as u32);
            reply.put_string("unknown channel type");
            reply.put_string("");
            return self.inner.transport.write(reply).await.map(|_| ());
        };

        info!(%channel_type, sender, "peer-initiated channel open");
        let core = self.new_channel(&channel_type, ChannelKind::Forwarded { type_data });
        core.init_forwarded(sender, window, max_packet);
        let forwarded = ForwardedChannel {
            core,
            conn: self.clone(),
        };
        // The opener may block (connecting sockets, prompting); keep it off
        // the read pump.
        tokio::spawn(async move { opener.handle_open(forwarded).await });
        Ok(())
    }
}

#[async_trait]
impl Service for Connection {
    fn name(&self) -> &'static str {
        "ssh-connection"
    }

    fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    async fn handle(&self, seq: u32, msg: MessageType, mut buf: SshBuffer) -> TransportResult<()> {
        match msg {
            MessageType::GlobalRequest => {
                let name = buf.get_string()?;
                let want_reply = buf.get_bool()?;
                warn!(%name, "unknown global request from peer");
                if want_reply {
                    let reply = SshBuffer::for_message(MessageType::RequestFailure);
                    self.inner.transport.write(reply).await?;
                }
                Ok(())
            }
            MessageType::RequestSuccess => {
                let event = self
                    .inner
                    .global_replies
                    .lock()
                    .expect("connection lock poisoned")
                    .pop_front()
                    .ok_or_else(|| {
                        TransportError::protocol(
                            "REQUEST_SUCCESS with no global request outstanding",
                        )
                    })?;
                let data = buf.payload().to_vec();
                event.set(if data.is_empty() { None } else { Some(data) });
                Ok(())
            }
            MessageType::RequestFailure => {
                let event = self
                    .inner
                    .global_replies
                    .lock()
                    .expect("connection lock poisoned")
                    .pop_front()
                    .ok_or_else(|| {
                        TransportError::protocol(
                            "REQUEST_FAILURE with no global request outstanding",
                        )
                    })?;
                event.error(ConnectionError::RequestFailed);
                Ok(())
            }
            MessageType::ChannelOpen => self.handle_open(buf).await,
            MessageType::ChannelOpenConfirmation => {
                let id = buf.get_u32()?;
                self.lookup(id)?.confirm_open(&mut buf)
            }
            MessageType::ChannelOpenFailure => {
                let id = buf.get_u32()?;
                let code = buf.get_u32()?;
                let message = buf.get_string()?;
                let _language = buf.get_string().unwrap_or_default();
                let core = self.lookup(id)?;
                core.fail_open(code, message);
                self.inner.forget(id);
                Ok(())
            }
            MessageType::ChannelWindowAdjust
            | MessageType::ChannelData
            | MessageType::ChannelExtendedData
            | MessageType::ChannelRequest
            | MessageType::ChannelSuccess
            | MessageType::ChannelFailure
            | MessageType::ChannelEof
            | MessageType::ChannelClose => {
                let id = buf.get_u32()?;
                let core = self.lookup(id)?;
                core.handle(seq, msg, buf).await
            }
            _ => {
                warn!(%msg, "unexpected message for ssh-connection");
                self.inner.transport.send_unimplemented(seq).await
            }
        }
    }

    fn notify_error(&self, err: &TransportError) {
        let channels: Vec<_> = self
            .inner
            .channels
            .lock()
            .expect("connection lock poisoned")
            .drain()
            .map(|(_, core)| core)
            .collect();
        for core in channels {
            core.notify_error(err);
        }
        for event in self
            .inner
            .global_replies
            .lock()
            .expect("connection lock poisoned")
            .drain(..)
        {
            event.notify_error(err);
        }
    }
}

/// A peer-initiated channel awaiting accept/reject.
pub struct ForwardedChannel {
    core: Arc<ChannelCore>,
    conn: Connection,
}

impl ForwardedChannel {
    /// The channel type the peer asked to open.
    pub fn channel_type(&self) -> &str {
        self.core.channel_type()
    }

    /// The raw type-specific bytes of the CHANNEL_OPEN (originator address
    /// and port for the tcpip types).
    pub fn type_data(&self) -> Vec<u8> {
        match self.core.kind() {
            ChannelKind::Forwarded { type_data } => type_data.clone(),
            ChannelKind::Direct => Vec::new(),
        }
    }

    /// Accepts the open, completing the handshake.
    pub async fn confirm(self) -> ConnectionResult<Channel> {
        let mut reply = SshBuffer::for_message(MessageType::ChannelOpenConfirmation);
        reply.put_u32(self.core.recipient());
        reply.put_u32(self.core.id());
        reply.put_u32(self.conn.inner.config.window_size);
        reply.put_u32(self.conn.inner.config.max_packet_size);
        self.conn.inner.transport.write(reply).await?;
        self.core.mark_open();
        info!(id = self.core.id(), "forwarded channel confirmed");
        Ok(Channel { core: self.core })
    }

    /// Rejects the open with a reason.
    pub async fn reject(self, code: OpenFailureReason, message: &str) -> ConnectionResult<()> {
        let mut reply = SshBuffer::for_message(MessageType::ChannelOpenFailure);
        reply.put_u32(self.core.recipient());
        reply.put_u32(code as u32);
        reply.put_string(message);
        reply.put_string("");
        self.conn.inner.transport.write(reply).await?;
        self.conn.inner.forget(self.core.id());
        info!(id = self.core.id(), %code, "forwarded channel rejected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.window_size, 2 * 1024 * 1024);
        assert_eq!(config.max_packet_size, 32 * 1024);
    }

    // Channel id allocation, routing, and the close handshake are covered
    // end-to-end by the scripted peer in tests/ssh_integration.rs.
}

//! The service seam between the transport and the SSH sub-protocols.
//!
//! A [`Service`] is an SSH sub-protocol (`ssh-userauth`, `ssh-connection`)
//! multiplexed over the transport. Exactly one service is active at a time;
//! the read pump delivers every non-transport packet to it, strictly in
//! arrival order.

use async_trait::async_trait;
use capstan_platform::{TransportError, TransportResult};
use tracing::warn;

use crate::ssh::buffer::SshBuffer;
use crate::ssh::message::MessageType;
use crate::ssh::transport::Transport;

/// A service running on top of the transport layer.
#[async_trait]
pub trait Service: Send + Sync {
    /// The assigned service name (e.g. "ssh-userauth").
    fn name(&self) -> &'static str;

    /// The transport this service is bound to.
    fn transport(&self) -> &Transport;

    /// Handles one packet delivered by the read pump.
    ///
    /// `seq` is the packet's inbound sequence number, for
    /// SSH_MSG_UNIMPLEMENTED replies. A returned error is fatal for the
    /// whole transport.
    async fn handle(&self, seq: u32, msg: MessageType, buf: SshBuffer) -> TransportResult<()>;

    /// Called when the peer reports SSH_MSG_UNIMPLEMENTED for a packet we
    /// sent with the given sequence number.
    async fn notify_unimplemented(&self, seq: u32) -> TransportResult<()> {
        warn!(seq, "peer could not handle packet");
        Ok(())
    }

    /// Called once when the transport dies; the service fails its
    /// outstanding waiters with the error.
    fn notify_error(&self, err: &TransportError);
}

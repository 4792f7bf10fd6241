//! SSH (Secure Shell) client protocol implementation.
//!
//! This module implements the client side of the SSH protocol according to
//! RFC 4251-4254.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Buffer/Codec** ([`buffer`], [`codec`]) - Binary packet protocol
//!    (RFC 4253 Section 6): framing, encryption, MAC, compression
//! 2. **Transport** ([`transport`], [`kex`], [`proposal`]) - Version exchange,
//!    key exchange and rekeying, packet dispatch (RFC 4253)
//! 3. **Authentication** ([`userauth`]) - The `ssh-userauth` service
//!    (RFC 4252): password, publickey, keyboard-interactive
//! 4. **Connection** ([`connection`], [`channel`]) - The `ssh-connection`
//!    service (RFC 4254): channel multiplexing and flow control
//! 5. **Client** ([`client`]) - High-level facade
//!
//! Cryptographic primitives are supplied through a [`crypto::CryptoProvider`]
//! holding name-keyed factories; the transport never hard-codes an algorithm.
//!
//! # Example
//!
//! ```rust,no_run
//! use capstan_proto::ssh::client::{Client, ClientConfig};
//! use capstan_proto::ssh::hostkey::AcceptAnyHostKey;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect("127.0.0.1:22", ClientConfig::default(),
//!     vec![Arc::new(AcceptAnyHostKey)]).await?;
//! client.auth_password("user", "password").await?;
//! let output = client.execute("ls -la").await?;
//! println!("{}", String::from_utf8_lossy(&output));
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod channel;
pub mod client;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod proposal;
pub mod service;
pub mod transport;
pub mod userauth;
pub mod version;

// Re-export main types
pub use buffer::SshBuffer;
pub use channel::{Channel, ExitStatus};
pub use client::{Client, ClientConfig};
pub use connection::{Connection, ConnectionConfig, ForwardedChannel, ForwardedChannelOpener};
pub use crypto::CryptoProvider;
pub use hostkey::{AcceptAnyHostKey, FingerprintVerifier, HostKeyVerifier, HostPublicKey, Signer};
pub use message::MessageType;
pub use proposal::{NegotiatedAlgorithms, Proposal};
pub use service::Service;
pub use transport::{Transport, TransportConfig, TransportState};
pub use userauth::{AuthMethod, InteractiveAuth, NoneAuth, PasswordAuth, PublicKeyAuth, UserAuth};
pub use version::Version;

//! High-level SSH client facade.
//!
//! Ties the transport, authentication and connection services together for
//! the common case: connect, authenticate, open a session, run a command.
//! Everything the facade does is available on the underlying services for
//! applications that need finer control.
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
//! client.auth_password("alice", "password").await?;
//! let output = client.execute("uname -a").await?;
//! println!("{}", String::from_utf8_lossy(&output));
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use capstan_platform::{CapstanResult, DisconnectReason, TransportError};
use tokio::net::TcpStream;
use tracing::info;

use crate::ssh::channel::Channel;
use crate::ssh::connection::{Connection, ConnectionConfig};
use crate::ssh::crypto::CryptoProvider;
use crate::ssh::hostkey::{HostKeyVerifier, Signer};
use crate::ssh::transport::{Transport, TransportConfig};
use crate::ssh::userauth::{
    AuthMethod, InteractiveAuth, InteractiveCallback, PasswordAuth, PublicKeyAuth, UserAuth,
};

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Transport-layer settings.
    pub transport: TransportConfig,
    /// Connection-layer settings.
    pub connection: ConnectionConfig,
}

/// An SSH client over one TCP connection.
pub struct Client {
    transport: Transport,
    connection: Connection,
    auth: UserAuth,
}

impl Client {
    /// Connects with the default crypto provider, performing the TCP
    /// connect, identification exchange and initial key exchange.
    pub async fn connect(
        addr: &str,
        config: ClientConfig,
        verifiers: Vec<Arc<dyn HostKeyVerifier>>,
    ) -> CapstanResult<Self> {
        Self::connect_with_provider(addr, config, CryptoProvider::default_provider(), verifiers)
            .await
    }

    /// Connects with an explicit crypto provider.
    pub async fn connect_with_provider(
        addr: &str,
        config: ClientConfig,
        provider: Arc<CryptoProvider>,
        verifiers: Vec<Arc<dyn HostKeyVerifier>>,
    ) -> CapstanResult<Self> {
        info!(addr, "connecting");
        let connect_timeout = config
            .transport
            .timeout
            .unwrap_or(Duration::from_secs(30));
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)?;

        let transport =
            Transport::connect(stream, config.transport, provider, verifiers).await?;
        let connection = Connection::with_config(transport.clone(), config.connection);
        let auth = UserAuth::new(transport.clone());
        Ok(Self {
            transport,
            connection,
            auth,
        })
    }

    /// The transport handle.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The connection service handle.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The authentication banner, if the server sent one.
    pub fn banner(&self) -> Option<String> {
        self.auth.banner()
    }

    /// Authenticates with an arbitrary ordered list of methods.
    pub async fn authenticate(
        &self,
        username: &str,
        methods: Vec<Arc<dyn AuthMethod>>,
    ) -> CapstanResult<()> {
        self.auth
            .authenticate(username, Arc::new(self.connection.clone()), methods)
            .await?;
        Ok(())
    }

    /// Authenticates with a password.
    pub async fn auth_password(&self, username: &str, password: &str) -> CapstanResult<()> {
        self.authenticate(username, vec![Arc::new(PasswordAuth::new(password))])
            .await
    }

    /// Authenticates with a public key signer.
    pub async fn auth_publickey(
        &self,
        username: &str,
        signer: Arc<dyn Signer>,
    ) -> CapstanResult<()> {
        self.authenticate(username, vec![Arc::new(PublicKeyAuth::new(signer))])
            .await
    }

    /// Authenticates with keyboard-interactive prompts.
    pub async fn auth_interactive(
        &self,
        username: &str,
        callback: InteractiveCallback,
    ) -> CapstanResult<()> {
        self.authenticate(username, vec![Arc::new(InteractiveAuth::new(callback))])
            .await
    }

    /// Opens a session channel.
    pub async fn open_session(&self) -> CapstanResult<Channel> {
        Ok(self.connection.open_session().await?)
    }

    /// Runs a command and collects its standard output until EOF.
    pub async fn execute(&self, command: &str) -> CapstanResult<Vec<u8>> {
        let channel = self.open_session().await?;
        channel.request_exec(command).await?;

        let mut output = Vec::new();
        while let Some(chunk) = channel.read().await? {
            output.extend_from_slice(&chunk);
        }
        let _ = channel.close().await;
        Ok(output)
    }

    /// Initiates a re-key and waits for it to complete.
    pub async fn rekey(&self) -> CapstanResult<()> {
        Ok(self.transport.rekey().await?)
    }

    /// Sends a keep-alive (SSH_MSG_IGNORE).
    pub async fn send_keepalive(&self) -> CapstanResult<()> {
        Ok(self.transport.send_keepalive().await?)
    }

    /// Disconnects cleanly. Idempotent.
    pub async fn disconnect(&self) {
        self.transport
            .disconnect(DisconnectReason::ByApplication, "disconnected by user")
            .await;
    }
}

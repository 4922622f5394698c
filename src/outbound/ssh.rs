//! SSH tunnel dialer
//!
//! One authenticated SSH session is shared by every dial; each dial opens
//! its own `direct-tcpip` channel multiplexed over that session. The session
//! transport is obtained from a parent [`Dialer`], so the SSH server may
//! itself sit behind a SOCKS5 proxy or another SSH hop.
//!
//! Host keys are accepted without verification. Trust in jump hosts is
//! established by the operator when the proxy is configured.

use super::{DirectDialer, Dialer, ProxyConnection, ProxyType};
use crate::common::net::{join_host_port, split_host_port};
use crate::common::{DialContext, Network};
use crate::config::DEFAULT_HANDSHAKE_TIMEOUT_SECS;
use crate::{Error, Result};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Established SSH session able to open forwarding channels
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Open a `direct-tcpip` channel to `host:port` on the server side.
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Box<dyn ProxyConnection>>;

    /// Whether the underlying transport has gone away.
    fn is_closed(&self) -> bool;

    /// Tear the session down. Channels opened from it stop working.
    async fn disconnect(&self) -> Result<()>;
}

/// russh client callbacks
pub struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// [`SshSession`] backed by a russh client handle
pub struct RusshSession {
    handle: Handle<ClientHandler>,
}

impl RusshSession {
    /// Run the SSH handshake over `stream` and authenticate with a password.
    pub async fn establish(
        stream: Box<dyn ProxyConnection>,
        username: &str,
        password: &str,
    ) -> Result<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let mut handle = client::connect_stream(config, stream, ClientHandler).await?;

        let authenticated = handle.authenticate_password(username, password).await?;
        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "authentication failed", "en")
                .await;
            return Err(Error::auth(format!(
                "SSH password rejected for user {}",
                username
            )));
        }

        Ok(RusshSession { handle })
    }
}

#[async_trait]
impl SshSession for RusshSession {
    async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Box<dyn ProxyConnection>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "0.0.0.0", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// SSH jump-host tunnel
///
/// `Disconnected -> Connected -> Disconnected`. Connecting while connected
/// first drops the stale session. Dials share the read lock; connect and
/// close take the write lock.
pub struct SshTunnel {
    name: String,
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
    session: RwLock<Option<Arc<dyn SshSession>>>,
}

impl SshTunnel {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        SshTunnel {
            name: name.into(),
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            session: RwLock::new(None),
        }
    }

    /// Bound for reaching the server plus the SSH handshake and auth.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `host:port` of the SSH server
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// Connect straight to the SSH server.
    pub async fn connect(&self, ctx: &DialContext) -> Result<()> {
        self.connect_with_dialer(ctx, &DirectDialer::new()).await
    }

    /// Connect to the SSH server through `parent`.
    pub async fn connect_with_dialer(&self, ctx: &DialContext, parent: &dyn Dialer) -> Result<()> {
        let address = self.address();
        let mut guard = self.session.write().await;

        if let Some(stale) = guard.take() {
            debug!("[{}] Dropping stale SSH session to {}", self.name, address);
            if let Err(e) = stale.disconnect().await {
                debug!("[{}] Stale session disconnect failed: {}", self.name, e);
            }
        }

        let establish = async {
            let stream = parent.dial(ctx, "tcp", &address).await?;
            RusshSession::establish(stream, &self.username, &self.password).await
        };

        let session = ctx
            .run(self.timeout, "SSH connect", establish)
            .await
            .map_err(|e| e.context(format!("SSH connect to {} failed", address)))?;

        info!(
            "[{}] SSH session established to {} via {}",
            self.name,
            address,
            parent.name()
        );
        *guard = Some(Arc::new(session));
        Ok(())
    }

    /// Adopt an already-established session, replacing any current one.
    pub async fn attach(&self, session: Arc<dyn SshSession>) {
        let previous = self.session.write().await.replace(session);
        if let Some(stale) = previous {
            let _ = stale.disconnect().await;
        }
    }

    /// Close the session. Closing a disconnected tunnel is a no-op.
    pub async fn close(&self) -> Result<()> {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            info!("[{}] Closing SSH session to {}", self.name, self.address());
            session.disconnect().await?;
        }
        Ok(())
    }

    /// Whether a live session is held. Reports `false` while a connect is in progress.
    pub fn is_connected(&self) -> bool {
        match self.session.try_read() {
            Ok(guard) => guard.as_ref().is_some_and(|s| !s.is_closed()),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Dialer for SshTunnel {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Ssh
    }

    async fn dial(
        &self,
        ctx: &DialContext,
        network: &str,
        address: &str,
    ) -> Result<Box<dyn ProxyConnection>> {
        Network::try_from(network)?;
        let (host, port) = split_host_port(address)?;

        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::not_connected(self.address()))?;
        if session.is_closed() {
            warn!("[{}] SSH session to {} has gone away", self.name, self.address());
            return Err(Error::not_connected(self.address()));
        }

        debug!(
            "[{}] Opening SSH channel to {} via {}",
            self.name,
            address,
            self.address()
        );

        ctx.run(
            self.timeout,
            "SSH channel open",
            session.open_direct_tcpip(&host, port),
        )
        .await
    }
}

//! SOCKS5 client dialer
//!
//! Implements the CONNECT subset of RFC 1928 with optional RFC 1929
//! username/password authentication. The proxy server itself is reached
//! either directly or through a parent [`Dialer`], so a SOCKS5 hop can sit
//! anywhere in a chain.

use super::{DirectDialer, Dialer, ProxyConnection, ProxyType};
use crate::common::net::{join_host_port, split_host_port};
use crate::common::socks::{
    encode_connect_request, encode_greeting, encode_password_auth, read_auth_status,
    read_connect_reply, read_method_selection, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH,
    AUTH_USERNAME_PASSWORD,
};
use crate::common::{DialContext, Network};
use crate::config::{DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_TEST_TARGET};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 proxy client. Holds configuration only; every dial is independent.
pub struct Socks5Client {
    name: String,
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    parent: Option<Arc<dyn Dialer>>,
    timeout: Duration,
}

impl Socks5Client {
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Socks5Client {
            name: name.into(),
            server: server.into(),
            port,
            username: None,
            password: None,
            parent: None,
            timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }

    /// Offer username/password authentication. Empty usernames are ignored.
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password;
        self
    }

    /// Reach the SOCKS5 server through `parent` instead of a direct TCP dial.
    pub fn with_parent(mut self, parent: Arc<dyn Dialer>) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Bound for connecting to the server plus the whole handshake.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn server_address(&self) -> String {
        join_host_port(&self.server, self.port)
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    fn has_credentials(&self) -> bool {
        self.username.is_some()
    }

    /// Perform SOCKS5 handshake and connect
    pub(crate) async fn socks5_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
    ) -> Result<()> {
        // Reject oversized targets before anything goes on the wire.
        let request = encode_connect_request(host, port)?;

        // Step 1: method negotiation
        let greeting = encode_greeting(self.has_credentials());
        stream.write_all(&greeting).await?;

        let method = read_method_selection(stream).await?;

        // Step 2: authenticate if the server asks for it
        match method {
            AUTH_NO_AUTH => {
                debug!("[{}] No authentication required", self.name);
            }
            AUTH_USERNAME_PASSWORD => {
                debug!("[{}] Using password authentication", self.name);
                self.authenticate_password(stream).await?;
            }
            AUTH_NO_ACCEPTABLE => {
                return Err(Error::auth("no acceptable authentication method"));
            }
            other => {
                return Err(Error::protocol(format!(
                    "server selected unsupported authentication method {:#04x}",
                    other
                )));
            }
        }

        // Step 3: CONNECT
        stream.write_all(&request).await?;

        // Step 4: reply, including the bound address
        let (bound, bound_port) = read_connect_reply(stream).await?;

        debug!(
            "[{}] SOCKS5 connected to {} (bound {}:{})",
            self.name,
            join_host_port(host, port),
            bound,
            bound_port
        );
        Ok(())
    }

    /// Perform password authentication
    async fn authenticate_password<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
    ) -> Result<()> {
        let username = self
            .username
            .as_deref()
            .ok_or_else(|| Error::auth("server requires credentials but none are configured"))?;
        let password = self.password.as_deref().unwrap_or_default();

        let request = encode_password_auth(username, password)?;
        stream.write_all(&request).await?;
        read_auth_status(stream).await?;

        debug!("[{}] Password authentication successful", self.name);
        Ok(())
    }

    /// Validate reachability by dialing the default test target.
    pub async fn test_connection(&self, ctx: &DialContext) -> Result<()> {
        self.test_connection_with_target(ctx, DEFAULT_TEST_TARGET).await
    }

    /// Validate reachability by dialing `target` and closing the stream at once.
    pub async fn test_connection_with_target(&self, ctx: &DialContext, target: &str) -> Result<()> {
        let mut conn = self.dial(ctx, "tcp", target).await?;
        let _ = conn.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl Dialer for Socks5Client {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Socks5
    }

    async fn dial(
        &self,
        ctx: &DialContext,
        network: &str,
        address: &str,
    ) -> Result<Box<dyn ProxyConnection>> {
        Network::try_from(network)?;
        let (target_host, target_port) = split_host_port(address)?;
        let server_addr = self.server_address();

        debug!(
            "[{}] SOCKS5 proxy connecting to {} via {}",
            self.name, address, server_addr
        );

        let handshake = async {
            let mut stream: Box<dyn ProxyConnection> = match &self.parent {
                Some(parent) => parent.dial(ctx, "tcp", &server_addr).await,
                None => DirectDialer::new().dial(ctx, "tcp", &server_addr).await,
            }
            .map_err(|e| e.context("connect to SOCKS5 proxy failed"))?;

            self.socks5_connect(&mut stream, &target_host, target_port)
                .await
                .map_err(|e| e.context("SOCKS5 handshake failed"))?;

            Ok(stream)
        };

        ctx.run(self.timeout, "SOCKS5 handshake", handshake).await
    }
}

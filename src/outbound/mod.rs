//! Outbound dialers
//!
//! Every hop implements [`Dialer`]. A hop that is itself reached through
//! another hop holds that upstream as an `Arc<dyn Dialer>`, which is how
//! chains of arbitrary depth are composed:
//!
//! ```text
//! caller -> SshTunnel --(parent)--> Socks5Client --(parent)--> DirectDialer -> network
//! ```

mod direct;
mod socks5;
mod ssh;

pub use direct::DirectDialer;
pub use socks5::Socks5Client;
pub use ssh::{ClientHandler, RusshSession, SshSession, SshTunnel};

#[cfg(test)]
pub(crate) use ssh::mock as ssh_mock;

use crate::common::DialContext;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Proxy type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Direct,
    Ssh,
    #[serde(alias = "socks")]
    Socks5,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Direct => write!(f, "Direct"),
            ProxyType::Ssh => write!(f, "SSH"),
            ProxyType::Socks5 => write!(f, "SOCKS5"),
        }
    }
}

impl TryFrom<&str> for ProxyType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ProxyType::Direct),
            "ssh" => Ok(ProxyType::Ssh),
            "socks5" | "socks" => Ok(ProxyType::Socks5),
            _ => Err(Error::config(format!("Unknown proxy type: {}", s))),
        }
    }
}

/// Capability to open a byte stream to `host:port`
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Get dialer name
    fn name(&self) -> &str;

    /// Get proxy type
    fn proxy_type(&self) -> ProxyType;

    /// Open a connection to `address` over a stream `network` ("tcp", "tcp4", "tcp6").
    ///
    /// On success the stream is fully negotiated and carries only
    /// application bytes. On failure nothing is left open.
    async fn dial(
        &self,
        ctx: &DialContext,
        network: &str,
        address: &str,
    ) -> Result<Box<dyn ProxyConnection>>;
}

/// Trait for proxy connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyConnection for T {}

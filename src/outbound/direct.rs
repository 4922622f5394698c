//! Direct dialer (no proxy)

use super::{Dialer, ProxyConnection, ProxyType};
use crate::common::net::{configure_tcp_stream, split_host_port};
use crate::common::{DialContext, Network};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Opens plain TCP connections; terminates every chain.
pub struct DirectDialer {
    name: String,
}

impl DirectDialer {
    pub fn new() -> Self {
        DirectDialer {
            name: "DIRECT".to_string(),
        }
    }

    /// Connect to `address`, honoring the network family and the context token.
    ///
    /// No timeout is imposed beyond the context deadline; the OS connect
    /// timeout applies otherwise.
    pub async fn connect(
        &self,
        ctx: &DialContext,
        network: Network,
        address: &str,
    ) -> Result<TcpStream> {
        let (host, port) = split_host_port(address)?;

        let resolve_and_connect = async {
            let addrs: Vec<SocketAddr> = lookup_host((host.as_str(), port))
                .await
                .map_err(|e| Error::from_connect(address, e))?
                .filter(|a| match network {
                    Network::Tcp => true,
                    Network::Tcp4 => a.is_ipv4(),
                    Network::Tcp6 => a.is_ipv6(),
                })
                .collect();

            if addrs.is_empty() {
                return Err(Error::address(format!(
                    "no {} address found for {}",
                    network, address
                )));
            }

            let mut last_err = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => {
                        debug!("Direct connect to {} failed: {}", addr, e);
                        last_err = Some(e);
                    }
                }
            }
            Err(match last_err {
                Some(e) => Error::from_connect(address, e),
                None => Error::connection(format!("failed to connect to {}", address)),
            })
        };

        let what = format!("connect to {}", address);
        let stream = ctx.run_unbounded(&what, resolve_and_connect).await?;

        configure_tcp_stream(&stream);
        Ok(stream)
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Direct
    }

    async fn dial(
        &self,
        ctx: &DialContext,
        network: &str,
        address: &str,
    ) -> Result<Box<dyn ProxyConnection>> {
        let network = Network::try_from(network)?;
        debug!("Direct connecting to {}", address);

        let stream = self.connect(ctx, network, address).await?;

        debug!("Direct connected to {}", address);
        Ok(Box::new(stream))
    }
}

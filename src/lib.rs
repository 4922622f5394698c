//! Proxy Chain - chained SSH / SOCKS5 dialing
//!
//! Lets a monitoring backend reach devices that are not routable from the
//! server by tunneling TCP through one or more hops:
//! - Uniform [`Dialer`] capability (`dial(network, address)`)
//! - Direct TCP, SSH `direct-tcpip` channels, SOCKS5 CONNECT
//! - Recursive parent-chain resolution with per-proxy SSH session caching
//! - Cancellation and deadlines threaded through every hop
//!
//! # Architecture
//!
//! ```text
//!            +-----------------+
//!            |    manager/     |   get_dialer / test_proxy / close
//!            +--------+--------+
//!                     |
//!        +------------+------------+
//!        |                         |
//! +------v------+          +-------v-------+
//! |   config/   |          |   outbound/   |
//! | (repository)|          | direct / ssh  |
//! +-------------+          |   / socks5    |
//!                          +-------+-------+
//!                                  |
//!                          +-------v-------+
//!                          |    common/    |
//!                          | socks codec,  |
//!                          | net, context  |
//!                          +---------------+
//! ```

pub mod common;
pub mod config;
pub mod manager;
pub mod outbound;

pub use common::error::{Error, Result};
pub use common::DialContext;
pub use config::{Config, ProxyConfig, ProxyId, ProxyRepository};
pub use manager::ProxyManager;
pub use outbound::{Dialer, DirectDialer, ProxyConnection, Socks5Client, SshTunnel};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

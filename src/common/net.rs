//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;

use super::socks::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

/// Longest domain name a SOCKS5 request can carry (one length byte).
pub const MAX_DOMAIN_LEN: usize = 255;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Stream networks accepted by every dialer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Tcp4 => write!(f, "tcp4"),
            Network::Tcp6 => write!(f, "tcp6"),
        }
    }
}

impl TryFrom<&str> for Network {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(Error::unsupported(format!(
                "network {:?} is not a stream network",
                other
            ))),
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals (`[::1]:22`).
pub fn split_host_port(address: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::address(format!("missing ']' in {}", address)))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| Error::address(format!("missing port in {}", address)))?;
        (&rest[..end], port)
    } else {
        let idx = address
            .rfind(':')
            .ok_or_else(|| Error::address(format!("missing port in {}", address)))?;
        let host = &address[..idx];
        if host.contains(':') {
            return Err(Error::address(format!(
                "IPv6 address must be bracketed: {}",
                address
            )));
        }
        (host, &address[idx + 1..])
    };

    if host.is_empty() {
        return Err(Error::address(format!("missing host in {}", address)));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::address(format!("invalid port in {}", address)))?;

    Ok((host.to_string(), port))
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// SOCKS5 address type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Read `ATYP | ADDR | PORT` in SOCKS5 format, consuming exactly those bytes.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Self, u16)> {
        let mut atyp = [0u8; 1];
        reader.read_exact(&mut atyp).await?;

        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let addr = Address::Ipv4(Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]));
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok((addr, port))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                reader.read_exact(&mut len).await?;
                let len = len[0] as usize;
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let domain = String::from_utf8(buf[..len].to_vec())
                    .map_err(|e| Error::protocol(format!("Invalid domain: {}", e)))?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                Ok((Address::Domain(domain), port))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[..16]);
                let addr = Address::Ipv6(Ipv6Addr::from(ip));
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok((addr, port))
            }
            t => Err(Error::protocol(format!("Unknown address type: {}", t))),
        }
    }

    /// Append `ATYP | ADDR | PORT` to `buf`. Nothing is appended on error.
    pub fn encode_into(&self, buf: &mut Vec<u8>, port: u16) -> Result<()> {
        match self {
            Address::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let bytes = domain.as_bytes();
                if bytes.len() > MAX_DOMAIN_LEN {
                    return Err(Error::address(format!(
                        "domain name too long ({} bytes)",
                        bytes.len()
                    )));
                }
                buf.push(ATYP_DOMAIN);
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&port.to_be_bytes());
        Ok(())
    }

    /// Get bytes length
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 1 + 4 + 2,             // atyp + ip + port
            Address::Ipv6(_) => 1 + 16 + 2,            // atyp + ip + port
            Address::Domain(d) => 1 + 1 + d.len() + 2, // atyp + len + domain + port
        }
    }
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Address::Ipv4(ip);
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Address::Ipv6(ip);
        }
        Address::Domain(host.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Ipv6(ip) => write!(f, "{}", ip),
            Address::Domain(d) => write!(f, "{}", d),
        }
    }
}

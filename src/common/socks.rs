//! SOCKS5 client-side wire codec (RFC 1928 CONNECT subset, RFC 1929 auth)

use super::net::Address;
use crate::{Error, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// Username/password sub-negotiation version
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

// SOCKS5 commands
pub const CMD_CONNECT: u8 = 0x01;

// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// SOCKS5 reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl From<u8> for ReplyCode {
    fn from(code: u8) -> Self {
        match code {
            REP_SUCCEEDED => ReplyCode::Succeeded,
            REP_GENERAL_FAILURE => ReplyCode::GeneralFailure,
            REP_CONNECTION_NOT_ALLOWED => ReplyCode::ConnectionNotAllowed,
            REP_NETWORK_UNREACHABLE => ReplyCode::NetworkUnreachable,
            REP_HOST_UNREACHABLE => ReplyCode::HostUnreachable,
            REP_CONNECTION_REFUSED => ReplyCode::ConnectionRefused,
            REP_TTL_EXPIRED => ReplyCode::TtlExpired,
            REP_COMMAND_NOT_SUPPORTED => ReplyCode::CommandNotSupported,
            REP_ADDRESS_TYPE_NOT_SUPPORTED => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Unknown(other),
        }
    }
}

impl ReplyCode {
    pub fn message(&self) -> String {
        match self {
            ReplyCode::Succeeded => "succeeded".to_string(),
            ReplyCode::GeneralFailure => "general SOCKS server failure".to_string(),
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset".to_string(),
            ReplyCode::NetworkUnreachable => "network unreachable".to_string(),
            ReplyCode::HostUnreachable => "host unreachable".to_string(),
            ReplyCode::ConnectionRefused => "connection refused".to_string(),
            ReplyCode::TtlExpired => "TTL expired".to_string(),
            ReplyCode::CommandNotSupported => "command not supported".to_string(),
            ReplyCode::AddressTypeNotSupported => "address type not supported".to_string(),
            ReplyCode::Unknown(code) => format!("unknown error (code {:#04x})", code),
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Convert reply code to error message
pub fn reply_error_message(code: u8) -> String {
    ReplyCode::from(code).message()
}

/// Method-selection greeting. Username/password is offered only with credentials.
pub fn encode_greeting(with_credentials: bool) -> Vec<u8> {
    if with_credentials {
        vec![SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD]
    } else {
        vec![SOCKS5_VERSION, 1, AUTH_NO_AUTH]
    }
}

/// RFC 1929 username/password request
pub fn encode_password_auth(username: &str, password: &str) -> Result<Vec<u8>> {
    if username.len() > 255 || password.len() > 255 {
        return Err(Error::auth("username or password too long"));
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    Ok(request)
}

/// `VER | CMD=CONNECT | RSV | ATYP | DST.ADDR | DST.PORT`
pub fn encode_connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
    let address = Address::from(host);
    let mut request = Vec::with_capacity(3 + address.len());
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
    address.encode_into(&mut request, port)?;
    Ok(request)
}

/// Read the server's method choice.
pub async fn read_method_selection<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let mut response = [0u8; 2];
    reader.read_exact(&mut response).await?;

    if response[0] != SOCKS5_VERSION {
        return Err(Error::protocol(format!(
            "unexpected SOCKS version {} in method selection",
            response[0]
        )));
    }
    Ok(response[1])
}

/// Read the username/password sub-negotiation status.
pub async fn read_auth_status<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut response = [0u8; 2];
    reader.read_exact(&mut response).await?;

    // Some servers echo 0x05 instead of the sub-negotiation version; only the status matters.
    if response[1] != 0x00 {
        return Err(Error::auth("username or password incorrect"));
    }
    Ok(())
}

/// Read the CONNECT reply, consuming the bound address so the stream is
/// left aligned on the first application byte.
pub async fn read_connect_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(Address, u16)> {
    let mut head = [0u8; 3];
    reader.read_exact(&mut head).await?;

    if head[0] != SOCKS5_VERSION {
        return Err(Error::protocol(format!(
            "unexpected SOCKS version {} in reply",
            head[0]
        )));
    }

    let code = ReplyCode::from(head[1]);
    if code != ReplyCode::Succeeded {
        return Err(Error::Socks5(code));
    }

    Address::read_from(reader).await
}

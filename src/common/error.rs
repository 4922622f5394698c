//! Error types for the dialing subsystem
//!
//! Transport failures are classified into typed variants at the call site
//! that observed them (see [`Error::from_connect`]), so callers can match on
//! `ConnectionRefused`, `Timeout`, `Auth` and friends instead of parsing text.

use super::socks::ReplyCode;
use crate::config::ProxyId;
use std::io;
use thiserror::Error;

/// Dialer error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration error: proxy {0} not found")]
    ProxyNotFound(ProxyId),

    #[error("Configuration error: proxy {0} is disabled")]
    ProxyDisabled(ProxyId),

    #[error("Configuration error: cycle detected in proxy chain {}", format_chain(.0))]
    CycleDetected(Vec<ProxyId>),

    #[error("Configuration error: proxy chain deeper than {0} hops")]
    ChainTooDeep(usize),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("SOCKS5 request failed: {0}")]
    Socks5(ReplyCode),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("tunnel not connected: {0}")]
    NotConnected(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("proxy manager has been shut down")]
    Shutdown,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

fn format_chain(chain: &[ProxyId]) -> String {
    chain
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Auth(msg.into())
    }

    pub fn ssh<S: Into<String>>(msg: S) -> Self {
        Error::Ssh(msg.into())
    }

    pub fn not_connected<S: Into<String>>(msg: S) -> Self {
        Error::NotConnected(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Classify an I/O error raised while establishing a connection to `target`.
    pub fn from_connect(target: &str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(target.to_string()),
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
                Error::NetworkUnreachable(target.to_string())
            }
            io::ErrorKind::TimedOut => Error::Timeout(format!("connect to {}", target)),
            _ => Error::Connection(format!("failed to connect to {}: {}", target, e)),
        }
    }

    /// Wrap this error with a description of the hop that failed.
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping every `Context` layer.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether the failure comes from configuration rather than the network.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::Config(_)
                | Error::ProxyNotFound(_)
                | Error::ProxyDisabled(_)
                | Error::CycleDetected(_)
                | Error::ChainTooDeep(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<russh::Error> for Error {
    fn from(e: russh::Error) -> Self {
        match e {
            russh::Error::IO(io) => Error::Io(io),
            other => Error::Ssh(other.to_string()),
        }
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

//! Configuration module

mod repository;

pub use repository::{MemoryRepository, ProxyRepository};

use crate::common::net::join_host_port;
use crate::outbound::ProxyType;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Proxy identifier. `0` is reserved and means "no proxy".
pub type ProxyId = u64;

/// Sentinel id meaning "connect directly".
pub const DIRECT_PROXY_ID: ProxyId = 0;

/// Default handshake / connect bound in seconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Largest accepted handshake bound in seconds
pub const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 3600;

/// Default cap on parent-chain length
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 8;

/// Default target used to validate reachability through a proxy
pub const DEFAULT_TEST_TARGET: &str = "8.8.8.8:53";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Dialer tuning
    pub dialer: DialerSettings,

    /// Proxy definitions
    pub proxies: Vec<ProxyConfig>,
}

impl Config {
    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.dialer.validate()?;

        let mut by_id: HashMap<ProxyId, &ProxyConfig> = HashMap::new();
        for proxy in &self.proxies {
            proxy.validate()?;
            if by_id.insert(proxy.id, proxy).is_some() {
                return Err(Error::config(format!("duplicate proxy id {}", proxy.id)));
            }
        }

        // Parent references must exist and chains must terminate.
        for proxy in &self.proxies {
            let mut seen = vec![proxy.id];
            let mut current = proxy.parent();
            while let Some(parent_id) = current {
                let parent = by_id.get(&parent_id).ok_or_else(|| {
                    Error::config(format!(
                        "proxy {} references missing parent {}",
                        proxy.id, parent_id
                    ))
                })?;
                if seen.contains(&parent_id) {
                    seen.push(parent_id);
                    return Err(Error::CycleDetected(seen));
                }
                seen.push(parent_id);
                if seen.len() > self.dialer.max_chain_depth {
                    return Err(Error::ChainTooDeep(self.dialer.max_chain_depth));
                }
                current = parent.parent();
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: Some("info".to_string()),
            dialer: DialerSettings::default(),
            proxies: Vec::new(),
        }
    }
}

/// Dialer tuning shared by every hop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerSettings {
    /// Handshake / connect bound, in seconds
    #[serde(rename = "handshake-timeout")]
    pub handshake_timeout_secs: u64,

    /// Maximum number of hops in a parent chain
    #[serde(rename = "max-chain-depth")]
    pub max_chain_depth: usize,

    /// Address dialed by proxy tests
    #[serde(rename = "test-target")]
    pub test_target: String,
}

impl DialerSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_secs == 0 {
            return Err(Error::config("handshake-timeout must be positive"));
        }
        if self.handshake_timeout_secs > MAX_HANDSHAKE_TIMEOUT_SECS {
            return Err(Error::config(format!(
                "handshake-timeout must be at most {} seconds",
                MAX_HANDSHAKE_TIMEOUT_SECS
            )));
        }
        if self.max_chain_depth == 0 {
            return Err(Error::config("max-chain-depth must be positive"));
        }
        crate::common::net::split_host_port(&self.test_target)
            .map_err(|e| Error::config(format!("invalid test-target: {}", e)))?;
        Ok(())
    }
}

impl Default for DialerSettings {
    fn default() -> Self {
        DialerSettings {
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
            test_target: DEFAULT_TEST_TARGET.to_string(),
        }
    }
}

/// Last observed health of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Unknown,
    Connected,
    Error,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyStatus::Unknown => write!(f, "unknown"),
            ProxyStatus::Connected => write!(f, "connected"),
            ProxyStatus::Error => write!(f, "error"),
        }
    }
}

/// Persisted proxy record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub id: ProxyId,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub proxy_type: ProxyType,

    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Upstream proxy this hop is reached through
    #[serde(default, rename = "parent-proxy-id")]
    pub parent_proxy_id: Option<ProxyId>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub status: ProxyStatus,

    #[serde(default, rename = "last-error", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, rename = "last-checked-at", skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl ProxyConfig {
    pub fn new(id: ProxyId, proxy_type: ProxyType, host: impl Into<String>, port: u16) -> Self {
        ProxyConfig {
            id,
            name: String::new(),
            proxy_type,
            host: host.into(),
            port,
            username: None,
            password: None,
            parent_proxy_id: None,
            enabled: true,
            status: ProxyStatus::Unknown,
            last_error: None,
            last_checked_at: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_parent(mut self, parent: ProxyId) -> Self {
        self.parent_proxy_id = Some(parent);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Parent id, with the `0` sentinel folded into `None`
    pub fn parent(&self) -> Option<ProxyId> {
        self.parent_proxy_id.filter(|id| *id != DIRECT_PROXY_ID)
    }

    /// `host:port` of the proxy server itself
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }

    /// Display label used in logs
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("proxy-{}", self.id)
        } else {
            self.name.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == DIRECT_PROXY_ID {
            return Err(Error::config("proxy id 0 is reserved for direct connections"));
        }
        if self.host.is_empty() {
            return Err(Error::config(format!("proxy {}: missing host", self.id)));
        }
        if self.port == 0 {
            return Err(Error::config(format!("proxy {}: missing port", self.id)));
        }
        if self.parent() == Some(self.id) {
            return Err(Error::CycleDetected(vec![self.id, self.id]));
        }

        match self.proxy_type {
            ProxyType::Ssh => {
                if self.username.as_deref().unwrap_or_default().is_empty() {
                    return Err(Error::config(format!(
                        "proxy {}: SSH requires a username",
                        self.id
                    )));
                }
            }
            ProxyType::Socks5 => {
                let too_long = |s: &Option<String>| s.as_ref().is_some_and(|v| v.len() > 255);
                if too_long(&self.username) || too_long(&self.password) {
                    return Err(Error::config(format!(
                        "proxy {}: SOCKS5 credentials are limited to 255 bytes",
                        self.id
                    )));
                }
            }
            ProxyType::Direct => {
                return Err(Error::config(format!(
                    "proxy {}: type direct cannot be configured, use parent id 0",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

//! Proxy configuration repository
//!
//! Persistence lives outside this crate; the manager depends only on the
//! [`ProxyRepository`] trait. [`MemoryRepository`] backs the CLI and tests.

use super::{Config, ProxyConfig, ProxyId, ProxyStatus, DIRECT_PROXY_ID};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Storage contract for proxy records
#[async_trait]
pub trait ProxyRepository: Send + Sync {
    /// Load one record; missing ids yield [`Error::ProxyNotFound`].
    async fn get_by_id(&self, id: ProxyId) -> Result<ProxyConfig>;

    /// All records, ordered by id
    async fn list(&self) -> Result<Vec<ProxyConfig>>;

    /// Insert or replace a record
    async fn save(&self, proxy: ProxyConfig) -> Result<()>;

    /// Remove a record
    async fn delete(&self, id: ProxyId) -> Result<()>;

    /// Record the outcome of a reachability test
    async fn update_status(
        &self,
        id: ProxyId,
        status: ProxyStatus,
        last_error: Option<String>,
    ) -> Result<()>;
}

/// In-memory repository
#[derive(Default)]
pub struct MemoryRepository {
    proxies: RwLock<HashMap<ProxyId, ProxyConfig>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let proxies = config
            .proxies
            .iter()
            .map(|p| (p.id, p.clone()))
            .collect();
        MemoryRepository {
            proxies: RwLock::new(proxies),
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }
}

#[async_trait]
impl ProxyRepository for MemoryRepository {
    async fn get_by_id(&self, id: ProxyId) -> Result<ProxyConfig> {
        self.proxies
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::ProxyNotFound(id))
    }

    async fn list(&self) -> Result<Vec<ProxyConfig>> {
        let mut all: Vec<ProxyConfig> = self.proxies.read().values().cloned().collect();
        all.sort_by_key(|p| p.id);
        Ok(all)
    }

    async fn save(&self, proxy: ProxyConfig) -> Result<()> {
        if proxy.id == DIRECT_PROXY_ID {
            return Err(Error::config("proxy id 0 is reserved for direct connections"));
        }
        self.proxies.write().insert(proxy.id, proxy);
        Ok(())
    }

    async fn delete(&self, id: ProxyId) -> Result<()> {
        self.proxies
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::ProxyNotFound(id))
    }

    async fn update_status(
        &self,
        id: ProxyId,
        status: ProxyStatus,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut proxies = self.proxies.write();
        let proxy = proxies.get_mut(&id).ok_or(Error::ProxyNotFound(id))?;
        proxy.status = status;
        proxy.last_error = last_error;
        proxy.last_checked_at = Some(Utc::now());
        Ok(())
    }
}

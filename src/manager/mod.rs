//! Proxy manager
//!
//! Resolves a proxy id into a ready [`Dialer`], walking the parent chain
//! recursively so each hop is built on top of the dialer for its parent.
//! Live SSH sessions are cached per id and reused by later dials; SOCKS5
//! hops keep no session, so only their client configuration is cached.

use crate::common::DialContext;
use crate::config::{DialerSettings, ProxyConfig, ProxyId, ProxyRepository, ProxyStatus, DIRECT_PROXY_ID};
use crate::outbound::{Dialer, DirectDialer, ProxyType, Socks5Client, SshTunnel};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Cache {
    tunnels: HashMap<ProxyId, Arc<SshTunnel>>,
    socks: HashMap<ProxyId, Arc<Socks5Client>>,
}

/// Owner of every cached tunnel. Call [`ProxyManager::shutdown`] before exit.
pub struct ProxyManager {
    repo: Arc<dyn ProxyRepository>,
    settings: DialerSettings,
    direct: Arc<DirectDialer>,
    cache: Mutex<Cache>,
    shut_down: AtomicBool,
}

impl ProxyManager {
    pub fn new(repo: Arc<dyn ProxyRepository>, settings: DialerSettings) -> Self {
        ProxyManager {
            repo,
            settings,
            direct: Arc::new(DirectDialer::new()),
            cache: Mutex::new(Cache::default()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Dialer for `id`. Id `0` yields the direct dialer.
    pub async fn get_dialer(&self, ctx: &DialContext, id: ProxyId) -> Result<Arc<dyn Dialer>> {
        let mut visited = Vec::new();
        self.resolve(ctx, id, &mut visited).await
    }

    fn resolve<'a>(
        &'a self,
        ctx: &'a DialContext,
        id: ProxyId,
        visited: &'a mut Vec<ProxyId>,
    ) -> BoxFuture<'a, Result<Arc<dyn Dialer>>> {
        async move {
            if self.shut_down.load(Ordering::Acquire) {
                return Err(Error::Shutdown);
            }
            if id == DIRECT_PROXY_ID {
                return Ok(self.direct.clone() as Arc<dyn Dialer>);
            }

            let config = self.load_hop(id, visited).await?;
            let parent = self.resolve_parent(ctx, &config, visited).await?;

            match config.proxy_type {
                ProxyType::Ssh => {
                    let tunnel = self.ssh_tunnel(ctx, &config, parent).await?;
                    Ok(tunnel as Arc<dyn Dialer>)
                }
                ProxyType::Socks5 => Ok(self.socks5_client(&config, parent) as Arc<dyn Dialer>),
                ProxyType::Direct => Err(Error::config(format!(
                    "proxy {} has type direct; use id 0 instead",
                    id
                ))),
            }
        }
        .boxed()
    }

    /// Load and check one hop before any network I/O for it happens.
    async fn load_hop(&self, id: ProxyId, visited: &mut Vec<ProxyId>) -> Result<ProxyConfig> {
        if visited.contains(&id) {
            let mut chain = visited.clone();
            chain.push(id);
            return Err(Error::CycleDetected(chain));
        }
        if visited.len() >= self.settings.max_chain_depth {
            return Err(Error::ChainTooDeep(self.settings.max_chain_depth));
        }
        visited.push(id);

        let config = self.repo.get_by_id(id).await?;
        if !config.enabled {
            return Err(Error::ProxyDisabled(id));
        }
        Ok(config)
    }

    async fn resolve_parent(
        &self,
        ctx: &DialContext,
        config: &ProxyConfig,
        visited: &mut Vec<ProxyId>,
    ) -> Result<Option<Arc<dyn Dialer>>> {
        match config.parent() {
            Some(parent_id) => {
                debug!(
                    "[{}] Resolving parent proxy {}",
                    config.label(),
                    parent_id
                );
                let parent = self
                    .resolve(ctx, parent_id, visited)
                    .await
                    .map_err(|e| e.context("failed to get parent proxy"))?;
                Ok(Some(parent))
            }
            None => Ok(None),
        }
    }

    async fn ssh_tunnel(
        &self,
        ctx: &DialContext,
        config: &ProxyConfig,
        parent: Option<Arc<dyn Dialer>>,
    ) -> Result<Arc<SshTunnel>> {
        let cached = self.cache.lock().tunnels.get(&config.id).cloned();
        if let Some(tunnel) = cached {
            if tunnel.is_connected() {
                debug!("[{}] Reusing cached SSH tunnel", config.label());
                return Ok(tunnel);
            }
        }

        let tunnel = Arc::new(self.connect_tunnel(ctx, config, parent.as_deref()).await?);

        let (adopted, stale) = {
            let mut cache = self.cache.lock();
            match cache.tunnels.get(&config.id) {
                Some(existing) if existing.is_connected() => (existing.clone(), Some(tunnel)),
                _ => {
                    let previous = cache.tunnels.insert(config.id, tunnel.clone());
                    (tunnel, previous)
                }
            }
        };

        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                debug!("[{}] Closing redundant SSH tunnel failed: {}", config.label(), e);
            }
        }
        Ok(adopted)
    }

    async fn connect_tunnel(
        &self,
        ctx: &DialContext,
        config: &ProxyConfig,
        parent: Option<&dyn Dialer>,
    ) -> Result<SshTunnel> {
        let tunnel = SshTunnel::new(
            config.label(),
            config.host.clone(),
            config.port,
            config.username.clone().unwrap_or_default(),
            config.password.clone().unwrap_or_default(),
        )
        .with_timeout(self.settings.handshake_timeout());

        match parent {
            Some(parent) => tunnel.connect_with_dialer(ctx, parent).await,
            None => tunnel.connect(ctx).await,
        }
        .map_err(|e| e.context("failed to create SSH tunnel"))?;

        Ok(tunnel)
    }

    fn build_socks5(&self, config: &ProxyConfig, parent: Option<Arc<dyn Dialer>>) -> Socks5Client {
        let client = Socks5Client::new(config.label(), config.host.clone(), config.port)
            .with_credentials(config.username.clone(), config.password.clone())
            .with_timeout(self.settings.handshake_timeout());
        match parent {
            Some(parent) => client.with_parent(parent),
            None => client,
        }
    }

    fn socks5_client(&self, config: &ProxyConfig, parent: Option<Arc<dyn Dialer>>) -> Arc<Socks5Client> {
        // The parent may have been rebuilt since the last call, so the
        // client is rebuilt whenever the hop has a parent.
        let mut cache = self.cache.lock();
        if parent.is_none() {
            if let Some(client) = cache.socks.get(&config.id) {
                if !client.has_parent() {
                    return client.clone();
                }
            }
        }

        let client = Arc::new(self.build_socks5(config, parent));
        cache.socks.insert(config.id, client.clone());
        client
    }

    /// Build a throwaway hop for `id`, check it connects, and record the outcome.
    ///
    /// Parents are resolved exactly as [`get_dialer`](Self::get_dialer) does;
    /// the tested hop itself is never cached.
    pub async fn test_proxy(&self, ctx: &DialContext, id: ProxyId) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let outcome = self.probe(ctx, id).await;

        let (status, last_error) = match &outcome {
            Ok(()) => {
                info!("Proxy {} test succeeded", id);
                (ProxyStatus::Connected, None)
            }
            Err(e) => {
                warn!("Proxy {} test failed: {}", id, e);
                (ProxyStatus::Error, Some(e.to_string()))
            }
        };

        if let Err(e) = self.repo.update_status(id, status, last_error).await {
            debug!("Failed to record status for proxy {}: {}", id, e);
        }
        outcome
    }

    async fn probe(&self, ctx: &DialContext, id: ProxyId) -> Result<()> {
        if id == DIRECT_PROXY_ID {
            return Err(Error::config("proxy id 0 is the direct connection"));
        }

        let mut visited = Vec::new();
        let config = self.load_hop(id, &mut visited).await?;
        let parent = self.resolve_parent(ctx, &config, &mut visited).await?;

        match config.proxy_type {
            ProxyType::Ssh => {
                let tunnel = self.connect_tunnel(ctx, &config, parent.as_deref()).await?;
                tunnel.close().await
            }
            ProxyType::Socks5 => {
                self.build_socks5(&config, parent)
                    .test_connection_with_target(ctx, &self.settings.test_target)
                    .await
            }
            ProxyType::Direct => Err(Error::config(format!(
                "proxy {} has type direct; use id 0 instead",
                id
            ))),
        }
    }

    /// Release the cached hop for `id`.
    pub async fn close_proxy(&self, id: ProxyId) -> Result<()> {
        let tunnel = {
            let mut cache = self.cache.lock();
            cache.socks.remove(&id);
            cache.tunnels.remove(&id)
        };

        if let Some(tunnel) = tunnel {
            tunnel.close().await?;
        }
        Ok(())
    }

    /// Release every cached hop. The first close error is reported after all are closed.
    pub async fn close_all(&self) -> Result<()> {
        let tunnels: Vec<(ProxyId, Arc<SshTunnel>)> = {
            let mut cache = self.cache.lock();
            cache.socks.clear();
            cache.tunnels.drain().collect()
        };

        let mut first_err = None;
        for (id, tunnel) in tunnels {
            if let Err(e) = tunnel.close().await {
                warn!("Failed to close SSH tunnel for proxy {}: {}", id, e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close everything and refuse further resolution.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down proxy manager");
        self.close_all().await
    }

    /// Number of cached (SSH tunnels, SOCKS5 clients)
    pub fn cached_count(&self) -> (usize, usize) {
        let cache = self.cache.lock();
        (cache.tunnels.len(), cache.socks.len())
    }

    #[cfg(test)]
    fn seed_tunnel(&self, id: ProxyId, tunnel: Arc<SshTunnel>) {
        self.cache.lock().tunnels.insert(id, tunnel);
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        let live = self.cache.get_mut().tunnels.len();
        if live > 0 && !self.shut_down.load(Ordering::Relaxed) {
            warn!(
                "ProxyManager dropped with {} cached SSH tunnel(s) without shutdown",
                live
            );
        }
    }
}

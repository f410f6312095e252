//! Pooled HTTP clients, one per worker identity.
//!
//! A [`reqwest::Client`] owns its own connection pool, so caching one client
//! per [`WorkerIdentity`] gives each egress path its own keep-alive sockets.
//! Clients never follow redirects themselves; the worker counts hops.

use crate::config::{DownloadConfig, PoolConfig, WorkerIdentity};
use crate::error::{Error, Result};
use reqwest::{Client, Proxy};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Cache of pooled clients keyed by worker identity
///
/// Pure resource cache: it knows nothing about tasks or retries.
pub struct ClientPoolFactory {
    pool_config: PoolConfig,
    user_agent: String,
    clients: Mutex<HashMap<WorkerIdentity, Client>>,
}

impl ClientPoolFactory {
    /// Create an empty factory
    pub fn new(pool_config: PoolConfig, download_config: &DownloadConfig) -> Self {
        Self {
            pool_config,
            user_agent: download_config.user_agent.clone(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Pooled client for `identity`, built on first use
    ///
    /// `Client` is a cheap handle; clones share the same pool.
    pub fn get_pool(&self, identity: &WorkerIdentity) -> Result<Client> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(identity) {
            return Ok(client.clone());
        }

        let client = self.build_client(identity)?;
        tracing::debug!(worker = %identity, "Created pooled client");
        clients.insert(identity.clone(), client.clone());
        Ok(client)
    }

    /// Number of cached clients
    pub fn len(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no client has been built yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached client; idle sockets close once in-flight requests finish
    pub fn clear_cache(&self) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = clients.len();
        clients.clear();
        tracing::debug!(dropped, "Cleared pooled clients");
    }

    fn build_client(&self, identity: &WorkerIdentity) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(&self.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            // Idle ceiling only; the worker's attachment gate bounds open transfers
            .pool_max_idle_per_host(self.pool_config.max_sockets)
            .pool_idle_timeout(self.pool_config.free_socket_timeout)
            .tcp_keepalive(self.pool_config.keep_alive)
            .connect_timeout(self.pool_config.connect_timeout);

        match build_proxy(identity)? {
            Some(proxy) => builder = builder.proxy(proxy),
            // Ignore HTTP(S)_PROXY from the environment for direct egress
            None => builder = builder.no_proxy(),
        }

        Ok(builder.build()?)
    }
}

/// Build the reqwest proxy for `identity`, `None` for direct egress
fn build_proxy(identity: &WorkerIdentity) -> Result<Option<Proxy>> {
    let WorkerIdentity::Proxy { credentials, .. } = identity else {
        return Ok(None);
    };
    let Some(url) = identity.proxy_url() else {
        return Ok(None);
    };

    let mut proxy = Proxy::all(&url).map_err(|e| Error::Config {
        message: format!("invalid proxy {identity}: {e}"),
        key: Some("WORKER_LIST".to_string()),
    })?;
    if let Some(creds) = credentials {
        proxy = proxy.basic_auth(&creds.username, &creds.password);
    }
    Ok(Some(proxy))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyCredentials, ProxyScheme};

    fn factory() -> ClientPoolFactory {
        ClientPoolFactory::new(PoolConfig::default(), &DownloadConfig::default())
    }

    fn proxy(host: &str, port: u16, user: Option<&str>) -> WorkerIdentity {
        WorkerIdentity::Proxy {
            scheme: ProxyScheme::Http,
            host: host.to_string(),
            port,
            credentials: user.map(|u| ProxyCredentials {
                username: u.to_string(),
                password: "secret".to_string(),
            }),
        }
    }

    #[test]
    fn one_client_is_cached_per_identity() {
        let factory = factory();

        factory.get_pool(&WorkerIdentity::Direct).unwrap();
        factory.get_pool(&WorkerIdentity::Direct).unwrap();
        assert_eq!(factory.len(), 1);

        factory.get_pool(&proxy("10.0.0.1", 3128, None)).unwrap();
        factory.get_pool(&proxy("10.0.0.1", 3129, None)).unwrap();
        assert_eq!(factory.len(), 3);
    }

    #[test]
    fn credentials_distinguish_identities() {
        let factory = factory();

        factory.get_pool(&proxy("10.0.0.1", 3128, Some("a"))).unwrap();
        factory.get_pool(&proxy("10.0.0.1", 3128, Some("b"))).unwrap();
        factory.get_pool(&proxy("10.0.0.1", 3128, None)).unwrap();

        assert_eq!(factory.len(), 3);
    }

    #[test]
    fn clear_cache_disposes_all_clients() {
        let factory = factory();
        factory.get_pool(&WorkerIdentity::Direct).unwrap();
        factory.get_pool(&proxy("10.0.0.1", 3128, None)).unwrap();

        factory.clear_cache();

        assert!(factory.is_empty());
    }

    #[test]
    fn direct_identity_has_no_proxy() {
        assert!(build_proxy(&WorkerIdentity::Direct).unwrap().is_none());
        assert!(build_proxy(&proxy("proxy.local", 8080, Some("u"))).unwrap().is_some());
    }
}

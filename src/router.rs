use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use tracing::debug;

use crate::blacklist::Blacklist;
use crate::error::{ProxyError, Result};
use crate::pool::{Pool, PooledStream};

/// Turns routing decisions into live upstream sockets
///
/// Owns the reverse map (built once at startup, read-only afterwards) and the
/// blacklist; borrows the worker's pool. One router per worker.
pub struct Router {
    pool: Rc<RefCell<Pool>>,
    reverse: HashMap<String, SocketAddr>,
    blacklist: Blacklist,
}

impl Router {
    pub fn new(
        pool: Rc<RefCell<Pool>>,
        reverse: HashMap<String, SocketAddr>,
        blacklist: Blacklist,
    ) -> Self {
        Self {
            pool,
            reverse,
            blacklist,
        }
    }

    pub fn reverse_len(&self) -> usize {
        self.reverse.len()
    }

    /// Forward route: blacklist check, DNS resolve, pool acquire
    pub async fn route_forward(&self, host: &str, port: &str) -> Result<PooledStream> {
        if self.blacklist.is_blocked_domain(host) {
            return Err(ProxyError::security(format!("blocked domain: {host}")));
        }

        let authority = format!("{host}:{port}");
        let mut addrs = tokio::net::lookup_host(&authority)
            .await
            .map_err(|err| ProxyError::network(format!("resolve {authority} failed: {err}")))?;
        let endpoint = addrs
            .next()
            .ok_or_else(|| ProxyError::network(format!("resolve {authority}: no addresses")))?;

        if self.blacklist.is_blocked_ip(&endpoint.ip().to_string()) {
            return Err(ProxyError::security(format!(
                "blocked address: {}",
                endpoint.ip()
            )));
        }

        debug!("forward route {authority} -> {endpoint}");
        Pool::acquire(&self.pool, endpoint).await
    }

    /// Reverse route: look the incoming host up in the configured map
    ///
    /// The map is probed with the borrowed host string directly; no
    /// allocation happens on the lookup path.
    pub async fn route_reverse(&self, host: &str) -> Result<PooledStream> {
        let endpoint = *self
            .reverse
            .get(host)
            .ok_or_else(|| ProxyError::network(format!("unknown host: {host}")))?;

        debug!("reverse route {host} -> {endpoint}");
        Pool::acquire(&self.pool, endpoint).await
    }

    /// Acquire straight from the pool, bypassing resolution
    #[allow(dead_code)]
    pub async fn route_direct(&self, endpoint: SocketAddr) -> Result<PooledStream> {
        Pool::acquire(&self.pool, endpoint).await
    }
}

use std::net::SocketAddr;
use std::rc::Rc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::analyze::RouteTarget;
use crate::arena::Arena;
use crate::error::{is_graceful_io, ErrorKind, ProxyError, Result};
use crate::http::{read_request, serialize_request, serialize_response, Method, Response};
use crate::obscura::Obscura;
use crate::pool::PooledStream;
use crate::router::Router;
use crate::sniff::{self, Protocol};
use crate::tunnel;

/// Per-worker state borrowed by every session on that worker
pub struct SessionContext {
    pub router: Rc<Router>,
    /// Absent when no certificate was configured; obscura traffic is then
    /// dropped quietly
    pub tls: Option<TlsAcceptor>,
}

/// One accepted client connection
///
/// Owns the client socket for its whole lifetime and at most one upstream
/// handle at a time. The state progression is linear: peek, classify, handle
/// HTTP or obscura, tunnel, teardown. Dropping the session closes the client
/// socket.
pub struct Session {
    client: TcpStream,
    peer: SocketAddr,
    ctx: Rc<SessionContext>,
    arena: Arena,
}

impl Session {
    pub fn new(client: TcpStream, peer: SocketAddr, ctx: Rc<SessionContext>) -> Self {
        Self {
            client,
            peer,
            ctx,
            arena: Arena::new(),
        }
    }

    /// Detach the session onto the worker's local task set
    ///
    /// The completion handler is the single place pipeline errors get
    /// logged; graceful closures never reach it.
    pub fn start(self) {
        let peer = self.peer;
        tokio::task::spawn_local(async move {
            if let Err(err) = self.run().await {
                match err.kind() {
                    ErrorKind::Security => warn!(
                        %peer,
                        location = %err.location(),
                        "session rejected: {}",
                        err.message()
                    ),
                    ErrorKind::Protocol => warn!(
                        %peer,
                        location = %err.location(),
                        "session protocol failure: {}",
                        err.message()
                    ),
                    ErrorKind::Network => debug!(
                        %peer,
                        location = %err.location(),
                        "session network failure: {}",
                        err.message()
                    ),
                }
            }
        });
    }

    /// Peek, classify and dispatch
    async fn run(mut self) -> Result<()> {
        let mut peek_buf = [0u8; 24];
        let n = match self.client.peek(&mut peek_buf).await {
            Ok(n) => n,
            Err(err) if is_graceful_io(&err) => return Ok(()),
            Err(err) => return Err(ProxyError::network(format!("peek failed: {err}"))),
        };
        if n == 0 {
            return Ok(());
        }

        match sniff::classify(&peek_buf[..n]) {
            Protocol::Http => self.handle_http().await,
            Protocol::Obscura | Protocol::Unknown => self.handle_obscura().await,
        }
    }

    async fn handle_http(&mut self) -> Result<()> {
        self.arena.reset();
        let scratch = self.arena.bump_all();

        let (request, prefetched) = match read_request(&mut self.client, scratch).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(()),
            Err(err) if is_graceful_io(&err) => return Ok(()),
            Err(err) => return Err(ProxyError::network(format!("request read failed: {err}"))),
        };

        let target = RouteTarget::from_request(&request);
        let mut upstream = if target.forward_proxy {
            self.ctx
                .router
                .route_forward(&target.host, &target.port)
                .await?
        } else {
            self.ctx.router.route_reverse(&target.host).await?
        };

        if request.method() == Method::Connect {
            // Success is only reported once the upstream exists; the CONNECT
            // line itself is never forwarded
            let established = serialize_response(&Response::connection_established());
            match self.client.write_all(&established).await {
                Ok(()) => {}
                Err(err) if is_graceful_io(&err) => return Ok(()),
                Err(err) => {
                    return Err(ProxyError::network(format!("client write failed: {err}")))
                }
            }
        } else {
            let bytes = serialize_request(&request);
            match upstream.get_mut().write_all(&bytes).await {
                Ok(()) => {}
                Err(err) if is_graceful_io(&err) => return Ok(()),
                Err(err) => {
                    return Err(ProxyError::network(format!("upstream write failed: {err}")))
                }
            }
        }

        // Bytes the reader pulled in beyond the request belong upstream
        if !prefetched.is_empty() {
            match upstream.get_mut().write_all(&prefetched).await {
                Ok(()) => {}
                Err(err) if is_graceful_io(&err) => return Ok(()),
                Err(err) => {
                    return Err(ProxyError::network(format!("upstream write failed: {err}")))
                }
            }
        }

        self.tunnel(upstream).await
    }

    async fn handle_obscura(mut self) -> Result<()> {
        let Some(tls) = self.ctx.tls.clone() else {
            return Ok(());
        };
        self.arena.reset();

        let (mut endpoint, path) = Obscura::server_handshake(self.client, &tls).await?;

        // The upgrade path, minus its leading slash, names the upstream
        let authority = path.strip_prefix('/').unwrap_or(path.as_str());
        let target = RouteTarget::from_authority(authority);
        if target.host.is_empty() {
            let _ = endpoint.close().await;
            return Ok(());
        }

        let mut upstream = self
            .ctx
            .router
            .route_forward(&target.host, &target.port)
            .await?;

        let result = tunnel::relay_obscura(endpoint, upstream.get_mut(), &mut self.arena).await;

        upstream.force_close();
        drop(upstream);
        result
    }

    async fn tunnel(&mut self, mut upstream: PooledStream) -> Result<()> {
        let result = tunnel::relay(&mut self.client, upstream.get_mut(), &mut self.arena).await;

        // Teardown order: client first, then upstream, then the handle, so
        // the pool sees a closed socket and destroys it instead of caching
        let _ = self.client.shutdown().await;
        upstream.force_close();
        drop(upstream);
        result
    }
}

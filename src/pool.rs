use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// Idle sockets kept per endpoint; beyond this, recycled sockets are destroyed
pub const MAX_CACHE_PER_ENDPOINT: usize = 32;
/// Idle sockets older than this are dropped without a health check
pub const MAX_IDLE: Duration = Duration::from_secs(60);
/// Deadline for establishing a fresh upstream connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct IdleEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Per-worker upstream connection cache
///
/// Keyed by remote endpoint, each entry a stack of idle sockets. The pool is
/// owned by exactly one worker and only touched from that worker's event
/// loop, so it lives behind `Rc<RefCell<..>>` with no locking.
#[derive(Default)]
pub struct Pool {
    cache: HashMap<SocketAddr, Vec<IdleEntry>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a connection to `endpoint`, reusing an idle one when possible
    ///
    /// Pops the endpoint's stack until a healthy socket turns up, dropping
    /// idle-expired entries and zombies along the way. A miss establishes a
    /// fresh connection with a connect deadline and `TCP_NODELAY` set.
    pub async fn acquire(pool: &Rc<RefCell<Pool>>, endpoint: SocketAddr) -> Result<PooledStream> {
        if let Some(stream) = pool.borrow_mut().take_idle(endpoint) {
            return Ok(PooledStream::new(stream, endpoint, Rc::downgrade(pool)));
        }

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(ProxyError::network(format!(
                    "connect to {endpoint} failed: {err}"
                )))
            }
            Err(_) => {
                return Err(ProxyError::network(format!(
                    "connect to {endpoint} timed out"
                )))
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY on {endpoint}: {err}");
        }

        Ok(PooledStream::new(stream, endpoint, Rc::downgrade(pool)))
    }

    /// Pop idle entries until a healthy one is found or the stack drains
    fn take_idle(&mut self, endpoint: SocketAddr) -> Option<TcpStream> {
        let stack = self.cache.get_mut(&endpoint)?;
        let now = Instant::now();
        let mut found = None;

        while let Some(entry) = stack.pop() {
            if now.duration_since(entry.last_used) > MAX_IDLE {
                // Too old, drop without probing
                continue;
            }
            if Self::zombie_check(&entry.stream) {
                found = Some(entry.stream);
                break;
            }
        }

        if stack.is_empty() {
            self.cache.remove(&endpoint);
        }
        found
    }

    /// Probe a candidate socket without consuming data
    ///
    /// One-byte `MSG_PEEK` on the (already non-blocking) descriptor. Healthy
    /// iff the probe reports would-block: the peer is alive and has sent
    /// nothing. Zero bytes means the peer sent FIN; pending bytes on an idle
    /// proxy connection mean a broken previous exchange; both are unusable.
    fn zombie_check(stream: &TcpStream) -> bool {
        let sock = SockRef::from(stream);
        let mut buf = [MaybeUninit::<u8>::uninit(); 1];
        matches!(sock.peek(&mut buf), Err(ref err) if err.kind() == io::ErrorKind::WouldBlock)
    }

    /// Return a socket to the cache, keyed by its known endpoint
    ///
    /// Called by the pooled handle's drop; never fails. Closed sockets and
    /// overflow beyond the per-endpoint cap are destroyed instead of stored.
    pub fn recycle(&mut self, stream: TcpStream, endpoint: SocketAddr) {
        if stream.peer_addr().is_err() {
            return;
        }

        let stack = self.cache.entry(endpoint).or_default();
        if stack.len() >= MAX_CACHE_PER_ENDPOINT {
            let _ = SockRef::from(&stream).shutdown(Shutdown::Both);
            return;
        }

        stack.push(IdleEntry {
            stream,
            last_used: Instant::now(),
        });
    }

    /// Return a socket whose endpoint was not recorded
    ///
    /// Recovers the endpoint from the socket itself; a socket that cannot
    /// report its peer any more is destroyed.
    #[allow(dead_code)]
    pub fn recycle_unkeyed(&mut self, stream: TcpStream) {
        if let Ok(endpoint) = stream.peer_addr() {
            self.recycle(stream, endpoint);
        }
    }

    /// Drop every idle socket
    #[allow(dead_code)]
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Number of idle sockets currently cached for `endpoint`
    #[allow(dead_code)]
    pub fn idle_count(&self, endpoint: SocketAddr) -> usize {
        self.cache.get(&endpoint).map_or(0, Vec::len)
    }
}

/// Owning handle to a pooled upstream socket
///
/// Dropping a live handle hands the socket back to its pool exactly once;
/// a handle whose pool is gone, or that was [`force_close`]d, destroys the
/// socket instead.
///
/// [`force_close`]: PooledStream::force_close
#[derive(Debug)]
pub struct PooledStream {
    stream: Option<TcpStream>,
    endpoint: SocketAddr,
    pool: Weak<RefCell<Pool>>,
    closed: bool,
}

impl PooledStream {
    fn new(stream: TcpStream, endpoint: SocketAddr, pool: Weak<RefCell<Pool>>) -> Self {
        Self {
            stream: Some(stream),
            endpoint,
            pool,
            closed: false,
        }
    }

    /// Endpoint cached at acquire time
    ///
    /// Recorded up front because the peer address of a closing socket may no
    /// longer be readable at drop time.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("pooled stream already taken")
    }

    /// Shut the socket down both ways and poison the handle
    ///
    /// After this, drop destroys the socket rather than re-caching it.
    pub fn force_close(&mut self) {
        if let Some(stream) = self.stream.as_ref() {
            let _ = SockRef::from(stream).shutdown(Shutdown::Both);
        }
        self.closed = true;
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if self.closed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.borrow_mut().recycle(stream, self.endpoint);
        }
    }
}

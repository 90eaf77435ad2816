use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::task::LocalSet;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::blacklist::Blacklist;
use crate::pool::Pool;
use crate::router::Router;
use crate::session::{Session, SessionContext};

/// Everything a worker thread needs to build its own state
///
/// Cloned once per thread; the pool and router are constructed fresh inside
/// each worker and never shared across threads.
#[derive(Clone)]
pub struct WorkerConfig {
    pub listen: SocketAddr,
    pub reverse: HashMap<String, SocketAddr>,
    pub blacklist: Blacklist,
    pub tls: Option<TlsAcceptor>,
}

/// One accept loop bound to the shared port
///
/// Each worker owns its own listener (`SO_REUSEPORT` where available), its
/// own single-threaded runtime, its own pool and its own router. Parallelism
/// is across workers, never inside one.
pub struct Worker {
    listener: std::net::TcpListener,
    config: WorkerConfig,
}

impl Worker {
    /// Bind this worker's listener; bind failures are fatal to startup
    pub fn bind(config: WorkerConfig) -> io::Result<Self> {
        let listener = make_listener(config.listen)?;
        Ok(Self { listener, config })
    }

    #[allow(dead_code)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop on the calling thread until the process exits
    pub fn run(self) -> io::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, serve(self.listener, self.config))
    }
}

/// Build a non-blocking listener sharing the port with sibling workers
fn make_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

async fn serve(listener: std::net::TcpListener, config: WorkerConfig) -> io::Result<()> {
    let pool = Rc::new(RefCell::new(Pool::new()));
    let router = Rc::new(Router::new(
        pool,
        config.reverse,
        config.blacklist,
    ));
    let ctx = Rc::new(SessionContext {
        router,
        tls: config.tls,
    });

    let listener = TcpListener::from_std(listener)?;
    info!("worker listening on {}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                Session::new(stream, peer, ctx.clone()).start();
            }
            Err(err) => warn!("accept error: {err} (continuing)"),
        }
    }
}

/// Launch `threads` workers on the same port and block until they exit
///
/// All listeners are bound up front so a bind failure surfaces before any
/// thread starts. One worker runs on the calling thread, the rest on their
/// own OS threads.
pub fn run(config: WorkerConfig, threads: usize) -> io::Result<()> {
    let threads = threads.max(1);
    let mut workers = Vec::with_capacity(threads);
    for _ in 0..threads {
        workers.push(Worker::bind(config.clone())?);
    }

    let mut iter = workers.into_iter();
    let first = iter.next().expect("at least one worker");

    let mut handles = Vec::new();
    for (index, worker) in iter.enumerate() {
        let handle = std::thread::Builder::new()
            .name(format!("umbra-worker-{}", index + 1))
            .spawn(move || {
                if let Err(err) = worker.run() {
                    warn!("worker exited: {err}");
                }
            })?;
        handles.push(handle);
    }

    let result = first.run();
    for handle in handles {
        let _ = handle.join();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_make_listener_binds_ephemeral_port() {
        let listener = make_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_sibling_workers_share_one_port() {
        let first = make_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        // A second bind on the same port must succeed via SO_REUSEPORT
        let _second = make_listener(addr).unwrap();
    }

    #[test]
    fn test_worker_serves_connect_sessions() {
        let config = WorkerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            reverse: HashMap::new(),
            blacklist: Blacklist::new(),
            tls: None,
        };
        let worker = Worker::bind(config).unwrap();
        let proxy_addr = worker.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = worker.run();
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let echo_addr = echo.local_addr().unwrap();
            tokio::spawn(async move {
                let (mut socket, _) = echo.accept().await.unwrap();
                let mut buf = [0u8; 256];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            let mut client = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
            let request =
                format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n");
            client.write_all(request.as_bytes()).await.unwrap();

            let mut response = Vec::new();
            let mut buf = [0u8; 256];
            while !response.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = tokio::time::timeout(
                    Duration::from_millis(1500),
                    client.read(&mut buf),
                )
                .await
                .unwrap()
                .unwrap();
                assert!(n > 0);
                response.extend_from_slice(&buf[..n]);
            }
            assert!(response.starts_with(b"HTTP/1.1 200"));

            client.write_all(b"ping").await.unwrap();
            let mut echoed = [0u8; 4];
            tokio::time::timeout(
                Duration::from_millis(1500),
                client.read_exact(&mut echoed),
            )
            .await
            .unwrap()
            .unwrap();
            assert_eq!(&echoed, b"ping");
        });
    }
}

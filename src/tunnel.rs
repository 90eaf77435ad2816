use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::arena::Arena;
use crate::error::{is_graceful_io, ProxyError, Result};
use crate::obscura::{Obscura, ObscuraSink, ObscuraSource};

/// One unidirectional copy, bound to a cancellation token
///
/// EOF, cancellation and graceful transport errors all end the copy with
/// success so the opposite direction can quiesce cleanly; anything else is a
/// network error. Within one direction reads and writes are strictly
/// ordered: a chunk is fully written before the next read begins.
pub async fn copy_bytes<R, W>(
    src: &mut R,
    dst: &mut W,
    token: &CancellationToken,
    buf: &mut [u8],
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = src.read(buf) => match read {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(err) if is_graceful_io(&err) => return Ok(()),
                Err(err) => return Err(ProxyError::network(format!("read failed: {err}"))),
            },
        };

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            write = dst.write_all(&buf[..n]) => match write {
                Ok(()) => {}
                Err(err) if is_graceful_io(&err) => return Ok(()),
                Err(err) => return Err(ProxyError::network(format!("write failed: {err}"))),
            },
        }
    }
}

/// Bidirectional TCP relay
///
/// Splits the arena's remaining space into one buffer per direction and runs
/// both copies concurrently. Whichever direction finishes first, for any
/// reason, cancels the other; the call returns once both have completed and
/// surfaces the first non-graceful error. The sockets are left open; the
/// caller owns teardown.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U, arena: &mut Arena) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    arena.reset();
    let (up_buf, down_buf) = arena.split_rest();

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let up_token = CancellationToken::new();
    let down_token = CancellationToken::new();

    let up = async {
        let result = copy_bytes(&mut client_read, &mut upstream_write, &up_token, up_buf).await;
        down_token.cancel();
        result
    };
    let down = async {
        let result = copy_bytes(&mut upstream_read, &mut client_write, &down_token, down_buf).await;
        up_token.cancel();
        result
    };

    let (up_result, down_result) = tokio::join!(up, down);
    up_result.and(down_result)
}

/// Bidirectional relay between a covert channel and a raw TCP upstream
///
/// One direction unwraps WebSocket messages into raw bytes, the other wraps
/// raw bytes into binary messages. Same cancellation contract as [`relay`].
/// On completion a WebSocket close is attempted; close failures are logged
/// and dropped since the tunnel outcome already stands.
pub async fn relay_obscura<U>(endpoint: Obscura, upstream: &mut U, arena: &mut Arena) -> Result<()>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    arena.reset();
    // Message reads go through a growable buffer sized like its half, since
    // a WebSocket message may exceed a fixed slice
    let (_msg_half, raw_buf) = arena.split_rest();

    let (mut sink, mut source) = endpoint.split();
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let up_token = CancellationToken::new();
    let down_token = CancellationToken::new();

    let raw_buf_len = raw_buf.len();
    let up = async {
        let mut msg_buf = Vec::with_capacity(raw_buf_len);
        let result =
            copy_ws_to_tcp(&mut source, &mut upstream_write, &up_token, &mut msg_buf).await;
        down_token.cancel();
        result
    };
    let down = async {
        let result = copy_tcp_to_ws(&mut upstream_read, &mut sink, &down_token, raw_buf).await;
        up_token.cancel();
        result
    };

    let (up_result, down_result) = tokio::join!(up, down);

    let mut endpoint = Obscura::reunite(sink, source);
    if let Err(err) = endpoint.close().await {
        debug!("websocket close after tunnel: {err}");
    }

    up_result.and(down_result)
}

/// Message-to-bytes direction of the obscura tunnel
async fn copy_ws_to_tcp<W>(
    source: &mut ObscuraSource,
    dst: &mut W,
    token: &CancellationToken,
    msg_buf: &mut Vec<u8>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = source.read(msg_buf) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            write = dst.write_all(&msg_buf[..n]) => match write {
                Ok(()) => {}
                Err(err) if is_graceful_io(&err) => return Ok(()),
                Err(err) => return Err(ProxyError::network(format!("write failed: {err}"))),
            },
        }
    }
}

/// Bytes-to-message direction of the obscura tunnel
async fn copy_tcp_to_ws<R>(
    src: &mut R,
    sink: &mut ObscuraSink,
    token: &CancellationToken,
    buf: &mut [u8],
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = src.read(buf) => match read {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(err) if is_graceful_io(&err) => return Ok(()),
                Err(err) => return Err(ProxyError::network(format!("read failed: {err}"))),
            },
        };

        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            sent = sink.write(&buf[..n]) => {
                if !sent? {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_copy_bytes_finishes_on_eof() {
        let (mut a, mut b) = duplex(64);
        let (_c, mut d) = duplex(64);
        let token = CancellationToken::new();
        let mut buf = [0u8; 32];

        a.write_all(b"payload").await.unwrap();
        drop(a);

        copy_bytes(&mut b, &mut d, &token, &mut buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_bytes_moves_bytes_in_order() {
        let (mut a, mut b) = duplex(64);
        let (mut c, mut d) = duplex(64);
        let token = CancellationToken::new();

        let copier = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            copy_bytes(&mut b, &mut c, &token, &mut buf).await
        });

        a.write_all(b"0123456789abcdef").await.unwrap();
        drop(a);

        let mut out = Vec::new();
        d.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0123456789abcdef");
        copier.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_copy_bytes_stops_on_cancel() {
        let (_a, mut b) = duplex(64);
        let (_c, mut d) = duplex(64);
        let token = CancellationToken::new();
        token.cancel();

        let mut buf = [0u8; 32];
        // No data will ever arrive; only the token stops the read
        tokio::time::timeout(
            Duration::from_millis(500),
            copy_bytes(&mut b, &mut d, &token, &mut buf),
        )
        .await
        .expect("cancelled copy must return promptly")
        .unwrap();
    }

    #[tokio::test]
    async fn test_relay_full_duplex_and_cross_shutdown() {
        let (mut client_far, mut client_near) = duplex(256);
        let (mut upstream_far, mut upstream_near) = duplex(256);

        let relay_task = tokio::spawn(async move {
            let mut arena = Arena::new();
            relay(&mut client_near, &mut upstream_near, &mut arena).await
        });

        // client -> upstream
        client_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // upstream -> client
        upstream_far.write_all(b"pong").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // One side closing collapses the whole relay
        drop(client_far);
        let result = tokio::time::timeout(Duration::from_millis(1500), relay_task)
            .await
            .expect("relay must finish after one side closes")
            .unwrap();
        result.unwrap();
    }
}

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, client_async, WebSocketStream};

use crate::error::{is_graceful_ws, ProxyError, Result};

type WsStream = WebSocketStream<TlsStream<TcpStream>>;

/// Which side of the covert channel this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Covert channel endpoint: WebSocket over TLS over TCP
///
/// To the network this looks like ordinary HTTPS traffic upgrading to a
/// WebSocket; the binary messages carry arbitrary tunneled bytes. Handshake
/// and close failures surface as protocol errors, closed-stream conditions
/// are absorbed as normal termination.
pub struct Obscura {
    ws: WsStream,
    role: Role,
}

impl Obscura {
    /// Accept the server side of the channel
    ///
    /// TLS server handshake first, then the WebSocket upgrade. The request
    /// path is captured during the upgrade and returned to the caller, which
    /// interprets it as the tunnel target.
    pub async fn server_handshake(socket: TcpStream, tls: &TlsAcceptor) -> Result<(Self, String)> {
        let tls_stream = tls
            .accept(socket)
            .await
            .map_err(|err| ProxyError::protocol(format!("tls accept failed: {err}")))?;

        let mut path = String::new();
        let ws = accept_hdr_async(
            TlsStream::Server(tls_stream),
            |req: &WsRequest, resp: WsResponse| {
                path = req.uri().path().to_string();
                Ok(resp)
            },
        )
        .await
        .map_err(|err| ProxyError::protocol(format!("websocket accept failed: {err}")))?;

        Ok((
            Self {
                ws,
                role: Role::Server,
            },
            path,
        ))
    }

    /// Establish the client side of the channel
    ///
    /// `host` doubles as the TLS SNI name; `path` must carry its leading `/`.
    #[allow(dead_code)]
    pub async fn client_handshake(
        socket: TcpStream,
        tls: &TlsConnector,
        host: &str,
        path: &str,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|err| ProxyError::protocol(format!("invalid sni host {host}: {err}")))?;
        let tls_stream = tls
            .connect(server_name, socket)
            .await
            .map_err(|err| ProxyError::protocol(format!("tls connect failed: {err}")))?;

        let url = format!("wss://{host}{path}");
        let (ws, _response) = client_async(url, TlsStream::Client(tls_stream))
            .await
            .map_err(|err| ProxyError::protocol(format!("websocket connect failed: {err}")))?;

        Ok(Self {
            ws,
            role: Role::Client,
        })
    }

    #[allow(dead_code)]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Read one message's bytes into `buf`, returning the byte count
    ///
    /// Zero means the peer closed (close frame, end of stream, or a graceful
    /// transport error).
    #[allow(dead_code)]
    pub async fn read(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        read_message(&mut self.ws, buf).await
    }

    /// Send one binary message
    ///
    /// Returns `false` when the peer has already closed the channel.
    #[allow(dead_code)]
    pub async fn write(&mut self, data: &[u8]) -> Result<bool> {
        send_binary(&mut self.ws, data).await
    }

    /// Close the channel with a normal close frame
    ///
    /// An already-closed channel is not an error.
    pub async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match self.ws.close(Some(frame)).await {
            Ok(()) => Ok(()),
            Err(err) if is_graceful_ws(&err) => Ok(()),
            Err(err) => Err(ProxyError::protocol(format!(
                "websocket close failed: {err}"
            ))),
        }
    }

    /// Split into independently usable write and read halves
    pub fn split(self) -> (ObscuraSink, ObscuraSource) {
        let (sink, stream) = self.ws.split();
        (
            ObscuraSink {
                inner: sink,
                role: self.role,
            },
            ObscuraSource { inner: stream },
        )
    }

    /// Rejoin halves produced by [`split`](Self::split)
    pub fn reunite(sink: ObscuraSink, source: ObscuraSource) -> Self {
        let ws = sink
            .inner
            .reunite(source.inner)
            .expect("halves belong to the same stream");
        Self {
            ws,
            role: sink.role,
        }
    }
}

/// Write half of a split [`Obscura`]
pub struct ObscuraSink {
    inner: SplitSink<WsStream, Message>,
    role: Role,
}

impl ObscuraSink {
    /// Send one binary message; `false` when the peer has already closed
    pub async fn write(&mut self, data: &[u8]) -> Result<bool> {
        send_binary(&mut self.inner, data).await
    }
}

/// Read half of a split [`Obscura`]
pub struct ObscuraSource {
    inner: SplitStream<WsStream>,
}

impl ObscuraSource {
    /// Read one message's bytes into `buf`; zero means closed
    pub async fn read(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        read_message(&mut self.inner, buf).await
    }
}

async fn read_message<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<usize>
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            None => return Ok(0),
            Some(Ok(Message::Binary(data))) => {
                buf.clear();
                buf.extend_from_slice(&data);
                return Ok(buf.len());
            }
            Some(Ok(Message::Text(text))) => {
                buf.clear();
                buf.extend_from_slice(text.as_bytes());
                return Ok(buf.len());
            }
            Some(Ok(Message::Close(_))) => return Ok(0),
            // Pings and pongs are bookkeeping, not payload
            Some(Ok(_)) => continue,
            Some(Err(err)) if is_graceful_ws(&err) => return Ok(0),
            Some(Err(err)) => {
                return Err(ProxyError::protocol(format!(
                    "websocket read failed: {err}"
                )))
            }
        }
    }
}

async fn send_binary<S>(sink: &mut S, data: &[u8]) -> Result<bool>
where
    S: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    match sink.send(Message::binary(data.to_vec())).await {
        Ok(()) => Ok(true),
        Err(err) if is_graceful_ws(&err) => Ok(false),
        Err(err) => Err(ProxyError::protocol(format!(
            "websocket write failed: {err}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_rustls::rustls;

    /// Self-signed acceptor/connector pair for `localhost`
    pub(crate) fn tls_pair() -> (TlsAcceptor, TlsConnector) {
        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = certified.cert.der().clone();
        let key_der = rustls::pki_types::PrivateKeyDer::Pkcs8(
            certified.key_pair.serialize_der().into(),
        );

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        (
            TlsAcceptor::from(Arc::new(server_config)),
            TlsConnector::from(Arc::new(client_config)),
        )
    }

    #[tokio::test]
    async fn test_handshake_echo_and_close() {
        let (acceptor, connector) = tls_pair();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = async {
            let (socket, _) = listener.accept().await.unwrap();
            let (mut endpoint, path) = Obscura::server_handshake(socket, &acceptor)
                .await
                .unwrap();
            assert_eq!(endpoint.role(), Role::Server);
            assert_eq!(path, "/127.0.0.1:9999");

            let mut buf = Vec::new();
            let n = endpoint.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");
            assert!(endpoint.write(&buf[..n]).await.unwrap());
            endpoint.close().await.unwrap();
        };

        let client = async {
            let socket = TcpStream::connect(addr).await.unwrap();
            let mut endpoint =
                Obscura::client_handshake(socket, &connector, "localhost", "/127.0.0.1:9999")
                    .await
                    .unwrap();
            assert_eq!(endpoint.role(), Role::Client);

            assert!(endpoint.write(b"hello").await.unwrap());
            let mut buf = Vec::new();
            let n = endpoint.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello");

            // Peer close surfaces as a zero-length read
            let n = endpoint.read(&mut buf).await.unwrap();
            assert_eq!(n, 0);
            endpoint.close().await.unwrap();
        };

        tokio::join!(server, client);
    }

    #[tokio::test]
    async fn test_split_and_reunite() {
        let (acceptor, connector) = tls_pair();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = async {
            let (socket, _) = listener.accept().await.unwrap();
            let (endpoint, _path) = Obscura::server_handshake(socket, &acceptor)
                .await
                .unwrap();
            let (mut sink, mut source) = endpoint.split();

            let mut buf = Vec::new();
            let n = source.read(&mut buf).await.unwrap();
            assert!(sink.write(&buf[..n]).await.unwrap());

            let mut endpoint = Obscura::reunite(sink, source);
            endpoint.close().await.unwrap();
        };

        let client = async {
            let socket = TcpStream::connect(addr).await.unwrap();
            let mut endpoint = Obscura::client_handshake(socket, &connector, "localhost", "/t")
                .await
                .unwrap();
            assert!(endpoint.write(b"ping").await.unwrap());

            let mut buf = Vec::new();
            let n = endpoint.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            endpoint.close().await.unwrap();
        };

        tokio::join!(server, client);
    }
}

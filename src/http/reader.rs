use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::Request;

/// Upper bound for the request head (request line + headers)
pub const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Upper bound for a fully decoded request body
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const MAX_HEADERS: usize = 64;
const MAX_CHUNK_LINE: usize = 256;

/// Read one HTTP request from `stream`, accumulating the head into `scratch`
///
/// Returns the parsed request together with any bytes that were prefetched
/// beyond the end of the request (pipelined data the caller must not lose).
///
/// `Ok(None)` covers every "close quietly" case the same way: EOF before or
/// inside the head, an oversized head or body, and malformed framing. Only
/// transport failures surface as `Err`; the caller decides whether those are
/// graceful.
pub async fn read_request<R>(
    stream: &mut R,
    scratch: &mut [u8],
) -> io::Result<Option<(Request, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let cap = scratch.len().min(MAX_HEADER_BYTES);
    let mut filled = 0usize;

    let (mut request, head_len) = loop {
        if filled == cap {
            return Ok(None);
        }

        let n = stream.read(&mut scratch[filled..cap]).await?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&scratch[..filled]) {
            Ok(httparse::Status::Complete(head_len)) => {
                let version = match parsed.version {
                    Some(0) => 10,
                    _ => 11,
                };
                let mut request = Request::new(
                    parsed.method.unwrap_or(""),
                    parsed.path.unwrap_or(""),
                    version,
                );
                for header in parsed.headers.iter() {
                    request.headers.append(
                        header.name,
                        String::from_utf8_lossy(header.value).into_owned(),
                    );
                }
                break (request, head_len);
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Ok(None),
        }
    };

    let mut cursor = BodyCursor {
        stream,
        pending: scratch[head_len..filled].to_vec(),
        pos: 0,
    };

    let chunked = request
        .headers
        .get("Transfer-Encoding")
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
        })
        .unwrap_or(false);

    if chunked {
        match read_chunked_body(&mut cursor).await? {
            Some(body) => request.set_body(body),
            None => return Ok(None),
        }
    } else if let Some(value) = request.headers.get("Content-Length") {
        let Ok(length) = value.parse::<usize>() else {
            return Ok(None);
        };
        if length > MAX_BODY_BYTES {
            return Ok(None);
        }
        let mut body = Vec::with_capacity(length.min(64 * 1024));
        if !cursor.read_exact_into(length, &mut body).await? {
            return Ok(None);
        }
        request.set_body(body);
    }

    Ok(Some((request, cursor.into_leftover())))
}

/// Buffered view over the bytes read past the head plus the live stream
struct BodyCursor<'a, R> {
    stream: &'a mut R,
    pending: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> BodyCursor<'_, R> {
    async fn next_byte(&mut self) -> io::Result<Option<u8>> {
        if self.pos >= self.pending.len() {
            self.pending.clear();
            self.pos = 0;
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
        let byte = self.pending[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }

    /// Append exactly `n` bytes to `out`; false means the stream ended early
    async fn read_exact_into(&mut self, mut n: usize, out: &mut Vec<u8>) -> io::Result<bool> {
        let available = self.pending.len() - self.pos;
        let take = available.min(n);
        out.extend_from_slice(&self.pending[self.pos..self.pos + take]);
        self.pos += take;
        n -= take;

        while n > 0 {
            let mut buf = [0u8; 8192];
            let want = n.min(buf.len());
            let got = self.stream.read(&mut buf[..want]).await?;
            if got == 0 {
                return Ok(false);
            }
            out.extend_from_slice(&buf[..got]);
            n -= got;
        }
        Ok(true)
    }

    /// Read one CRLF-terminated line, without the terminator
    async fn read_line(&mut self, max: usize) -> io::Result<Option<String>> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            let Some(byte) = self.next_byte().await? else {
                return Ok(None);
            };
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > max {
                return Ok(None);
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    fn into_leftover(self) -> Vec<u8> {
        self.pending[self.pos..].to_vec()
    }
}

/// Decode a chunked body into memory, bounded by [`MAX_BODY_BYTES`]
async fn read_chunked_body<R>(cursor: &mut BodyCursor<'_, R>) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let Some(line) = cursor.read_line(MAX_CHUNK_LINE).await? else {
            return Ok(None);
        };
        let size_str = line.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_str, 16) else {
            return Ok(None);
        };
        if size == 0 {
            break;
        }
        if body.len() + size > MAX_BODY_BYTES {
            return Ok(None);
        }
        if !cursor.read_exact_into(size, &mut body).await? {
            return Ok(None);
        }
        // CRLF after the chunk data
        match cursor.read_line(2).await? {
            Some(rest) if rest.is_empty() => {}
            _ => return Ok(None),
        }
    }

    // Trailer section ends with an empty line
    loop {
        match cursor.read_line(MAX_HEADER_BYTES).await? {
            Some(line) if line.is_empty() => break,
            Some(_) => continue,
            None => return Ok(None),
        }
    }

    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::super::Method;
    use super::*;

    async fn parse(input: &[u8]) -> io::Result<Option<(Request, Vec<u8>)>> {
        let mut scratch = vec![0u8; 16 * 1024];
        let mut wire = input;
        read_request(&mut wire, &mut scratch).await
    }

    #[tokio::test]
    async fn test_simple_get() {
        let (req, leftover) = parse(b"GET /index HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.target(), "/index");
        assert_eq!(req.version(), 11);
        assert_eq!(req.headers.get("host"), Some("example.com"));
        assert!(req.body().is_empty());
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_content_length_body_and_pipelined_leftover() {
        let (req, leftover) =
            parse(b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhelloGET /next")
                .await
                .unwrap()
                .unwrap();

        assert_eq!(req.body(), b"hello");
        assert_eq!(leftover, b"GET /next");
    }

    #[tokio::test]
    async fn test_chunked_body_is_decoded() {
        let (req, leftover) = parse(
            b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nEXTRA",
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(req.body(), b"Wikipedia");
        // Decoding replaced the chunked framing with a plain length
        assert!(!req.headers.contains("transfer-encoding"));
        assert_eq!(req.headers.get("content-length"), Some("9"));
        assert_eq!(leftover, b"EXTRA");
    }

    #[tokio::test]
    async fn test_head_arriving_in_fragments() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for piece in [
                &b"GET /slow HT"[..],
                b"TP/1.1\r\nHo",
                b"st: h\r\nContent-Le",
                b"ngth: 3\r\n\r\nab",
                b"c",
            ] {
                client.write_all(piece).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut scratch = vec![0u8; 16 * 1024];
        let (req, leftover) = read_request(&mut server, &mut scratch)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(req.target(), "/slow");
        assert_eq!(req.body(), b"abc");
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_extensions_and_trailers_are_tolerated() {
        let (req, _) = parse(
            b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
              3;ext=1\r\nabc\r\n0\r\nX-Trailer: v\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(req.body(), b"abc");
    }

    #[tokio::test]
    async fn test_malformed_chunk_size_is_rejected() {
        assert!(parse(
            b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nabc\r\n"
        )
        .await
        .unwrap()
        .is_none());
    }

    #[tokio::test]
    async fn test_bad_content_length_is_rejected() {
        assert!(
            parse(b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: ten\r\n\r\n")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_http_10_version() {
        let (req, _) = parse(b"GET / HTTP/1.0\r\n\r\n").await.unwrap().unwrap();
        assert_eq!(req.version(), 10);
        assert!(!req.keep_alive());
    }

    #[tokio::test]
    async fn test_eof_before_any_bytes() {
        assert!(parse(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_headers() {
        assert!(parse(b"GET / HTTP/1.1\r\nHost: exa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        assert!(parse(b"\x00\x01\x02\x03garbage\r\n\r\n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_head_is_rejected() {
        let mut input = b"GET / HTTP/1.1\r\n".to_vec();
        input.extend_from_slice(b"X-Pad: ");
        input.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES));
        input.extend_from_slice(b"\r\n\r\n");

        assert!(parse(&input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_declared_body_over_limit_is_rejected() {
        let input = format!(
            "POST / HTTP/1.1\r\nHost: h\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        assert!(parse(input.as_bytes()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_rejected() {
        assert!(
            parse(b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\nabc")
                .await
                .unwrap()
                .is_none()
        );
    }
}

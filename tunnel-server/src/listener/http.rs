use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::dispatcher::handle_public_connection;
use crate::metrics::MetricsSink;
use crate::registry::{ControlRegistry, TunnelRegistry};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Runs the public HTTP or HTTPS listener. `tls_acceptor` is `Some` only
/// for the HTTPS instance; the HTTP instance serves plaintext directly.
pub async fn run(
    addr: SocketAddr,
    proto: &'static str,
    tls_acceptor: Option<TlsAcceptor>,
    tunnels: Arc<TunnelRegistry>,
    controls: Arc<ControlRegistry>,
    metrics: Arc<dyn MetricsSink>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, proto, "public listener started");
    loop {
        let (stream, peer) = listener.accept().await?;
        let tunnels = Arc::clone(&tunnels);
        let controls = Arc::clone(&controls);
        let metrics = Arc::clone(&metrics);
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => handle_conn(tls, proto, peer, tunnels, controls, metrics).await,
                    Err(e) => tracing::debug!(error = %e, %peer, "tls handshake failed"),
                },
                None => handle_conn(stream, proto, peer, tunnels, controls, metrics).await,
            }
        });
    }
}

async fn handle_conn<S>(
    mut stream: S,
    proto: &'static str,
    peer: SocketAddr,
    tunnels: Arc<TunnelRegistry>,
    controls: Arc<ControlRegistry>,
    metrics: Arc<dyn MetricsSink>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let parsed = tokio::time::timeout(HEADER_READ_TIMEOUT, read_headers(&mut stream)).await;
    let (buf, host, auth_header) = match parsed {
        Ok(Ok(Some(parts))) => parts,
        Ok(Ok(None)) => return,
        Ok(Err(HeaderError::Malformed)) => {
            let _ = write_response(&mut stream, 400, "Bad Request", "malformed request").await;
            return;
        }
        Ok(Err(HeaderError::TooLarge)) => {
            let _ = write_response(&mut stream, 400, "Bad Request", "request headers too large").await;
            return;
        }
        Err(_) => return,
    };

    let Some(host) = host else {
        let _ = write_response(&mut stream, 400, "Bad Request", "missing Host header").await;
        return;
    };

    let canonical = canonical_host(proto, &host);
    let key = format!("{proto}://{canonical}");

    let Some(tunnel) = tunnels.get(&key) else {
        let body = format!("Tunnel {host} not found");
        let _ = write_response(&mut stream, 404, "Not Found", &body).await;
        return;
    };

    if !tunnel.req.http_auth.is_empty() {
        let provided = auth_header.unwrap_or_default();
        let matches = provided.as_bytes().ct_eq(tunnel.req.http_auth.as_bytes()).into();
        if !matches {
            let mut resp = String::new();
            resp.push_str("HTTP/1.1 401 Unauthorized\r\n");
            resp.push_str(&format!("WWW-Authenticate: Basic realm=\"{host}\"\r\n"));
            resp.push_str("Content-Length: 0\r\n\r\n");
            let _ = stream.write_all(resp.as_bytes()).await;
            return;
        }
    }

    tracing::debug!(%peer, url = %tunnel.url, "routing public connection");
    let prefixed = PrefixedStream::new(buf, stream);
    handle_public_connection(tunnel, controls, metrics, prefixed, peer).await;
}

enum HeaderError {
    Malformed,
    TooLarge,
}

/// Reads just enough bytes to parse the request line and headers (not the
/// body), returning the raw bytes read (to be replayed ahead of the proxied
/// stream), the lowercased `Host` header, and the raw `Authorization`
/// header value if present. Returns `Ok(None)` on a clean EOF before any
/// bytes were read.
async fn read_headers<S>(
    stream: &mut S,
) -> Result<Option<(Vec<u8>, Option<String>, Option<String>)>, HeaderError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await.map_err(|_| HeaderError::Malformed)?;
        if n == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(HeaderError::Malformed)
            };
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(HeaderError::TooLarge);
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf) {
            Ok(httparse::Status::Complete(_)) => {
                let host = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .map(|h| String::from_utf8_lossy(h.value).to_string());
                let auth = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("authorization"))
                    .map(|h| String::from_utf8_lossy(h.value).to_string());
                return Ok(Some((buf, host, auth)));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(HeaderError::Malformed),
        }
    }
}

fn canonical_host(proto: &str, host: &str) -> String {
    let host = host.to_lowercase();
    let default_port = if proto == "https" { ":443" } else { ":80" };
    host.strip_suffix(default_port).unwrap_or(&host).to_string()
}

async fn write_response<S>(stream: &mut S, code: u16, reason: &str, body: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let resp = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(resp.as_bytes()).await
}

/// Replays bytes already consumed while sniffing the `Host` header ahead
/// of whatever remains unread on `inner`, so the proxied side sees the
/// original request byte-for-byte.
struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        PrefixedStream { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_host_strips_default_port() {
        assert_eq!(canonical_host("http", "Example.COM:80"), "example.com");
        assert_eq!(canonical_host("https", "example.com:443"), "example.com");
        assert_eq!(canonical_host("http", "example.com:8080"), "example.com:8080");
    }

    #[tokio::test]
    async fn prefixed_stream_replays_consumed_bytes_first() {
        let (inner, mut peer) = tokio::io::duplex(64);
        let mut prefixed = PrefixedStream::new(b"GET / HTTP/1.1\r\n\r\n".to_vec(), inner);

        peer.write_all(b"trailer").await.unwrap();

        let mut buf = vec![0u8; 18];
        prefixed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");

        let mut rest = vec![0u8; 7];
        prefixed.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"trailer");
    }

    #[tokio::test]
    async fn read_headers_extracts_host_and_authorization() {
        let (mut peer, inner) = tokio::io::duplex(256);
        peer.write_all(b"GET /x HTTP/1.1\r\nHost: foo.example.com\r\nAuthorization: Basic abc\r\n\r\n")
            .await
            .unwrap();
        drop(peer);

        let mut stream = inner;
        let (_, host, auth) = read_headers(&mut stream).await.unwrap().unwrap();
        assert_eq!(host.as_deref(), Some("foo.example.com"));
        assert_eq!(auth.as_deref(), Some("Basic abc"));
    }
}

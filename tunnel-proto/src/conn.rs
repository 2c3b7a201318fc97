use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::ident::new_req_id;

/// Wraps any byte stream with an identity, a mutable type label for log
/// correlation, an optional per-call deadline the caller consults, and a
/// read-side half-close that doesn't touch the write side.
///
/// Requires `S: Unpin` so poll methods can reach into the inner stream
/// without pinning gymnastics; every stream this wraps (`TcpStream`,
/// `TlsStream<TcpStream>`) satisfies that already.
pub struct LoggedConn<S> {
    inner: S,
    id: String,
    kind: Mutex<&'static str>,
    deadline: Mutex<Option<Duration>>,
    read_shutdown: AtomicBool,
}

impl<S> LoggedConn<S> {
    pub fn new(inner: S, kind: &'static str) -> Self {
        LoggedConn {
            inner,
            id: new_req_id(),
            kind: Mutex::new(kind),
            deadline: Mutex::new(None),
            read_shutdown: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &'static str {
        *self.kind.lock().unwrap()
    }

    pub fn set_kind(&self, kind: &'static str) {
        *self.kind.lock().unwrap() = kind;
    }

    pub fn set_deadline(&self, d: Duration) {
        *self.deadline.lock().unwrap() = Some(d);
    }

    pub fn clear_deadline(&self) {
        *self.deadline.lock().unwrap() = None;
    }

    pub fn deadline(&self) -> Option<Duration> {
        *self.deadline.lock().unwrap()
    }

    /// Half-closes the read side: subsequent reads observe EOF immediately,
    /// but writes continue to reach `inner`.
    pub fn shutdown_read(&self) {
        self.read_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> std::fmt::Display for LoggedConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for LoggedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.read_shutdown.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for LoggedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn shutdown_read_yields_eof_without_closing_writes() {
        let (a, mut b) = duplex(64);
        let conn = LoggedConn::new(a, "pub");
        conn.shutdown_read();

        let mut conn = conn;
        let mut buf = [0u8; 8];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        conn.write_all(b"hi").await.unwrap();
        let mut got = [0u8; 2];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hi");
    }

    #[tokio::test]
    async fn deadline_round_trips() {
        let (a, _b) = duplex(64);
        let conn = LoggedConn::new(a, "ctl");
        assert_eq!(conn.deadline(), None);
        conn.set_deadline(Duration::from_secs(10));
        assert_eq!(conn.deadline(), Some(Duration::from_secs(10)));
        conn.clear_deadline();
        assert_eq!(conn.deadline(), None);
    }

    #[test]
    fn display_renders_kind_and_id() {
        let (a, _b) = tokio::io::duplex(64);
        let conn = LoggedConn::new(a, "proxy");
        let rendered = format!("{conn}");
        assert!(rendered.starts_with("proxy:"));
    }
}

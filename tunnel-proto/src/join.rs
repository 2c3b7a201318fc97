use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bidirectionally copies bytes between `a` and `b` until both directions
/// have ended, closing both streams as soon as either copy direction
/// returns. Returns `(bytes a->b, bytes b->a)`.
///
/// Safe to call on streams that the caller has already begun shutting
/// down; a copy that immediately sees EOF just returns 0 for that
/// direction.
pub async fn join<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut a_rd, mut a_wr) = split(a);
    let (mut b_rd, mut b_wr) = split(b);

    let a_to_b = tokio::spawn(async move {
        let n = tokio::io::copy(&mut a_rd, &mut b_wr).await.unwrap_or(0);
        let _ = b_wr.shutdown().await;
        n
    });
    let b_to_a = tokio::spawn(async move {
        let n = tokio::io::copy(&mut b_rd, &mut a_wr).await.unwrap_or(0);
        let _ = a_wr.shutdown().await;
        n
    });

    let (ab, ba) = tokio::join!(a_to_b, b_to_a);
    (ab.unwrap_or(0), ba.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn joins_two_duplex_pairs_until_both_ends_close() {
        let (client_a, mut test_a) = duplex(64);
        let (client_b, mut test_b) = duplex(64);

        let handle = tokio::spawn(join(client_a, client_b));

        test_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        test_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        test_b.write_all(b"pong").await.unwrap();
        let mut buf2 = [0u8; 4];
        test_a.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"pong");

        drop(test_a);
        drop(test_b);

        let (ab, ba) = handle.await.unwrap();
        assert_eq!(ab, 4);
        assert_eq!(ba, 4);
    }
}

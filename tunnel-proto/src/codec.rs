use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

/// Frames larger than this are rejected outright; nothing in this protocol
/// legitimately needs more (the largest payload is a `ReqTunnel`/`NewTunnel`).
pub const MAX_FRAME_LEN: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length {0} exceeds maximum of {MAX_FRAME_LEN}")]
    OversizeFrame(u64),
    #[error("malformed frame: {0}")]
    BadFrame(#[from] serde_json::Error),
    #[error("unrecognized message type in frame")]
    UnknownType,
}

/// Reads one length-prefixed JSON envelope. Returns `Ok(None)` on a clean
/// EOF at a frame boundary (the only place it's legal to stop reading).
pub async fn read_message<R>(stream: &mut R) -> Result<Option<Message>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 8];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u64::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CodecError::OversizeFrame(len));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;

    let msg: Message = serde_json::from_slice(&body)?;
    Ok(Some(msg))
}

/// Writes one length-prefixed JSON envelope and flushes the stream.
pub async fn write_message<W>(stream: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() as u64 > MAX_FRAME_LEN {
        return Err(CodecError::OversizeFrame(body.len() as u64));
    }
    stream.write_all(&(body.len() as u64).to_le_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

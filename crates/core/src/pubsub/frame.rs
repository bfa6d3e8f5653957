//! Multi-part frame codec: `u32` big-endian length prefix per frame, two
//! frames per message (topic, body).

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame.  A control message is a few hundred bytes;
/// anything near this limit is a corrupt stream.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).context("frame too large for u32 length")?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(payload).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes).await.context("connection closed")?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds maximum {MAX_FRAME_LEN}");
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await.context("truncated frame")?;
    Ok(buf)
}

/// Encode a (topic, body) message into a single buffer so fan-out can reuse
/// one allocation per publish.
pub fn encode_message(topic: &str, body: &[u8]) -> Result<Vec<u8>> {
    if !topic.is_ascii() || topic.is_empty() {
        bail!("topic must be non-empty ASCII: {topic:?}");
    }
    let mut buf = Vec::with_capacity(8 + topic.len() + body.len());
    buf.extend_from_slice(&(topic.len() as u32).to_be_bytes());
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Write one (topic, body) message.
pub async fn write_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    topic: &str,
    body: &[u8],
) -> Result<()> {
    if !topic.is_ascii() || topic.is_empty() {
        bail!("topic must be non-empty ASCII: {topic:?}");
    }
    write_frame(w, topic.as_bytes()).await?;
    write_frame(w, body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one (topic, body) message.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<(String, Vec<u8>)> {
    let topic_bytes = read_frame(r).await?;
    let topic = String::from_utf8(topic_bytes).context("topic is not valid UTF-8")?;
    let body = read_frame(r).await?;
    Ok((topic, body))
}

// ===========================================================================
// Tests
// ===========================================================================

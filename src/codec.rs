//! Length-prefixed message framing over any async byte stream.
//!
//! Frame layout: `len: u64 (big-endian) | payload[len]`, where the payload is
//! a bincode-encoded [`Message`]. A frame is only ever handed to the decoder
//! once all of its bytes have arrived, however the stream fragments them.
//!
//! Inside a frame every read and write is bounded by an idle timeout, so a
//! stalled peer is detected while a slow one is not.

use crate::operation::Message;
use crate::protocol::timeouts::IO_IDLE_MS;
use crate::protocol::{FRAME_HEADER_LEN, MAX_FRAME_SIZE};
use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

pub fn encode(message: &Message) -> Result<Vec<u8>> {
    bincode::serialize(message).context("encode message")
}

pub fn decode(payload: &[u8]) -> Result<Message> {
    let message: Message = bincode::deserialize(payload).context("decode message")?;
    message.validate()?;
    Ok(message)
}

pub fn frame_header(len: usize) -> [u8; FRAME_HEADER_LEN] {
    (len as u64).to_be_bytes()
}

/// Encode and write one message as a single frame, then flush.
pub async fn write_message<W>(stream: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode(message)?;
    write_frame(stream, &payload).await
}

pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame_idle(stream, payload, Duration::from_millis(IO_IDLE_MS)).await
}

async fn write_frame_idle<W>(stream: &mut W, payload: &[u8], idle: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        bail!(
            "frame too large: {} bytes (max: {} bytes)",
            payload.len(),
            MAX_FRAME_SIZE
        );
    }
    write_all_idle(stream, &frame_header(payload.len()), idle).await?;
    write_all_idle(stream, payload, idle).await?;
    match timeout(idle, stream.flush()).await {
        Ok(result) => result.context("frame flush"),
        Err(_) => bail!("frame flush stalled for {} ms", idle.as_millis()),
    }
}

/// `write_all` that fails only when no byte is accepted for `idle`.
async fn write_all_idle<W>(stream: &mut W, buf: &[u8], idle: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < buf.len() {
        let n = match timeout(idle, stream.write(&buf[written..])).await {
            Ok(res) => res.context("frame write")?,
            Err(_) => bail!(
                "frame write stalled for {} ms ({} of {} bytes sent)",
                idle.as_millis(),
                written,
                buf.len()
            ),
        };
        if n == 0 {
            bail!("connection closed during frame write");
        }
        written += n;
    }
    Ok(())
}

/// `read_exact` that fails only when no byte arrives for `idle`.
async fn read_exact_idle<R>(stream: &mut R, buf: &mut [u8], idle: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = match timeout(idle, stream.read(&mut buf[filled..])).await {
            Ok(res) => res.context("frame payload")?,
            Err(_) => bail!(
                "frame read stalled for {} ms ({} of {} bytes received)",
                idle.as_millis(),
                filled,
                buf.len()
            ),
        };
        if n == 0 {
            bail!("connection closed inside frame payload");
        }
        filled += n;
    }
    Ok(())
}

/// Read one full frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames; a close in the middle of a frame is an error.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    read_frame_idle(stream, Duration::from_millis(IO_IDLE_MS)).await
}

async fn read_frame_idle<R>(stream: &mut R, idle: Duration) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    // Waiting for the next frame is unbounded; only a started frame can stall.
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    let n = stream.read(&mut hdr).await.context("frame header")?;
    if n == 0 {
        return Ok(None);
    }
    if n < FRAME_HEADER_LEN {
        read_exact_idle(stream, &mut hdr[n..], idle)
            .await
            .context("connection closed inside frame header")?;
    }

    let len = u64::from_be_bytes(hdr);
    if len > MAX_FRAME_SIZE as u64 {
        bail!(
            "frame too large: {} bytes (max: {} bytes)",
            len,
            MAX_FRAME_SIZE
        );
    }
    let mut payload = vec![0u8; len as usize];
    read_exact_idle(stream, &mut payload, idle).await?;
    Ok(Some(payload))
}

/// Read and decode the next message, or `None` on a clean close.
pub async fn read_message<R>(stream: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(stream).await? {
        Some(payload) => decode(&payload).map(Some),
        None => Ok(None),
    }
}

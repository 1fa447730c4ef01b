// Low-level frame IO for control messages on a service stream.
use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use relay_wire::{Frame, FrameHeader, ServiceMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(thiserror::Error, Debug)]
pub(crate) enum WriteError {
    #[error("encode frame: {0}")]
    Encode(#[from] relay_wire::Error),
    #[error("write frame: {0}")]
    Io(#[from] std::io::Error),
}

/// Read one framed control message. `Ok(None)` means the peer finished the
/// stream cleanly at a frame boundary; EOF mid-frame is an error.
pub(crate) async fn read_message<R>(
    recv: &mut R,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<ServiceMessage>>
where
    R: AsyncRead + Send + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read frame header"),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;

    // Enforce the frame cap before allocating for the payload.
    if length > max_frame_bytes {
        return Err(anyhow!(
            "frame too large: {length} bytes (cap {max_frame_bytes}); refusing"
        ));
    }

    // Reuse the scratch buffer to avoid per-frame allocations.
    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;

    let frame = Frame {
        header,
        payload: scratch.split().freeze(),
    };
    ServiceMessage::decode(frame)
        .map(Some)
        .context("decode control message")
}

pub(crate) async fn write_message<W>(
    send: &mut W,
    message: &ServiceMessage,
) -> std::result::Result<(), WriteError>
where
    W: AsyncWrite + Send + Unpin,
{
    let frame = message.encode()?;
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes).await?;
    send.write_all(&frame.payload).await?;
    send.flush().await?;
    Ok(())
}

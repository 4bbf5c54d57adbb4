//! Length-prefixed framing for the control socket.
//!
//! A frame is a 4-byte big-endian payload length followed by exactly that many
//! payload bytes. The codec itself has no size limit; the broker reads the
//! length first with `read_frame_len`, applies its own policy, and only then
//! reads the body.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the stream cleanly before sending any header byte.
    #[error("stream closed before a frame started")]
    Closed,

    /// The stream ended part-way through a header or body.
    #[error("stream closed after {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },

    #[error("payload of {0} bytes does not fit a u32 length prefix")]
    TooLarge(usize),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read the 4-byte length prefix of the next frame.
pub async fn read_frame_len<R>(reader: &mut R) -> Result<u32, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    match got {
        0 => Err(FrameError::Closed),
        n if n < FRAME_HEADER_LEN => Err(FrameError::Truncated {
            expected: FRAME_HEADER_LEN,
            got: n,
        }),
        _ => Ok(u32::from_be_bytes(header)),
    }
}

/// Read exactly `len` payload bytes. A short read is an error, never a
/// truncated success.
pub async fn read_frame_body<R>(reader: &mut R, len: u32) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let expected = len as usize;
    let mut body = vec![0u8; expected];
    let got = read_full(reader, &mut body).await?;
    if got != expected {
        return Err(FrameError::Truncated { expected, got });
    }
    Ok(body)
}

/// Read one complete frame with no size limit.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = read_frame_len(reader).await?;
    read_frame_body(reader, len).await
}

/// Encode a frame into a single buffer. The declared length is always the
/// payload length.
pub fn encode_frame(payload: &[u8]) -> Result<BytesMut, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf)
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(payload)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Fill `buf` until it is full or the stream reports EOF. Returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

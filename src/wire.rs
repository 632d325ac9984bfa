//! Framed message codec
//!
//! The bus moves opaque messages over TCP as length-prefixed frames: a
//! 32-bit big-endian payload length followed by the payload. Marshalling of
//! message contents belongs to the router layer; the transport only frames.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload (1 MiB). A peer announcing more
/// than this is corrupt or hostile and the connection is dropped.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// One bus message as carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Read one frame. `Ok(None)` signals a clean EOF on the frame boundary;
/// an EOF in the middle of a frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {} exceeds maximum {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut payload = BytesMut::with_capacity(len);
    payload.resize(len, 0);
    reader.read_exact(&mut payload).await?;

    Ok(Some(Message {
        payload: payload.freeze(),
    }))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = msg.payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&msg.payload).await?;
    writer.flush().await
}

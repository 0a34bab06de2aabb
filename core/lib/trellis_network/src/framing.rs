use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::traits::{DuplexStream, TransportError, TransportResult};

/// Upper bound on a single frame. A peer sending more is misbehaving, not
/// just chatty.
pub const FRAME_CAP: usize = 16 * 1024 * 1024;

/// Writes one length-prefixed bincode frame: a big-endian u32 length
/// followed by the payload bytes.
pub async fn write_frame<S, T>(stream: &mut S, value: &T) -> TransportResult<()>
where
    S: DuplexStream + ?Sized,
    T: Serialize,
{
    let payload = bincode::serialize(value)?;
    if payload.len() > FRAME_CAP {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: FRAME_CAP,
        });
    }
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed bincode frame, rejecting unbounded messages.
pub async fn read_frame<S, T>(stream: &mut S) -> TransportResult<T>
where
    S: DuplexStream + ?Sized,
    T: DeserializeOwned,
{
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed)
        }
        Err(err) => return Err(err.into()),
    };
    if len > FRAME_CAP {
        return Err(TransportError::FrameTooLarge {
            len,
            max: FRAME_CAP,
        });
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
            _ => TransportError::Io(err),
        })?;
    Ok(bincode::deserialize(&payload)?)
}

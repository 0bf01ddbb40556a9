//! Length-prefixed codec for signaling and channel frames.
//!
//! Signaling frames are `u32` (big-endian) length followed by the JSON body.
//! Channel frames add a one-byte marker between the length and the body so
//! raw chunks avoid JSON entirely.

use crate::frame::{ChannelControl, ChannelFrame, FRAME_CHUNK, FRAME_CONTROL};
use crate::message::SignalMessage;
use crate::MAX_CHUNK_SIZE;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted signaling frame.
pub const MAX_SIGNAL_FRAME: usize = 1 << 20;

/// Largest accepted channel frame: one max-size chunk plus header slack.
pub const MAX_CHANNEL_FRAME: usize = MAX_CHUNK_SIZE + (1 << 16);

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON body.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Declared length exceeds the frame cap.
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Unknown channel frame marker.
    #[error("unknown frame marker: 0x{0:02X}")]
    UnknownMarker(u8),
}

/// Write one signaling message.
pub async fn write_signal<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &SignalMessage,
) -> Result<(), CodecError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_SIGNAL_FRAME {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one signaling message.
pub async fn read_signal<R: AsyncRead + Unpin>(r: &mut R) -> Result<SignalMessage, CodecError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_SIGNAL_FRAME {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write one channel frame.
pub async fn write_channel_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &ChannelFrame,
) -> Result<(), CodecError> {
    match frame {
        ChannelFrame::Control(control) => {
            let body = serde_json::to_vec(control)?;
            if body.len() > MAX_CHANNEL_FRAME {
                return Err(CodecError::FrameTooLarge(body.len()));
            }
            w.write_all(&[FRAME_CONTROL]).await?;
            w.write_all(&(body.len() as u32).to_be_bytes()).await?;
            w.write_all(&body).await?;
        }
        ChannelFrame::Chunk(bytes) => {
            if bytes.len() > MAX_CHANNEL_FRAME {
                return Err(CodecError::FrameTooLarge(bytes.len()));
            }
            w.write_all(&[FRAME_CHUNK]).await?;
            w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
            w.write_all(bytes).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

/// Read one channel frame.
pub async fn read_channel_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ChannelFrame, CodecError> {
    let mut marker = [0u8; 1];
    r.read_exact(&mut marker).await?;
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_CHANNEL_FRAME {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;

    match marker[0] {
        FRAME_CONTROL => {
            let control: ChannelControl = serde_json::from_slice(&body)?;
            Ok(ChannelFrame::Control(control))
        }
        FRAME_CHUNK => Ok(ChannelFrame::Chunk(body)),
        other => Err(CodecError::UnknownMarker(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SignalMessage;

    #[tokio::test]
    async fn signal_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = SignalMessage::ClientInit {
            client_id: "client_1".into(),
            device_name: None,
        };
        write_signal(&mut a, &msg).await.unwrap();
        let back = read_signal(&mut b).await.unwrap();
        assert_eq!(msg, back);
    }

    #[tokio::test]
    async fn channel_frames_interleave() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);
        let info = ChannelFrame::Control(ChannelControl::FileInfo {
            file_name: "x".into(),
            file_size: 3,
            relative_path: "x".into(),
        });
        let chunk = ChannelFrame::Chunk(vec![1, 2, 3]);
        let done = ChannelFrame::Control(ChannelControl::FileComplete);

        write_channel_frame(&mut a, &info).await.unwrap();
        write_channel_frame(&mut a, &chunk).await.unwrap();
        write_channel_frame(&mut a, &done).await.unwrap();

        assert_eq!(read_channel_frame(&mut b).await.unwrap(), info);
        assert_eq!(read_channel_frame(&mut b).await.unwrap(), chunk);
        assert_eq!(read_channel_frame(&mut b).await.unwrap(), done);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, _b) = tokio::io::duplex(64);
        let chunk = ChannelFrame::Chunk(vec![0u8; MAX_CHANNEL_FRAME + 1]);
        let err = write_channel_frame(&mut a, &chunk).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn oversized_declared_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &u32::MAX.to_be_bytes())
            .await
            .unwrap();
        let err = read_signal(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn unknown_marker_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0x7F, 0, 0, 0, 0])
            .await
            .unwrap();
        let err = read_channel_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::UnknownMarker(0x7F)));
    }
}

//! File transfer over an open channel.
//!
//! The sender announces a file with `file-info`, streams paced chunk frames,
//! and terminates with `file-complete`. The receiver accumulates chunks
//! against the announced size and treats any byte-count mismatch as a
//! protocol violation rather than guessing.

use crate::chunker::ChunkPolicy;
use crate::error::EngineError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subdrop_proto::codec::write_channel_frame;
use subdrop_proto::frame::{ChannelControl, ChannelFrame};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::trace;

/// Outgoing file: already sealed (or passed through) by the caller.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub file_name: String,
    pub relative_path: String,
    pub data: Vec<u8>,
}

/// Stream one file over the channel writer.
///
/// The writer lock is released between chunks so chat frames and other
/// transfers on the same channel can interleave. `on_progress` is called
/// with the percentage sent after every chunk, ending at exactly 100.0.
pub async fn send_file_over<W, P>(
    writer: Arc<Mutex<W>>,
    file: &OutgoingFile,
    policy: &mut dyn ChunkPolicy,
    pacing: Duration,
    mut on_progress: P,
) -> Result<(), EngineError>
where
    W: AsyncWrite + Unpin + Send,
    P: FnMut(f64),
{
    {
        let mut w = writer.lock().await;
        write_channel_frame(
            &mut *w,
            &ChannelFrame::Control(ChannelControl::FileInfo {
                file_name: file.file_name.clone(),
                file_size: file.data.len() as u64,
                relative_path: file.relative_path.clone(),
            }),
        )
        .await?;
    }

    let total = file.data.len();
    let mut sent = 0usize;
    while sent < total {
        let size = policy.chunk_size().min(total - sent);
        let chunk = file.data[sent..sent + size].to_vec();

        let started = Instant::now();
        {
            let mut w = writer.lock().await;
            write_channel_frame(&mut *w, &ChannelFrame::Chunk(chunk)).await?;
        }
        policy.record(size, started.elapsed());

        sent += size;
        let progress = sent as f64 / total as f64 * 100.0;
        trace!(file = file.file_name, progress, "chunk sent");
        on_progress(progress);

        if sent < total && !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }

    {
        let mut w = writer.lock().await;
        write_channel_frame(&mut *w, &ChannelFrame::Control(ChannelControl::FileComplete))
            .await?;
    }
    if total == 0 {
        on_progress(100.0);
    }
    Ok(())
}

/// A fully received file, still sealed if the sender encrypted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_name: String,
    pub relative_path: String,
    pub data: Vec<u8>,
}

struct InFlight {
    file_name: String,
    relative_path: String,
    expected: u64,
    data: Vec<u8>,
}

/// Receiver-side assembly of one channel's incoming files.
///
/// Files on one channel arrive strictly sequentially, so a single in-flight
/// slot is enough; overlapping announcements are a violation.
#[derive(Default)]
pub struct ReceiveState {
    current: Option<InFlight>,
}

impl ReceiveState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A file is currently being assembled.
    pub fn in_flight(&self) -> bool {
        self.current.is_some()
    }

    /// Name of the file currently being assembled.
    pub fn current_name(&self) -> Option<&str> {
        self.current.as_ref().map(|f| f.file_name.as_str())
    }

    /// Percentage of the announced size received so far.
    pub fn progress(&self) -> Option<f64> {
        let current = self.current.as_ref()?;
        if current.expected == 0 {
            return Some(100.0);
        }
        Some(current.data.len() as f64 / current.expected as f64 * 100.0)
    }

    /// Handle `file-info`.
    pub fn on_file_info(
        &mut self,
        file_name: String,
        file_size: u64,
        relative_path: String,
    ) -> Result<(), EngineError> {
        if self.current.is_some() {
            return Err(EngineError::ProtocolViolation(
                "file-info while a file is in flight".into(),
            ));
        }
        self.current = Some(InFlight {
            file_name,
            relative_path,
            expected: file_size,
            data: Vec::with_capacity(file_size.min(64 * 1024 * 1024) as usize),
        });
        Ok(())
    }

    /// Handle one chunk frame. Receiving more bytes than announced aborts
    /// the file immediately.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), EngineError> {
        let current = self.current.as_mut().ok_or_else(|| {
            EngineError::ProtocolViolation("chunk without file-info".into())
        })?;
        if current.data.len() as u64 + chunk.len() as u64 > current.expected {
            self.current = None;
            return Err(EngineError::ProtocolViolation(
                "more bytes than announced".into(),
            ));
        }
        current.data.extend_from_slice(chunk);
        Ok(())
    }

    /// Handle `file-complete`, yielding the assembled file.
    pub fn on_complete(&mut self) -> Result<ReceivedFile, EngineError> {
        let current = self.current.take().ok_or_else(|| {
            EngineError::ProtocolViolation("file-complete without file-info".into())
        })?;
        if current.data.len() as u64 != current.expected {
            return Err(EngineError::ProtocolViolation(format!(
                "file truncated: {} of {} bytes",
                current.data.len(),
                current.expected
            )));
        }
        Ok(ReceivedFile {
            file_name: current.file_name,
            relative_path: current.relative_path,
            data: current.data,
        })
    }

    /// The channel died; report whether a partial file was lost.
    pub fn on_channel_closed(&mut self) -> Option<String> {
        self.current.take().map(|f| f.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::FixedChunk;
    use subdrop_proto::codec::read_channel_frame;

    fn outgoing(name: &str, data: Vec<u8>) -> OutgoingFile {
        OutgoingFile {
            file_name: name.into(),
            relative_path: name.into(),
            data,
        }
    }

    async fn drive_receive(
        reader: &mut (impl tokio::io::AsyncRead + Unpin),
    ) -> Result<ReceivedFile, EngineError> {
        let mut state = ReceiveState::new();
        loop {
            match read_channel_frame(reader).await? {
                ChannelFrame::Control(ChannelControl::FileInfo {
                    file_name,
                    file_size,
                    relative_path,
                }) => state.on_file_info(file_name, file_size, relative_path)?,
                ChannelFrame::Chunk(chunk) => state.on_chunk(&chunk)?,
                ChannelFrame::Control(ChannelControl::FileComplete) => {
                    return state.on_complete()
                }
                ChannelFrame::Control(ChannelControl::ChatMessage { .. }) => {}
            }
        }
    }

    #[tokio::test]
    async fn round_trip_with_monotonic_progress() {
        let (a, mut b) = tokio::io::duplex(1 << 20);
        let writer = Arc::new(Mutex::new(a));
        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let file = outgoing("blob.bin", data.clone());

        let mut progress = Vec::new();
        let mut chunker = FixedChunk(8 * 1024);
        let send = send_file_over(
            writer,
            &file,
            &mut chunker,
            Duration::ZERO,
            |p| progress.push(p),
        );
        let (sent, received) = tokio::join!(send, drive_receive(&mut b));
        sent.unwrap();
        let received = received.unwrap();

        assert_eq!(received.data, data);
        assert_eq!(received.file_name, "blob.bin");
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn empty_file_completes_at_full_progress() {
        let (a, mut b) = tokio::io::duplex(4096);
        let writer = Arc::new(Mutex::new(a));
        let file = outgoing("empty.txt", Vec::new());

        let mut progress = Vec::new();
        let mut chunker = FixedChunk::default();
        let send =
            send_file_over(writer, &file, &mut chunker, Duration::ZERO, |p| {
                progress.push(p)
            });
        let (sent, received) = tokio::join!(send, drive_receive(&mut b));
        sent.unwrap();
        assert!(received.unwrap().data.is_empty());
        assert_eq!(progress, vec![100.0]);
    }

    #[test]
    fn overrun_is_a_violation() {
        let mut state = ReceiveState::new();
        state.on_file_info("x".into(), 4, "x".into()).unwrap();
        state.on_chunk(&[1, 2, 3]).unwrap();
        let err = state.on_chunk(&[4, 5]).unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
        assert!(!state.in_flight());
    }

    #[test]
    fn truncation_is_a_violation() {
        let mut state = ReceiveState::new();
        state.on_file_info("x".into(), 10, "x".into()).unwrap();
        state.on_chunk(&[0; 4]).unwrap();
        let err = state.on_complete().unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
    }

    #[test]
    fn chunk_before_info_is_a_violation() {
        let mut state = ReceiveState::new();
        assert!(matches!(
            state.on_chunk(&[0]),
            Err(EngineError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn overlapping_file_info_is_a_violation() {
        let mut state = ReceiveState::new();
        state.on_file_info("a".into(), 1, "a".into()).unwrap();
        assert!(matches!(
            state.on_file_info("b".into(), 1, "b".into()),
            Err(EngineError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn channel_close_reports_partial_file() {
        let mut state = ReceiveState::new();
        assert_eq!(state.on_channel_closed(), None);
        state.on_file_info("half.bin".into(), 8, String::new()).unwrap();
        state.on_chunk(&[0; 4]).unwrap();
        assert_eq!(state.on_channel_closed().as_deref(), Some("half.bin"));
    }
}

//! Data-channel framing.
//!
//! The peer-to-peer channel interleaves JSON control frames with raw binary
//! chunk frames. A one-byte marker distinguishes the two; binary frames are
//! only meaningful between a `file-info` and its matching `file-complete`.

use crate::message::ChatPayload;
use serde::{Deserialize, Serialize};

/// Marker byte for JSON control frames.
pub const FRAME_CONTROL: u8 = 0x01;

/// Marker byte for raw binary chunk frames.
pub const FRAME_CHUNK: u8 = 0x02;

/// Control frames carried on the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChannelControl {
    /// Announces the file whose chunks follow.
    FileInfo {
        file_name: String,
        file_size: u64,
        #[serde(default)]
        relative_path: String,
    },
    /// Terminates the chunk sequence started by the last `file-info`.
    FileComplete,
    /// Chat delivered directly over the channel.
    ChatMessage { message: ChatPayload },
}

/// One frame on the data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Control(ChannelControl),
    Chunk(Vec<u8>),
}

impl ChannelFrame {
    /// Marker byte for this frame.
    pub fn marker(&self) -> u8 {
        match self {
            ChannelFrame::Control(_) => FRAME_CONTROL,
            ChannelFrame::Chunk(_) => FRAME_CHUNK,
        }
    }
}

//! Frame header and packet types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::Source;

/// Description of one decoded frame.
///
/// Produced by the reader for every frame it decodes; owned by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Id of the source that produced the frame
    pub source: usize,
    /// Reader-local count of frames of this source since the last position reset
    pub sequence_num: u64,
    /// Capture time in microseconds
    pub time_us: i64,
    /// Payload size in bytes
    pub size: u64,
    /// Earliest re-entry point, including a preceding metadata record
    pub frame_start_offset: u64,
    /// Offset of the payload record's tag
    pub payload_header_offset: u64,
    /// Metadata attached to this frame, if any
    pub metadata: Option<Value>,
}

impl FrameHeader {
    /// Capture time as wall-clock time, or `None` if it is before the Unix epoch.
    pub fn system_time(&self) -> Option<SystemTime> {
        let micros = u64::try_from(self.time_us).ok()?;
        UNIX_EPOCH.checked_add(Duration::from_micros(micros))
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }
}

/// A fully drained frame: header, payload bytes and the declaring source.
///
/// This is the unit the async frame feed emits.
#[derive(Debug, Clone)]
pub struct FramePacket {
    /// Decoded frame header
    pub header: FrameHeader,

    /// Payload bytes (zero-copy via Arc)
    pub data: Arc<[u8]>,

    /// Source that produced the frame
    pub source: Arc<Source>,
}

impl FramePacket {
    /// Create a new frame packet
    pub fn new(header: FrameHeader, data: Vec<u8>, source: Arc<Source>) -> Self {
        Self { header, data: data.into(), source }
    }

    pub fn sequence_num(&self) -> u64 {
        self.header.sequence_num
    }

    pub fn time_us(&self) -> i64 {
        self.header.time_us
    }
}

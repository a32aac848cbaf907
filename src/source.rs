//! Source declarations and the per-source frame counters

use crate::format::{
    PKT_ALIGNMENT_BYTES, PKT_DEFINITIONS, PKT_SIZE_BYTES, SRC_DRIVER, SRC_ID, SRC_INFO, SRC_PACKET,
    SRC_URI, SRC_VERSION,
};
use crate::record::Record;
use crate::{Result, StreamError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A logical producer of frames, declared once in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Dense 0-based id, equal to the table size at declaration
    pub id: usize,
    /// Name of the driver that produced the frames
    pub driver: String,
    /// Producer URI
    pub uri: String,
    /// Opaque producer description
    pub info: Value,
    pub version: i64,
    /// Fixed payload size, 0 when every frame carries its own size
    pub frame_size_bytes: u64,
    pub alignment_bytes: u64,
    /// Payload layout definitions (not validated by the reader)
    pub layout_definitions: String,
}

impl Source {
    /// Build a source from a parsed descriptor record.
    pub(crate) fn from_record(record: &Record<'_>) -> Result<Self> {
        let id = record.u64(SRC_ID)?;
        let packet = record.nested(SRC_PACKET)?;
        Ok(Source {
            id: usize::try_from(id)
                .map_err(|_| StreamError::format_error("source descriptor", format!("source id {} is out of range", id)))?,
            driver: record.str(SRC_DRIVER)?.to_string(),
            uri: record.str(SRC_URI)?.to_string(),
            info: record.field(SRC_INFO)?.clone(),
            version: record.i64(SRC_VERSION)?,
            frame_size_bytes: packet.u64(PKT_SIZE_BYTES)?,
            alignment_bytes: packet.u64(PKT_ALIGNMENT_BYTES)?,
            layout_definitions: packet.str(PKT_DEFINITIONS)?.to_string(),
        })
    }

    /// Whether frames of this source carry an explicit size field.
    pub fn is_variable_size(&self) -> bool {
        self.frame_size_bytes == 0
    }
}

/// Ordered registry of declared sources with their running frame counters.
#[derive(Debug, Default, Clone)]
pub struct SourceTable {
    sources: Vec<Source>,
    next_sequence: Vec<u64>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly declared source. Its id must equal the current table size.
    pub fn register(&mut self, source: Source) -> Result<()> {
        if source.id != self.sources.len() {
            return Err(StreamError::format_error(
                "source declaration",
                format!(
                    "id mismatch: declared id {} but {} sources are known. Possible corrupt stream?",
                    source.id,
                    self.sources.len()
                ),
            ));
        }
        self.sources.push(source);
        self.next_sequence.push(0);
        Ok(())
    }

    pub fn get(&self, id: usize) -> Option<&Source> {
        self.sources.get(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        id < self.sources.len()
    }

    pub fn as_slice(&self) -> &[Source] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Sequence number the next frame of `id` will receive.
    pub fn next_sequence(&self, id: usize) -> Option<u64> {
        self.next_sequence.get(id).copied()
    }

    /// Count one more frame observed for `id`.
    pub fn advance(&mut self, id: usize) {
        if let Some(counter) = self.next_sequence.get_mut(id) {
            *counter += 1;
        }
    }

    /// Reset the counter of `id` alone, leaving every other source untouched.
    pub fn reset_sequence(&mut self, id: usize, sequence: u64) {
        if let Some(counter) = self.next_sequence.get_mut(id) {
            *counter = sequence;
        }
    }

    pub fn clear(&mut self) {
        self.sources.clear();
        self.next_sequence.clear();
    }
}

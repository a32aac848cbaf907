//! Test utilities for building packet streams
//!
//! The reader has no write path, so tests and benchmarks assemble streams
//! byte by byte with [`StreamBuilder`]. The builder only knows the wire
//! format; it performs no validation, which lets tests inject corruption.

#![cfg(any(test, feature = "benchmark"))]

use crate::format::{FOOTER_SIZE, MAGIC, Tag};
use serde_json::{Value, json};
use std::io::{self, Write};
use tempfile::NamedTempFile;

/// Append `value` as an unsigned LEB128 varint.
pub fn encode_uint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Descriptor JSON for a source, as a writer would emit it.
pub fn source_descriptor(id: usize, driver: &str, size_bytes: u64) -> Value {
    json!({
        "driver": driver,
        "id": id,
        "uri": format!("{}://device{}", driver, id),
        "info": { "driver": driver },
        "version": 1,
        "packet": {
            "alignment_bytes": 1,
            "definitions": "",
            "size_bytes": size_bytes
        }
    })
}

/// Incremental packet stream writer for fixtures.
#[derive(Debug, Clone, Default)]
pub struct StreamBuilder {
    bytes: Vec<u8>,
    sizes: Vec<u64>,
    offsets: Vec<Vec<u64>>,
}

impl StreamBuilder {
    /// Start a stream with the magic prefix and a header record.
    pub fn new(start_time_us: i64) -> Self {
        let mut builder = Self::default();
        builder.bytes.extend_from_slice(MAGIC);
        builder.header(start_time_us);
        builder
    }

    /// Append a header record.
    pub fn header(&mut self, start_time_us: i64) -> &mut Self {
        self.record(Tag::Header, &json!({ "time_us": start_time_us }));
        self.bytes.push(b'\n');
        self
    }

    /// Declare the next source and return its id.
    pub fn add_source(&mut self, driver: &str, size_bytes: u64) -> usize {
        let id = self.sizes.len();
        self.add_source_with_id(id, driver, size_bytes);
        id
    }

    /// Declare a source with an explicit id, which need not be the next one.
    pub fn add_source_with_id(&mut self, id: usize, driver: &str, size_bytes: u64) -> &mut Self {
        self.record(Tag::AddSource, &source_descriptor(id, driver, size_bytes));
        self.bytes.push(b'\n');
        if self.sizes.len() <= id {
            self.sizes.resize(id + 1, 0);
            self.offsets.resize(id + 1, Vec::new());
        }
        self.sizes[id] = size_bytes;
        self
    }

    /// Append a payload record. Variable-size sources get an explicit size field.
    pub fn frame(&mut self, source: usize, time_us: i64, payload: &[u8]) -> &mut Self {
        self.note_frame(source);
        self.payload(source, time_us, payload);
        self
    }

    /// Append a metadata record followed by a payload record of the same source.
    pub fn frame_with_metadata(&mut self, source: usize, time_us: i64, metadata: Value, payload: &[u8]) -> &mut Self {
        self.note_frame(source);
        self.bytes.extend_from_slice(&Tag::Metadata.bytes());
        encode_uint(source as u64, &mut self.bytes);
        self.bytes.extend_from_slice(metadata.to_string().as_bytes());
        self.payload(source, time_us, payload);
        self
    }

    /// Append a metadata record that names a different source than its payload.
    pub fn mismatched_metadata_frame(&mut self, meta_source: usize, source: usize, payload: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(&Tag::Metadata.bytes());
        encode_uint(meta_source as u64, &mut self.bytes);
        self.bytes.extend_from_slice(b"{}");
        self.payload(source, 0, payload);
        self
    }

    /// Append `count` sync tags.
    pub fn sync(&mut self, count: usize) -> &mut Self {
        for _ in 0..count {
            self.bytes.extend_from_slice(&Tag::Sync.bytes());
        }
        self
    }

    /// Append a full magic prefix mid-stream.
    pub fn magic(&mut self) -> &mut Self {
        self.bytes.extend_from_slice(MAGIC);
        self
    }

    /// Append arbitrary bytes.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Append an index record covering every frame written so far, followed by the footer.
    pub fn index_and_footer(&mut self) -> &mut Self {
        let index_offset = self.bytes.len() as u64;
        self.index_record();
        self.footer(index_offset);
        self
    }

    /// Append an index record covering every frame written so far.
    pub fn index_record(&mut self) -> &mut Self {
        let index = json!({
            "num_sources": self.offsets.len(),
            "src_packet_index": self.offsets,
        });
        self.record(Tag::Stats, &index);
        self
    }

    /// Append a footer pointing at `index_offset`.
    pub fn footer(&mut self, index_offset: u64) -> &mut Self {
        self.bytes.extend_from_slice(&Tag::Footer.bytes());
        self.bytes.extend_from_slice(&index_offset.to_le_bytes());
        debug_assert!(self.bytes.len() >= FOOTER_SIZE);
        self
    }

    /// Append an end marker.
    pub fn end(&mut self) -> &mut Self {
        self.bytes.extend_from_slice(&Tag::End.bytes());
        self
    }

    /// Current length of the stream in bytes.
    pub fn position(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Offsets of every frame written for `source`, in order.
    pub fn frame_offsets(&self, source: usize) -> &[u64] {
        self.offsets.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Write the stream to a fresh temporary file.
    pub fn write_temp(&self) -> io::Result<NamedTempFile> {
        write_temp(&self.bytes)
    }

    fn record(&mut self, tag: Tag, value: &Value) {
        self.bytes.extend_from_slice(&tag.bytes());
        self.bytes.extend_from_slice(value.to_string().as_bytes());
    }

    fn note_frame(&mut self, source: usize) {
        if self.offsets.len() <= source {
            self.offsets.resize(source + 1, Vec::new());
        }
        self.offsets[source].push(self.bytes.len() as u64);
    }

    fn payload(&mut self, source: usize, time_us: i64, payload: &[u8]) {
        self.bytes.extend_from_slice(&Tag::Payload.bytes());
        self.bytes.extend_from_slice(&time_us.to_le_bytes());
        encode_uint(source as u64, &mut self.bytes);
        let fixed = self.sizes.get(source).copied().unwrap_or(0);
        if fixed == 0 {
            encode_uint(payload.len() as u64, &mut self.bytes);
        } else {
            debug_assert_eq!(fixed, payload.len() as u64, "fixed-size source {} got a short payload", source);
        }
        self.bytes.extend_from_slice(payload);
    }
}

/// Write `bytes` to a fresh temporary file.
pub fn write_temp(bytes: &[u8]) -> io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(file)
}

/// The two-source scenario: `cam0` (id 0, fixed 100 bytes) and `imu1`
/// (id 1, variable size) interleaved as cam0, imu1 (8 bytes), cam0.
pub fn camera_imu_stream() -> StreamBuilder {
    let mut builder = StreamBuilder::new(1_000_000);
    let cam = builder.add_source("cam0", 100);
    let imu = builder.add_source("imu1", 0);
    builder
        .frame(cam, 1_000_100, &[0xc0; 100])
        .frame(imu, 1_000_150, &[0x11; 8])
        .frame(cam, 1_000_200, &[0xc1; 100]);
    builder
}

/// Install a test subscriber honoring `RUST_LOG`; repeated calls are harmless.
#[cfg(test)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

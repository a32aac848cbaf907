//! Tagged cursor over a byte stream
//!
//! [`TaggedCursor`] is the byte-level primitive underneath the reader. It
//! tracks the logical stream position itself, keeps a small lookahead so tags
//! can be peeked on media that cannot seek (pipes), and carries the
//! "remaining payload length" counter that marks the cursor as positioned
//! inside a frame's payload.
//!
//! Short reads at the end of the available data surface as
//! [`StreamError::Io`] with `ErrorKind::UnexpectedEof`; the end is never
//! latched, so a file that grows later can be read further.

use crate::format::{MAX_VARINT_LEN, TAG_LENGTH, Tag, tag_name};
use crate::{Result, StreamError};
use serde::Deserialize;
use serde_json::Value;
use std::io::{self, Read, Seek, SeekFrom};
use tracing::trace;

const SKIP_CHUNK: usize = 8 * 1024;

/// Byte cursor that understands the stream's primitive encodings.
#[derive(Debug)]
pub struct TaggedCursor<R> {
    inner: R,
    position: u64,
    lookahead: [u8; TAG_LENGTH],
    lookahead_len: usize,
    data_len: u64,
    seekable: bool,
}

impl<R: Read + Seek> TaggedCursor<R> {
    /// Wrap a medium. `seekable` must be false for pipes even though their
    /// handle type implements [`Seek`].
    pub fn new(inner: R, seekable: bool) -> Self {
        Self { inner, position: 0, lookahead: [0; TAG_LENGTH], lookahead_len: 0, data_len: 0, seekable }
    }

    /// Current logical position (bytes consumed from the start of the medium).
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// Bytes of the current payload not yet read or skipped.
    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Mark the cursor as positioned on a payload of `len` bytes.
    pub fn set_data_len(&mut self, len: u64) {
        self.data_len = len;
    }

    /// Peek the next three bytes without consuming them.
    ///
    /// Returns `Ok(None)` when fewer than three bytes are currently available.
    pub fn peek_tag_bytes(&mut self) -> Result<Option<[u8; TAG_LENGTH]>> {
        if self.fill_lookahead(TAG_LENGTH)? < TAG_LENGTH {
            return Ok(None);
        }
        Ok(Some(self.lookahead))
    }

    /// Peek the next tag, `Ok(None)` at the end of the available data or when
    /// the next bytes are not a recognized tag.
    pub fn peek_tag(&mut self) -> Result<Option<Tag>> {
        Ok(self.peek_tag_bytes()?.and_then(Tag::from_bytes))
    }

    /// Consume three bytes and return them.
    pub fn read_tag_bytes(&mut self) -> Result<[u8; TAG_LENGTH]> {
        let mut bytes = [0u8; TAG_LENGTH];
        self.read_exact_raw(&mut bytes, "tag")?;
        Ok(bytes)
    }

    /// Consume a tag and fail with a format error unless it is `expected`.
    pub fn expect_tag(&mut self, expected: Tag) -> Result<()> {
        let bytes = self.read_tag_bytes()?;
        if bytes != expected.bytes() {
            return Err(StreamError::format_error(
                "tag read",
                format!("expected {} but found \"{}\" at offset {}", expected, tag_name(bytes), self.position - TAG_LENGTH as u64),
            ));
        }
        Ok(())
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_uint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.read_u8("varint")?;
            let bits = u64::from(byte & 0x7f);
            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                return Err(StreamError::format_error("varint", "value overflows 64 bits"));
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(StreamError::format_error("varint", format!("encoding longer than {} bytes", MAX_VARINT_LEN)))
    }

    /// Read a signed 64-bit little-endian microsecond timestamp.
    pub fn read_timestamp(&mut self) -> Result<i64> {
        let mut bytes = [0u8; 8];
        self.read_exact_raw(&mut bytes, "timestamp")?;
        Ok(i64::from_le_bytes(bytes))
    }

    /// Fill `buf` completely from the stream.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact_raw(buf, "raw read")
    }

    /// Read a fixed-width little-endian `u64`.
    pub fn read_u64_le(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read_exact_raw(&mut bytes, "fixed-width integer")?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Parse one self-delimited structured record (JSON object or array).
    pub fn read_record(&mut self, context: &str) -> Result<Value> {
        let start = self.position;
        let value = {
            let mut de = serde_json::Deserializer::from_reader(RawBytes { cursor: self });
            Value::deserialize(&mut de).map_err(|e| StreamError::record_error(context, e))?
        };
        if !(value.is_object() || value.is_array()) {
            return Err(StreamError::format_error(
                context,
                format!("record at offset {} is not an object or array", start),
            ));
        }
        trace!("Parsed {} ({} bytes)", context, self.position - start);
        Ok(value)
    }

    /// Consume a single newline if one follows.
    pub fn skip_newline(&mut self) -> Result<()> {
        if self.fill_lookahead(1)? == 1 && self.lookahead[0] == b'\n' {
            self.consume_lookahead(1);
        }
        Ok(())
    }

    /// Drop one byte; used by resynchronization. Returns false at the end.
    pub fn advance_one(&mut self) -> Result<bool> {
        if self.fill_lookahead(1)? == 0 {
            return Ok(false);
        }
        self.consume_lookahead(1);
        Ok(true)
    }

    /// Read payload bytes, bounded by the remaining payload length.
    ///
    /// A short read leaves the payload state as it was before the call on
    /// seekable media, so the read can be retried once more data exists. On
    /// pipes the consumed bytes are accounted for instead.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = clamp_len(buf.len() as u64, self.data_len) as usize;
        let start = (self.position, self.data_len);
        if let Err(e) = self.read_exact_raw(&mut buf[..len], "payload read") {
            return Err(self.restore_payload(start, e));
        }
        self.data_len -= len as u64;
        Ok(len)
    }

    /// Skip payload bytes, bounded by the remaining payload length.
    ///
    /// Short skips restore the payload state like [`read_payload`](Self::read_payload).
    pub fn skip_payload(&mut self, len: u64) -> Result<u64> {
        let len = clamp_len(len, self.data_len);
        let start = (self.position, self.data_len);
        if let Err(e) = self.skip_raw(len) {
            return Err(self.restore_payload(start, e));
        }
        self.data_len -= len;
        Ok(len)
    }

    /// Read the rest of the payload into a buffer that grows with the data
    /// actually present, never with the declared size alone.
    pub fn read_payload_to_end(&mut self) -> Result<Vec<u8>> {
        let start = (self.position, self.data_len);
        let mut data = Vec::with_capacity(clamp_len(self.data_len, SKIP_CHUNK as u64) as usize);
        let mut chunk = [0u8; SKIP_CHUNK];
        let mut left = self.data_len;
        while left > 0 {
            let step = left.min(SKIP_CHUNK as u64) as usize;
            if let Err(e) = self.read_exact_raw(&mut chunk[..step], "payload read") {
                return Err(self.restore_payload(start, e));
            }
            data.extend_from_slice(&chunk[..step]);
            left -= step as u64;
        }
        self.data_len = 0;
        Ok(data)
    }

    /// Undo a failed payload read: rewind on seekable media, otherwise drop
    /// the bytes that were consumed from the payload counter.
    fn restore_payload(&mut self, (position, data_len): (u64, u64), error: StreamError) -> StreamError {
        if self.seekable {
            if let Err(seek_error) = self.seek_to(position) {
                return seek_error;
            }
            self.data_len = data_len;
        } else {
            let consumed = self.position - position;
            self.data_len = data_len.saturating_sub(consumed);
        }
        error
    }

    /// Skip `len` raw bytes regardless of payload state.
    pub fn skip_raw(&mut self, len: u64) -> Result<()> {
        let mut scratch = [0u8; SKIP_CHUNK];
        let mut left = len;
        while left > 0 {
            let step = left.min(SKIP_CHUNK as u64) as usize;
            self.read_exact_raw(&mut scratch[..step], "skip")?;
            left -= step as u64;
        }
        Ok(())
    }

    /// Move to an absolute offset. Clears the payload counter.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.require_seekable()?;
        self.inner
            .seek(SeekFrom::Start(offset))
            .map_err(|e| StreamError::io_error(format!("seek to offset {}", offset), e))?;
        self.position = offset;
        self.lookahead_len = 0;
        self.data_len = 0;
        Ok(())
    }

    /// Total length of the medium, leaving the logical position unchanged.
    pub fn stream_len(&mut self) -> Result<u64> {
        self.require_seekable()?;
        let len = self
            .inner
            .seek(SeekFrom::End(0))
            .map_err(|e| StreamError::io_error("stream length query", e))?;
        // Bytes held in the lookahead were consumed from the medium but not
        // from the logical position, so re-reading them after the seek is safe.
        self.inner
            .seek(SeekFrom::Start(self.position))
            .map_err(|e| StreamError::io_error("stream length query", e))?;
        self.lookahead_len = 0;
        Ok(len)
    }

    fn require_seekable(&self) -> Result<()> {
        if !self.seekable {
            return Err(StreamError::usage_error("stream is not seekable (probably a pipe)"));
        }
        Ok(())
    }

    fn read_u8(&mut self, context: &str) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact_raw(&mut byte, context)?;
        Ok(byte[0])
    }

    fn read_exact_raw(&mut self, buf: &mut [u8], context: &str) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_some(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(StreamError::io_error(
                        context,
                        io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("needed {} bytes at offset {}, got {}", buf.len(), self.position, filled),
                        ),
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StreamError::io_error(context, e)),
            }
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = if self.lookahead_len > 0 {
            let n = buf.len().min(self.lookahead_len);
            buf[..n].copy_from_slice(&self.lookahead[..n]);
            self.lookahead.copy_within(n..self.lookahead_len, 0);
            self.lookahead_len -= n;
            n
        } else {
            self.inner.read(buf)?
        };
        self.position += n as u64;
        Ok(n)
    }

    fn fill_lookahead(&mut self, want: usize) -> Result<usize> {
        while self.lookahead_len < want {
            match self.inner.read(&mut self.lookahead[self.lookahead_len..want]) {
                Ok(0) => break,
                Ok(n) => self.lookahead_len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StreamError::io_error("tag peek", e)),
            }
        }
        Ok(self.lookahead_len)
    }

    fn consume_lookahead(&mut self, n: usize) {
        self.lookahead.copy_within(n..self.lookahead_len, 0);
        self.lookahead_len -= n;
        self.position += n as u64;
    }
}

fn clamp_len(requested: u64, remaining: u64) -> u64 {
    requested.min(remaining)
}

/// Raw byte view handed to the structured-value parser.
struct RawBytes<'a, R> {
    cursor: &'a mut TaggedCursor<R>,
}

impl<R: Read + Seek> Read for RawBytes<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read_some(buf)
    }
}

//! Packet stream reader
//!
//! [`PacketStreamReader`] owns the cursor, the source table and the packet
//! index of one open stream. Callers pull frames of one source at a time and
//! then drain each frame's payload:
//!
//! ```rust,no_run
//! use packetstream::PacketStreamReader;
//!
//! fn dump_source(path: &str, source: usize) -> packetstream::Result<()> {
//!     let mut reader = PacketStreamReader::open(path)?;
//!     println!("Stream declares {} sources", reader.sources().len());
//!
//!     while let Some(frame) = reader.next_frame(source)? {
//!         let payload = reader.read_payload()?;
//!         println!("frame {} at {}us: {} bytes", frame.sequence_num, frame.time_us, payload.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Corruption and live data
//!
//! - An unrecognized tag is logged and skipped by scanning forward to the next
//!   recognizable tag; it never aborts reading
//! - A frame truncated at the end of a regular file is reported as exhaustion
//!   and re-read once the writer has completed it
//! - On a FIFO, end of data triggers a non-blocking probe for a new writer;
//!   when bytes are pending the stream is re-opened on them
//!
//! ## Sequence numbers
//!
//! Sequence numbers are counted by this reader, not stored in the file.
//! [`PacketStreamReader::seek`] resets the counter of the seeked source only;
//! the counters of other sources stay where they were and are stale until
//! those sources are seeked too.

use crate::cursor::TaggedCursor;
use crate::format::{HDR_TIME_US, IDX_SRC_PACKET_INDEX, FOOTER_SIZE, MAGIC, Tag, tag_name};
use crate::pipe::{self, PipeProbe};
use crate::record::Record;
use crate::{FrameHeader, PacketIndex, Result, Source, SourceTable, StreamError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

type Medium = BufReader<File>;

/// Reader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Load the trailing footer index on open (seekable media only)
    pub load_footer_index: bool,
    /// Probe pipes for a new writer when their data runs out
    pub follow_pipes: bool,
    /// Upper bound on bytes skipped by one resynchronization scan
    pub max_resync_bytes: Option<u64>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self { load_footer_index: true, follow_pipes: true, max_resync_bytes: None }
    }
}

/// Parsed stream header record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Stream start time in microseconds
    pub start_time_us: i64,
    /// The full header record
    pub record: Value,
}

/// Per-instance diagnostic state, reset on open and close.
#[derive(Debug, Default)]
struct Diagnostics {
    index_mismatch_warned: bool,
}

/// Dispatch loop state.
#[derive(Debug, Clone, Copy)]
enum ScanState {
    Dispatching,
    Scanning { unexpected: [u8; 3], skipped: u64 },
}

/// Reader for one packet stream file or pipe.
#[derive(Debug)]
pub struct PacketStreamReader {
    options: ReaderOptions,
    path: Option<PathBuf>,
    is_pipe: bool,
    cursor: Option<TaggedCursor<Medium>>,
    header: Option<StreamHeader>,
    sources: SourceTable,
    index: PacketIndex,
    probe: Option<PipeProbe>,
    pipe_drained: bool,
    diagnostics: Diagnostics,
    payload_epoch: u64,
}

impl PacketStreamReader {
    /// Create a closed reader.
    pub fn new(options: ReaderOptions) -> Self {
        Self {
            options,
            path: None,
            is_pipe: false,
            cursor: None,
            header: None,
            sources: SourceTable::new(),
            index: PacketIndex::new(),
            probe: None,
            pipe_drained: false,
            diagnostics: Diagnostics::default(),
            payload_epoch: 0,
        }
    }

    /// Open a stream with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_options(path, ReaderOptions::default())
    }

    /// Open a stream with explicit options.
    pub fn with_options<P: AsRef<Path>>(path: P, options: ReaderOptions) -> Result<Self> {
        let mut reader = Self::new(options);
        reader.open_stream(path)?;
        Ok(reader)
    }

    /// (Re)open this reader on `path`, closing any stream it had open.
    ///
    /// On failure the reader is left closed.
    pub fn open_stream<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.close();

        let path = path.as_ref().to_path_buf();
        let is_pipe = pipe::is_pipe(&path);
        info!("Opening packet stream {} ({})", path.display(), if is_pipe { "pipe" } else { "file" });

        let file = File::open(&path).map_err(|e| StreamError::file_error(path.clone(), e))?;
        self.path = Some(path);
        self.is_pipe = is_pipe;
        if let Err(e) = self.attach(file) {
            self.close();
            return Err(e);
        }
        Ok(())
    }

    /// Release the medium and forget all sources, index entries and diagnostics.
    pub fn close(&mut self) {
        if self.cursor.is_some() {
            debug!("Closing packet stream {:?}", self.path);
        }
        self.cursor = None;
        self.header = None;
        self.sources.clear();
        self.index.clear();
        self.probe = None;
        self.pipe_drained = false;
        self.diagnostics = Diagnostics::default();
        self.path = None;
        self.is_pipe = false;
        self.payload_epoch += 1;
    }

    pub fn is_open(&self) -> bool {
        self.cursor.is_some()
    }

    /// Pull the next frame of `source`, skipping frames of other sources.
    ///
    /// Returns `Ok(None)` when no frame is available (end of stream, or no
    /// data yet on a live medium). After `Ok(Some(_))` the reader is
    /// positioned on the frame's payload; drain it with [`read_raw`],
    /// [`skip`] or [`read_payload`]. An undrained payload is discarded by the
    /// next call.
    ///
    /// [`read_raw`]: PacketStreamReader::read_raw
    /// [`skip`]: PacketStreamReader::skip
    /// [`read_payload`]: PacketStreamReader::read_payload
    pub fn next_frame(&mut self, source: usize) -> Result<Option<FrameHeader>> {
        self.discard_in_flight()?;

        loop {
            let Some(frame) = self.next_any_frame()? else {
                return Ok(None);
            };

            self.sources.advance(frame.source);
            let seekable = self.cursor.as_ref().is_some_and(TaggedCursor::is_seekable);
            if seekable {
                self.record_position(&frame);
            }

            let cursor = self.cursor_mut()?;
            cursor.set_data_len(frame.size);
            if frame.source == source {
                return Ok(Some(frame));
            }

            trace!("Skipping frame {} of source {} ({} bytes)", frame.sequence_num, frame.source, frame.size);
            match cursor.skip_payload(frame.size) {
                Ok(_) => {}
                Err(e) if seekable && e.is_unexpected_eof() => {
                    debug!("Payload at offset {} is incomplete; waiting for more data", frame.payload_header_offset);
                    cursor.seek_to(frame.frame_start_offset)?;
                    self.sources.reset_sequence(frame.source, frame.sequence_num);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read payload bytes of the current frame into `buf`.
    ///
    /// Requests longer than the remaining payload are trimmed (and logged).
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let cursor = self.cursor_mut()?;
        let remaining = cursor.data_len();
        if remaining == 0 {
            return Err(StreamError::usage_error(
                "not positioned on a payload block; next_frame() must be called before read_raw()",
            ));
        }
        if buf.len() as u64 > remaining {
            warn!(
                "read_raw() requested {} bytes when only {} remain in the payload block; trimming to available data",
                buf.len(),
                remaining
            );
        }
        cursor.read_payload(buf)
    }

    /// Skip payload bytes of the current frame.
    ///
    /// Requests longer than the remaining payload are trimmed (and logged).
    pub fn skip(&mut self, len: u64) -> Result<u64> {
        let cursor = self.cursor_mut()?;
        let remaining = cursor.data_len();
        if remaining == 0 {
            return Err(StreamError::usage_error(
                "not positioned on a payload block; next_frame() must be called before skip()",
            ));
        }
        if len > remaining {
            warn!(
                "skip() requested {} bytes when only {} remain in the payload block; trimming to remaining data",
                len, remaining
            );
        }
        cursor.skip_payload(len)
    }

    /// Drain whatever remains of the current payload into a new buffer.
    pub fn read_payload(&mut self) -> Result<Vec<u8>> {
        self.cursor_mut()?.read_payload_to_end()
    }

    /// Position the reader so the next `next_frame(source)` yields frame
    /// `frame_number` of `source`, and return that frame's header.
    ///
    /// Frames not yet in the index are found by scanning forward, which
    /// extends the index as a side effect. Only `source`'s sequence counter
    /// is reset; other sources keep their (now stale) counters.
    ///
    /// The reader is left at the start of the frame, not on its payload: the
    /// next `next_frame(source)` decodes the same header again, metadata
    /// included, and only then is the payload readable.
    pub fn seek(&mut self, source: usize, frame_number: u64) -> Result<FrameHeader> {
        if !self.cursor_mut()?.is_seekable() {
            return Err(StreamError::usage_error("stream is not seekable (probably a pipe)"));
        }
        if !self.sources.contains(source) {
            return Err(StreamError::usage_error(format!(
                "invalid frame source id {} ({} sources declared)",
                source,
                self.sources.len()
            )));
        }

        self.discard_in_flight()?;

        if !self.index.has(source, frame_number) {
            debug!("Seek index miss for source {} frame {}; reading ahead", source, frame_number);
            // Every pass consumes at least one byte, so the stream length bounds the scan.
            let bound = self.cursor_mut()?.stream_len()?;
            let mut passes = 0u64;
            while !self.index.has(source, frame_number) {
                passes += 1;
                if passes > bound || self.next_frame(source)?.is_none() {
                    return Err(StreamError::Range { source_id: source, frame: frame_number });
                }
                self.discard_in_flight()?;
            }
        }

        let target = self
            .index
            .position(source, frame_number)
            .ok_or(StreamError::Range { source_id: source, frame: frame_number })?;

        let Some(cursor) = self.cursor.as_mut() else {
            return Err(not_open());
        };
        cursor.seek_to(target)?;
        self.sources.reset_sequence(source, frame_number);

        let frame = read_frame_header(cursor, &self.sources)?;
        if frame.source != source {
            return Err(StreamError::format_error(
                "seek",
                format!("index entry for source {} frame {} points at a frame of source {}", source, frame_number, frame.source),
            ));
        }
        cursor.seek_to(frame.frame_start_offset)?;
        debug!("Seeked source {} to frame {} at offset {}", source, frame_number, target);
        Ok(frame)
    }

    /// Sequence number the next frame of `source` will receive.
    pub fn current_sequence_number(&self, source: usize) -> Result<u64> {
        self.sources
            .next_sequence(source)
            .ok_or_else(|| StreamError::usage_error(format!("unknown source id {}", source)))
    }

    /// Sources declared so far, in id order.
    pub fn sources(&self) -> &[Source] {
        self.sources.as_slice()
    }

    pub fn source(&self, id: usize) -> Option<&Source> {
        self.sources.get(id)
    }

    pub fn header(&self) -> Option<&StreamHeader> {
        self.header.as_ref()
    }

    pub fn index(&self) -> &PacketIndex {
        &self.index
    }

    /// Bytes of the current payload not yet drained.
    pub fn remaining_payload(&self) -> u64 {
        self.cursor.as_ref().map_or(0, TaggedCursor::data_len)
    }

    /// Current stream offset, `None` when closed.
    pub fn position(&self) -> Option<u64> {
        self.cursor.as_ref().map(TaggedCursor::position)
    }

    pub fn is_seekable(&self) -> bool {
        self.cursor.as_ref().is_some_and(TaggedCursor::is_seekable)
    }

    pub fn is_pipe(&self) -> bool {
        self.is_pipe
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    /// Validate the magic, load the footer index and parse the leading records of `file`.
    fn attach(&mut self, file: File) -> Result<()> {
        self.cursor = None;
        self.header = None;
        self.sources.clear();
        self.index.clear();
        self.pipe_drained = false;
        self.diagnostics = Diagnostics::default();
        self.payload_epoch += 1;

        let mut cursor = TaggedCursor::new(BufReader::new(file), !self.is_pipe);
        let mut magic = [0u8; MAGIC.len()];
        if cursor.read_exact(&mut magic).is_err() || &magic != MAGIC {
            return Err(StreamError::format_error("stream open", "unrecognised file header (bad magic)"));
        }

        if self.options.load_footer_index && cursor.is_seekable() {
            let resume = cursor.position();
            match load_footer_index(&mut cursor) {
                Ok(Some(index)) => {
                    debug!("Loaded footer index with {} frames over {} sources", index.len(), index.sources());
                    self.index.merge(&index);
                }
                Ok(None) => debug!("No footer index; index will be built while reading"),
                Err(e) => debug!("Ignoring unusable footer index: {}", e),
            }
            cursor.seek_to(resume)?;
        }

        self.header = Some(parse_header(&mut cursor)?);
        while cursor.peek_tag()? == Some(Tag::AddSource) {
            parse_new_source(&mut cursor, &mut self.sources)?;
        }

        debug!(
            "Stream open: start {}us, {} leading sources",
            self.header.as_ref().map_or(0, |h| h.start_time_us),
            self.sources.len()
        );
        self.cursor = Some(cursor);
        Ok(())
    }

    /// Run the dispatch loop until a frame header is decoded or the data runs out.
    fn next_any_frame(&mut self) -> Result<Option<FrameHeader>> {
        let mut state = ScanState::Dispatching;

        loop {
            // Once a pipe's writer has gone, its old handle is never read again;
            // new bytes are taken through the probe instead.
            if self.pipe_drained {
                if self.poll_pipe()? {
                    state = ScanState::Dispatching;
                    continue;
                }
                return Ok(None);
            }

            let Some(cursor) = self.cursor.as_mut() else {
                return Err(not_open());
            };

            let Some(bytes) = cursor.peek_tag_bytes()? else {
                if let ScanState::Scanning { unexpected, skipped } = state {
                    warn!(
                        "Reached end of data while resyncing after unexpected packet type \"{}\" ({} bytes skipped)",
                        tag_name(unexpected),
                        skipped
                    );
                }
                if self.is_pipe && self.options.follow_pipes {
                    self.pipe_drained = true;
                    continue;
                }
                return Ok(None);
            };
            let tag = Tag::from_bytes(bytes);

            if let ScanState::Scanning { unexpected, skipped } = state {
                if tag.is_none() {
                    if let Some(limit) = self.options.max_resync_bytes {
                        if skipped >= limit {
                            return Err(StreamError::format_error(
                                "resync",
                                format!("no recognizable tag within {} bytes of offset {}", limit, cursor.position() - skipped),
                            ));
                        }
                    }
                    cursor.advance_one()?;
                    state = ScanState::Scanning { unexpected, skipped: skipped + 1 };
                    continue;
                }
                warn!(
                    "Resynchronized at offset {} after skipping {} bytes following unexpected packet type \"{}\"",
                    cursor.position(),
                    skipped,
                    tag_name(unexpected)
                );
                state = ScanState::Dispatching;
            }

            trace!("Dispatching {} at offset {}", tag_name(bytes), cursor.position());
            match tag {
                Some(Tag::Sync) => skip_sync(cursor)?,
                Some(Tag::AddSource) => {
                    let start = cursor.position();
                    let parsed = parse_new_source(cursor, &mut self.sources);
                    if rewind_if_incomplete(cursor, start, parsed)?.is_none() {
                        return Ok(None);
                    }
                }
                Some(Tag::Metadata) | Some(Tag::Payload) => {
                    let start = cursor.position();
                    let parsed = read_frame_header(cursor, &self.sources);
                    return rewind_if_incomplete(cursor, start, parsed);
                }
                Some(Tag::Stats) => {
                    let start = cursor.position();
                    match parse_index_record(cursor) {
                        Ok(index) => {
                            debug!("Absorbed index record with {} frames", index.len());
                            self.index.merge(&index);
                        }
                        Err(e) if cursor.is_seekable() && e.is_unexpected_eof() => {
                            debug!("Index record at offset {} is incomplete; waiting for more data", start);
                            cursor.seek_to(start)?;
                            return Ok(None);
                        }
                        Err(e) => {
                            warn!("Malformed index record at offset {}: {}. Resyncing", start, e);
                            state = ScanState::Scanning { unexpected: bytes, skipped: cursor.position() - start };
                        }
                    }
                }
                Some(Tag::Footer) | Some(Tag::End) => return Ok(None),
                Some(Tag::Header) => {
                    let start = cursor.position();
                    let parsed = parse_header(cursor);
                    match rewind_if_incomplete(cursor, start, parsed)? {
                        Some(header) => self.header = Some(header),
                        None => return Ok(None),
                    }
                }
                Some(Tag::Magic) => {
                    let start = cursor.position();
                    let parsed = skip_magic(cursor);
                    match rewind_if_incomplete(cursor, start, parsed)? {
                        Some(true) => {}
                        Some(false) => {
                            state = ScanState::Scanning { unexpected: bytes, skipped: MAGIC.len() as u64 };
                        }
                        None => return Ok(None),
                    }
                }
                None => {
                    warn!("Unexpected packet type \"{}\" at offset {}. Resyncing", tag_name(bytes), cursor.position());
                    cursor.advance_one()?;
                    state = ScanState::Scanning { unexpected: bytes, skipped: 1 };
                }
            }
        }
    }

    /// Probe a drained pipe for a new writer and re-open on its bytes.
    ///
    /// Returns true when the stream was re-attached and reading may continue.
    fn poll_pipe(&mut self) -> Result<bool> {
        if !self.is_pipe || !self.options.follow_pipes {
            return Ok(false);
        }
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };

        if self.probe.is_none() {
            match PipeProbe::open(&path) {
                Ok(probe) => self.probe = Some(probe),
                Err(e) => {
                    debug!("Cannot probe pipe {}: {}", path.display(), e);
                    return Ok(false);
                }
            }
        }

        let pending = match self.probe.as_ref().map(PipeProbe::has_pending_data) {
            Some(Ok(pending)) => pending,
            Some(Err(e)) => {
                debug!("Pipe probe on {} failed: {}", path.display(), e);
                self.probe = None;
                return Ok(false);
            }
            None => false,
        };
        if !pending {
            return Ok(false);
        }

        let Some(probe) = self.probe.take() else {
            return Ok(false);
        };
        info!("Pipe {} has new data; reopening stream", path.display());
        let file = probe.into_file().map_err(|e| StreamError::file_error(path.clone(), e))?;
        self.attach(file)?;
        Ok(true)
    }

    /// Record where a scanned frame starts, warning once if an existing entry disagrees.
    fn record_position(&mut self, frame: &FrameHeader) {
        match self.index.position(frame.source, frame.sequence_num) {
            None => {
                self.index.add(frame.source, frame.sequence_num, frame.frame_start_offset);
            }
            Some(indexed) if indexed != frame.frame_start_offset => {
                if indexed != frame.payload_header_offset {
                    debug!(
                        "Index entry {} for source {} frame {} matches neither offset {} nor {}",
                        indexed, frame.source, frame.sequence_num, frame.frame_start_offset, frame.payload_header_offset
                    );
                }
                if !self.diagnostics.index_mismatch_warned {
                    warn!("CAUTION: Old packet stream files do not update frame positions on seek.");
                    self.diagnostics.index_mismatch_warned = true;
                }
            }
            Some(_) => {}
        }
    }

    /// Changes whenever the reader leaves the payload it was positioned on.
    pub(crate) fn payload_epoch(&self) -> u64 {
        self.payload_epoch
    }

    fn discard_in_flight(&mut self) -> Result<()> {
        self.payload_epoch += 1;
        let cursor = self.cursor_mut()?;
        let remaining = cursor.data_len();
        if remaining > 0 {
            debug!("Discarding {} undrained payload bytes", remaining);
            cursor.skip_payload(remaining)?;
        }
        Ok(())
    }

    fn cursor_mut(&mut self) -> Result<&mut TaggedCursor<Medium>> {
        self.cursor.as_mut().ok_or_else(not_open)
    }
}

impl Default for PacketStreamReader {
    fn default() -> Self {
        Self::new(ReaderOptions::default())
    }
}

fn not_open() -> StreamError {
    StreamError::usage_error("packet stream is not open")
}

/// Turn a parse that ran out of data into "nothing yet" on seekable media,
/// rewinding to `start` so the record is parsed again once it is complete.
fn rewind_if_incomplete<T>(cursor: &mut TaggedCursor<Medium>, start: u64, parsed: Result<T>) -> Result<Option<T>> {
    match parsed {
        Ok(value) => Ok(Some(value)),
        Err(e) if cursor.is_seekable() && e.is_unexpected_eof() => {
            debug!("Record at offset {} is incomplete; waiting for more data", start);
            cursor.seek_to(start)?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Decode the frame header at the cursor: optional metadata, then the payload record.
fn read_frame_header(cursor: &mut TaggedCursor<Medium>, sources: &SourceTable) -> Result<FrameHeader> {
    let frame_start_offset = cursor.position();

    let mut metadata = None;
    if cursor.peek_tag()? == Some(Tag::Metadata) {
        cursor.expect_tag(Tag::Metadata)?;
        let meta_source = cursor.read_uint()?;
        let value = cursor.read_record("frame metadata")?;
        metadata = Some((meta_source, value));
    }

    let payload_header_offset = cursor.position();
    cursor.expect_tag(Tag::Payload)?;
    let time_us = cursor.read_timestamp()?;
    let raw_source = cursor.read_uint()?;

    if let Some((meta_source, _)) = &metadata {
        if *meta_source != raw_source {
            return Err(StreamError::format_error(
                "frame header",
                format!(
                    "frame of source {} preceded by metadata for source {}. Stream may be corrupt",
                    raw_source, meta_source
                ),
            ));
        }
    }

    let source = usize::try_from(raw_source)
        .ok()
        .and_then(|id| sources.get(id))
        .ok_or_else(|| {
            StreamError::format_error(
                "frame header",
                format!("frame at offset {} references undeclared source {}", payload_header_offset, raw_source),
            )
        })?;

    let size = if source.is_variable_size() { cursor.read_uint()? } else { source.frame_size_bytes };
    let sequence_num = sources.next_sequence(source.id).unwrap_or(0);

    Ok(FrameHeader {
        source: source.id,
        sequence_num,
        time_us,
        size,
        frame_start_offset,
        payload_header_offset,
        metadata: metadata.map(|(_, value)| value),
    })
}

fn parse_header(cursor: &mut TaggedCursor<Medium>) -> Result<StreamHeader> {
    cursor.expect_tag(Tag::Header)?;
    let record = cursor.read_record("header record")?;
    let start_time_us = Record::new("header record", &record).i64(HDR_TIME_US)?;
    cursor.skip_newline()?;
    Ok(StreamHeader { start_time_us, record })
}

fn parse_new_source(cursor: &mut TaggedCursor<Medium>, sources: &mut SourceTable) -> Result<()> {
    cursor.expect_tag(Tag::AddSource)?;
    let value = cursor.read_record("source descriptor")?;
    cursor.skip_newline()?;

    let source = Source::from_record(&Record::new("source descriptor", &value))?;
    debug!(
        "Registered source {} ({}, {}, {} bytes per frame)",
        source.id,
        source.driver,
        source.uri,
        if source.is_variable_size() { "variable".to_string() } else { source.frame_size_bytes.to_string() }
    );
    sources.register(source)
}

fn parse_index_record(cursor: &mut TaggedCursor<Medium>) -> Result<PacketIndex> {
    cursor.expect_tag(Tag::Stats)?;
    let value = cursor.read_record("index record")?;
    let record = Record::new("index record", &value);
    Ok(record.get(IDX_SRC_PACKET_INDEX).map(PacketIndex::from_serialized).unwrap_or_default())
}

/// Follow the trailing footer to the index record, if both exist.
fn load_footer_index(cursor: &mut TaggedCursor<Medium>) -> Result<Option<PacketIndex>> {
    let len = cursor.stream_len()?;
    if len < (MAGIC.len() + FOOTER_SIZE) as u64 {
        return Ok(None);
    }

    cursor.seek_to(len - FOOTER_SIZE as u64)?;
    if cursor.peek_tag()? != Some(Tag::Footer) {
        return Ok(None);
    }
    cursor.expect_tag(Tag::Footer)?;
    let index_offset = cursor.read_u64_le()?;
    if index_offset >= len {
        return Err(StreamError::format_error(
            "footer",
            format!("index offset {} lies beyond the end of the stream ({} bytes)", index_offset, len),
        ));
    }

    cursor.seek_to(index_offset)?;
    if cursor.peek_tag()? != Some(Tag::Stats) {
        return Ok(None);
    }
    parse_index_record(cursor).map(Some)
}

/// Consume a run of sync tags.
fn skip_sync(cursor: &mut TaggedCursor<Medium>) -> Result<()> {
    let mut count = 0usize;
    while cursor.peek_tag()? == Some(Tag::Sync) {
        cursor.read_tag_bytes()?;
        count += 1;
    }
    trace!("Skipped {} sync tags", count);
    Ok(())
}

/// Consume a re-encountered magic prefix. Returns false if the bytes after
/// the magic tag were not the rest of the magic.
fn skip_magic(cursor: &mut TaggedCursor<Medium>) -> Result<bool> {
    cursor.expect_tag(Tag::Magic)?;
    let mut rest = [0u8; 2];
    cursor.read_exact(&mut rest)?;
    Ok(rest == MAGIC[3..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{StreamBuilder, camera_imu_stream, encode_uint, init_tracing, write_temp};
    use anyhow::{Context, ensure};
    use proptest::prelude::*;
    use serde_json::json;
    use std::io::Write;

    fn open_bytes(bytes: &[u8]) -> anyhow::Result<(tempfile::NamedTempFile, PacketStreamReader)> {
        let file = write_temp(bytes)?;
        let reader = PacketStreamReader::open(file.path()).context("opening fixture stream")?;
        Ok((file, reader))
    }

    #[test]
    fn open_parses_header_and_leading_sources() -> anyhow::Result<()> {
        init_tracing();
        let (_file, reader) = open_bytes(camera_imu_stream().bytes())?;

        assert!(reader.is_open());
        assert!(reader.is_seekable());
        assert!(!reader.is_pipe());
        assert_eq!(reader.header().map(|h| h.start_time_us), Some(1_000_000));
        assert_eq!(reader.sources().len(), 2);
        assert_eq!(reader.sources()[0].driver, "cam0");
        assert_eq!(reader.sources()[1].frame_size_bytes, 0);
        assert_eq!(reader.current_sequence_number(0)?, 0);
        Ok(())
    }

    #[test]
    fn bad_magic_is_a_format_error_and_leaves_reader_closed() -> anyhow::Result<()> {
        let file = write_temp(b"PANGX-not-a-stream")?;
        let mut reader = PacketStreamReader::default();
        let err = reader.open_stream(file.path()).unwrap_err();
        ensure!(matches!(err, StreamError::Format { .. }), "expected format error, got {:?}", err);
        ensure!(!reader.is_open());

        let empty = write_temp(b"")?;
        ensure!(matches!(PacketStreamReader::open(empty.path()), Err(StreamError::Format { .. })));
        Ok(())
    }

    #[test]
    fn missing_file_is_a_file_error() {
        let result = PacketStreamReader::open("/definitely/not/here.pango");
        assert!(matches!(result, Err(StreamError::File { .. })));
    }

    #[test]
    fn header_without_start_time_is_a_format_error() -> anyhow::Result<()> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(b"LIN{\"version\":2}\n");
        let file = write_temp(&bytes)?;
        ensure!(matches!(PacketStreamReader::open(file.path()), Err(StreamError::Format { .. })));
        Ok(())
    }

    #[test]
    fn camera_imu_scenario() -> anyhow::Result<()> {
        init_tracing();
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;

        let first = reader.next_frame(0)?.context("first cam0 frame")?;
        assert_eq!((first.source, first.sequence_num, first.size), (0, 0, 100));
        assert_eq!(reader.read_payload()?, vec![0xc0; 100]);

        let second = reader.next_frame(0)?.context("second cam0 frame")?;
        assert_eq!((second.source, second.sequence_num, second.size), (0, 1, 100));
        assert_eq!(second.time_us, 1_000_200);
        assert_eq!(reader.remaining_payload(), 100);
        assert_eq!(reader.skip(100)?, 100);

        // imu1 frame 0 was skipped transparently but still counted
        assert_eq!(reader.current_sequence_number(1)?, 1);
        assert!(reader.next_frame(0)?.is_none());
        Ok(())
    }

    #[test]
    fn variable_size_source_reads_explicit_size() -> anyhow::Result<()> {
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;
        let imu = reader.next_frame(1)?.context("imu1 frame")?;
        assert_eq!((imu.source, imu.sequence_num, imu.size), (1, 0, 8));
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_raw(&mut buf)?, 8);
        assert_eq!(buf, [0x11; 8]);
        assert_eq!(reader.current_sequence_number(0)?, 1);
        Ok(())
    }

    #[test]
    fn read_before_next_frame_is_a_usage_error() -> anyhow::Result<()> {
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;
        let mut buf = [0u8; 4];
        ensure!(matches!(reader.read_raw(&mut buf), Err(StreamError::Usage { .. })));
        ensure!(matches!(reader.skip(4), Err(StreamError::Usage { .. })));

        reader.next_frame(1)?.context("imu1 frame")?;
        reader.skip(8)?;
        ensure!(matches!(reader.read_raw(&mut buf), Err(StreamError::Usage { .. })));
        Ok(())
    }

    #[test]
    fn oversized_requests_are_clamped() -> anyhow::Result<()> {
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;
        reader.next_frame(1)?.context("imu1 frame")?;

        let mut buf = [0u8; 64];
        assert_eq!(reader.read_raw(&mut buf[..3])?, 3);
        assert_eq!(reader.read_raw(&mut buf)?, 5);
        assert_eq!(reader.remaining_payload(), 0);

        reader.next_frame(0)?.context("cam0 frame")?;
        assert_eq!(reader.skip(1_000)?, 100);
        Ok(())
    }

    #[test]
    fn undrained_payload_is_discarded_by_next_call() -> anyhow::Result<()> {
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;
        reader.next_frame(0)?.context("cam0 frame 0")?;
        reader.skip(10)?;
        let next = reader.next_frame(0)?.context("cam0 frame 1")?;
        assert_eq!(next.sequence_num, 1);
        assert_eq!(reader.read_payload()?, vec![0xc1; 100]);
        Ok(())
    }

    #[test]
    fn metadata_is_attached_and_offsets_differ() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("gps", 0);
        builder.frame_with_metadata(src, 10, json!({ "fix": "3d" }), b"nmea");
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        let frame = reader.next_frame(src)?.context("gps frame")?;
        assert_eq!(frame.metadata, Some(json!({ "fix": "3d" })));
        assert!(frame.payload_header_offset > frame.frame_start_offset);
        assert_eq!(frame.frame_start_offset, builder.frame_offsets(src)[0]);
        assert_eq!(reader.read_payload()?, b"nmea");
        Ok(())
    }

    #[test]
    fn mismatched_metadata_source_is_a_format_error() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        builder.add_source("a", 0);
        builder.add_source("b", 0);
        builder.mismatched_metadata_frame(1, 0, b"x");
        let (_file, mut reader) = open_bytes(builder.bytes())?;
        ensure!(matches!(reader.next_frame(0), Err(StreamError::Format { .. })));
        Ok(())
    }

    #[test]
    fn out_of_sequence_source_declaration_is_a_format_error() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        builder.add_source("a", 4);
        builder.add_source_with_id(2, "c", 4);
        let file = write_temp(builder.bytes())?;
        let err = PacketStreamReader::open(file.path()).unwrap_err();
        ensure!(err.is_format_error(), "unexpected error {}", err);
        Ok(())
    }

    #[test]
    fn sources_declared_mid_stream_are_registered() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let a = builder.add_source("a", 2);
        builder.frame(a, 1, b"aa");
        let b = builder.add_source("b", 0);
        builder.frame(b, 2, b"bbb").frame(a, 3, b"AA");
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        assert_eq!(reader.sources().len(), 1);
        let frame = reader.next_frame(b)?.context("late source frame")?;
        assert_eq!((frame.sequence_num, frame.size), (0, 3));
        assert_eq!(reader.sources().len(), 2);
        Ok(())
    }

    #[test]
    fn unknown_tag_between_frames_is_skipped() -> anyhow::Result<()> {
        init_tracing();
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 4);
        builder.frame(src, 1, b"one!").raw(b"XYZgarbage\x00\x01").frame(src, 2, b"two!");
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        reader.next_frame(src)?.context("frame 0")?;
        assert_eq!(reader.read_payload()?, b"one!");
        let second = reader.next_frame(src)?.context("frame after corruption")?;
        assert_eq!(second.sequence_num, 1);
        assert_eq!(second.time_us, 2);
        assert_eq!(reader.read_payload()?, b"two!");
        Ok(())
    }

    #[test]
    fn resync_limit_bounds_a_corrupt_span() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 4);
        builder.raw(&[0x42; 64]).frame(src, 1, b"late");
        let file = builder.write_temp()?;

        let options = ReaderOptions { max_resync_bytes: Some(16), ..ReaderOptions::default() };
        let mut bounded = PacketStreamReader::with_options(file.path(), options)?;
        ensure!(matches!(bounded.next_frame(src), Err(StreamError::Format { .. })));

        let mut unbounded = PacketStreamReader::open(file.path())?;
        ensure!(unbounded.next_frame(src)?.is_some());
        Ok(())
    }

    #[test]
    fn sync_runs_and_repeated_magic_are_transparent() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(5);
        let src = builder.add_source("a", 1);
        builder.sync(10).frame(src, 1, b"x").magic().header(6).sync(3).frame(src, 2, b"y");
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        reader.next_frame(src)?.context("frame 0")?;
        reader.skip(1)?;
        let second = reader.next_frame(src)?.context("frame 1")?;
        assert_eq!(second.sequence_num, 1);
        assert_eq!(reader.header().map(|h| h.start_time_us), Some(6));
        Ok(())
    }

    #[test]
    fn end_marker_stops_reading() -> anyhow::Result<()> {
        let mut builder = camera_imu_stream();
        builder.end().frame(0, 9, &[0; 100]);
        let (_file, mut reader) = open_bytes(builder.bytes())?;
        let mut count = 0;
        while reader.next_frame(0)?.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn footer_index_is_loaded_on_open() -> anyhow::Result<()> {
        let mut builder = camera_imu_stream();
        builder.index_and_footer();
        let (_file, reader) = open_bytes(builder.bytes())?;

        assert_eq!(reader.index().len(), 3);
        assert_eq!(reader.index().position(0, 1), Some(builder.frame_offsets(0)[1]));
        assert_eq!(reader.index().position(1, 0), Some(builder.frame_offsets(1)[0]));
        Ok(())
    }

    #[test]
    fn footer_loading_can_be_disabled() -> anyhow::Result<()> {
        let mut builder = camera_imu_stream();
        builder.index_and_footer();
        let file = builder.write_temp()?;
        let options = ReaderOptions { load_footer_index: false, ..ReaderOptions::default() };
        let reader = PacketStreamReader::with_options(file.path(), options)?;
        ensure!(reader.index().is_empty());
        Ok(())
    }

    #[test]
    fn malformed_footer_is_ignored() -> anyhow::Result<()> {
        let mut builder = camera_imu_stream();
        builder.footer(u64::MAX);
        let (_file, mut reader) = open_bytes(builder.bytes())?;
        ensure!(reader.index().is_empty());
        ensure!(reader.next_frame(0)?.is_some());

        let mut builder = camera_imu_stream();
        let bogus = builder.frame_offsets(0)[0];
        builder.footer(bogus);
        let (_file, reader) = open_bytes(builder.bytes())?;
        ensure!(reader.index().is_empty());
        Ok(())
    }

    #[test]
    fn lazy_index_matches_footer_index() -> anyhow::Result<()> {
        let mut builder = camera_imu_stream();
        builder.index_and_footer();
        let file = builder.write_temp()?;

        let loaded = PacketStreamReader::open(file.path())?;
        let options = ReaderOptions { load_footer_index: false, ..ReaderOptions::default() };
        let mut lazy = PacketStreamReader::with_options(file.path(), options)?;
        while lazy.next_frame(usize::MAX)?.is_some() {}

        for source in 0..2 {
            for (sequence, offset) in lazy.index().frames(source) {
                assert_eq!(loaded.index().position(source, sequence), Some(offset));
            }
        }
        assert_eq!(lazy.index().len(), loaded.index().len());
        Ok(())
    }

    #[test]
    fn seek_resets_the_counter_and_is_idempotent() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 2);
        for i in 0..6u8 {
            builder.frame(src, i64::from(i), &[i, i]);
        }
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        let first = reader.seek(src, 4)?;
        assert_eq!(first.sequence_num, 4);
        assert_eq!(reader.current_sequence_number(src)?, 4);
        let again = reader.seek(src, 4)?;
        assert_eq!(first, again);

        let frame = reader.next_frame(src)?.context("frame after seek")?;
        assert_eq!(frame, again);
        assert_eq!(reader.read_payload()?, vec![4, 4]);

        let back = reader.seek(src, 1)?;
        assert_eq!(back.time_us, 1);
        let frame = reader.next_frame(src)?.context("frame 1 after seeking back")?;
        assert_eq!(frame.sequence_num, 1);
        Ok(())
    }

    #[test]
    fn seek_keeps_metadata_of_the_target_frame() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 1);
        builder.frame(src, 0, b"a").frame_with_metadata(src, 1, json!({ "k": 1 }), b"b");
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        let header = reader.seek(src, 1)?;
        assert_eq!(header.metadata, Some(json!({ "k": 1 })));
        let frame = reader.next_frame(src)?.context("frame after seek")?;
        assert_eq!(frame.metadata, header.metadata);
        Ok(())
    }

    #[test]
    fn seek_leaves_other_counters_stale() -> anyhow::Result<()> {
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;
        while reader.next_frame(0)?.is_some() {}
        assert_eq!(reader.current_sequence_number(1)?, 1);

        reader.seek(0, 0)?;
        assert_eq!(reader.current_sequence_number(0)?, 0);
        assert_eq!(reader.current_sequence_number(1)?, 1);
        Ok(())
    }

    #[test]
    fn seek_errors_follow_the_taxonomy() -> anyhow::Result<()> {
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;
        ensure!(matches!(reader.seek(7, 0), Err(StreamError::Usage { .. })));
        ensure!(matches!(reader.seek(1, 5), Err(StreamError::Range { source_id: 1, frame: 5 })));
        // The failed scan indexed everything on the way
        ensure!(reader.index().len() == 3);
        ensure!(reader.seek(0, 1)?.sequence_num == 1);
        Ok(())
    }

    #[test]
    fn seek_releases_an_in_flight_payload() -> anyhow::Result<()> {
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;
        reader.next_frame(0)?.context("cam0 frame 0")?;
        ensure!(reader.remaining_payload() == 100);
        reader.seek(1, 0)?;
        ensure!(reader.remaining_payload() == 0);
        Ok(())
    }

    #[test]
    fn footer_index_entries_that_disagree_only_warn() -> anyhow::Result<()> {
        init_tracing();
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 1);
        builder.frame(src, 0, b"a").frame(src, 1, b"b");
        let index_offset = builder.position();
        let wrong = builder.frame_offsets(src)[1];
        builder.raw(format!("STA{{\"src_packet_index\":[[{},{}]]}}", wrong, wrong).as_bytes()).footer(index_offset);
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        assert!(reader.next_frame(src)?.is_some());
        assert!(reader.next_frame(src)?.is_some());
        assert_eq!(reader.index().position(src, 0), Some(wrong));
        Ok(())
    }

    #[test]
    fn truncated_frame_is_read_once_completed() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 0);
        builder.frame(src, 1, b"first");
        let complete_until = builder.position() as usize;
        builder.frame(src, 2, b"second");
        let bytes = builder.into_bytes();

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&bytes[..complete_until + 5])?;
        file.flush()?;
        let mut reader = PacketStreamReader::open(file.path())?;

        reader.next_frame(src)?.context("complete frame")?;
        reader.read_payload()?;
        ensure!(reader.next_frame(src)?.is_none(), "partial header must read as exhaustion");
        ensure!(reader.position() == Some(complete_until as u64));

        file.write_all(&bytes[complete_until + 5..])?;
        file.flush()?;
        let frame = reader.next_frame(src)?.context("frame after writer caught up")?;
        ensure!(frame.sequence_num == 1);
        ensure!(reader.read_payload()? == b"second");
        Ok(())
    }

    #[test]
    fn truncated_skipped_payload_rewinds() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let a = builder.add_source("a", 0);
        let b = builder.add_source("b", 0);
        builder.frame(a, 1, &[7; 32]).frame(b, 2, b"bb");
        let bytes = builder.into_bytes();
        let cut = bytes.len() - 2 - 20;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&bytes[..cut])?;
        file.flush()?;
        let mut reader = PacketStreamReader::open(file.path())?;
        ensure!(reader.next_frame(b)?.is_none());
        ensure!(reader.current_sequence_number(a)? == 0);

        file.write_all(&bytes[cut..])?;
        file.flush()?;
        let frame = reader.next_frame(b)?.context("b frame after completion")?;
        ensure!(frame.size == 2);
        ensure!(reader.current_sequence_number(a)? == 1);
        Ok(())
    }

    #[test]
    fn short_payload_read_is_retried_once_completed() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 0);
        builder.frame(src, 1, b"0123456789");
        let payload_end = builder.position() as usize;
        builder.frame(src, 2, b"xy");
        let bytes = builder.into_bytes();
        let cut = payload_end - 6;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&bytes[..cut])?;
        file.flush()?;
        let mut reader = PacketStreamReader::open(file.path())?;

        let frame = reader.next_frame(src)?.context("frame with partial payload")?;
        ensure!(frame.size == 10);
        let payload_start = reader.position();
        let err = reader.read_payload().err().context("partial payload must not be returned")?;
        ensure!(err.is_unexpected_eof(), "unexpected error {:?}", err);
        ensure!(reader.remaining_payload() == 10);
        ensure!(reader.position() == payload_start);

        file.write_all(&bytes[cut..])?;
        file.flush()?;
        ensure!(reader.read_payload()? == b"0123456789");
        let next = reader.next_frame(src)?.context("frame after the completed payload")?;
        ensure!(next.sequence_num == 1);
        ensure!(reader.read_payload()? == b"xy");
        Ok(())
    }

    #[test]
    fn short_skip_leaves_the_next_frame_intact() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 0);
        builder.frame(src, 1, &[9; 40]);
        let payload_end = builder.position() as usize;
        builder.frame(src, 2, b"after");
        let bytes = builder.into_bytes();
        let cut = payload_end - 30;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&bytes[..cut])?;
        file.flush()?;
        let mut reader = PacketStreamReader::open(file.path())?;

        reader.next_frame(src)?.context("frame with partial payload")?;
        ensure!(reader.skip(40).is_err());
        ensure!(reader.remaining_payload() == 40);

        file.write_all(&bytes[cut..])?;
        file.flush()?;
        let next = reader.next_frame(src)?.context("frame after the discarded payload")?;
        ensure!(next.sequence_num == 1);
        ensure!(reader.read_payload()? == b"after");
        Ok(())
    }

    #[test]
    fn corrupt_payload_size_fails_without_allocating_it() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 0);
        let mut record = Tag::Payload.bytes().to_vec();
        record.extend_from_slice(&5i64.to_le_bytes());
        encode_uint(src as u64, &mut record);
        encode_uint(1 << 40, &mut record);
        record.extend_from_slice(b"abcd");
        builder.raw(&record);
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        let frame = reader.next_frame(src)?.context("frame with corrupt size")?;
        ensure!(frame.size == 1 << 40);
        let err = reader.read_payload().err().context("oversized payload must fail")?;
        ensure!(err.is_unexpected_eof(), "unexpected error {:?}", err);
        ensure!(reader.remaining_payload() == 1 << 40);
        Ok(())
    }

    #[test]
    fn truncated_source_declaration_is_read_once_completed() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let a = builder.add_source("a", 1);
        builder.frame(a, 1, b"x");
        let declaration_start = builder.position();
        let late = builder.add_source("late", 0);
        builder.frame(late, 2, b"late");
        let bytes = builder.into_bytes();
        let cut = declaration_start as usize + 20;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&bytes[..cut])?;
        file.flush()?;
        let mut reader = PacketStreamReader::open(file.path())?;

        ensure!(reader.next_frame(late)?.is_none(), "partial declaration must read as exhaustion");
        ensure!(reader.position() == Some(declaration_start));
        ensure!(reader.sources().len() == 1);
        ensure!(reader.current_sequence_number(a)? == 1);

        file.write_all(&bytes[cut..])?;
        file.flush()?;
        let frame = reader.next_frame(late)?.context("frame of the late source")?;
        ensure!(frame.sequence_num == 0);
        ensure!(reader.source(late).context("late source")?.driver == "late");
        ensure!(reader.read_payload()? == b"late");
        Ok(())
    }

    #[test]
    fn truncated_index_record_is_read_once_completed() -> anyhow::Result<()> {
        let mut builder = StreamBuilder::new(0);
        let a = builder.add_source("a", 1);
        builder.frame(a, 1, b"x");
        let index_start = builder.position();
        builder.index_record().frame(a, 2, b"y");
        let bytes = builder.into_bytes();
        let cut = index_start as usize + 8;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&bytes[..cut])?;
        file.flush()?;
        let mut reader = PacketStreamReader::open(file.path())?;

        reader.next_frame(a)?.context("first frame")?;
        ensure!(reader.next_frame(a)?.is_none());
        ensure!(reader.position() == Some(index_start));

        file.write_all(&bytes[cut..])?;
        file.flush()?;
        let frame = reader.next_frame(a)?.context("frame after the index record")?;
        ensure!(frame.sequence_num == 1);
        Ok(())
    }

    #[test]
    fn malformed_index_record_is_skipped() -> anyhow::Result<()> {
        init_tracing();
        let mut builder = StreamBuilder::new(0);
        let src = builder.add_source("a", 0);
        builder.frame(src, 1, b"one").raw(b"STA{garbage").frame(src, 2, b"two");
        let (_file, mut reader) = open_bytes(builder.bytes())?;

        reader.next_frame(src)?.context("frame before the bad record")?;
        ensure!(reader.read_payload()? == b"one");
        let frame = reader.next_frame(src)?.context("frame after the bad record")?;
        ensure!(frame.sequence_num == 1);
        ensure!(reader.read_payload()? == b"two");
        ensure!(reader.next_frame(src)?.is_none());
        Ok(())
    }

    #[test]
    fn payload_epoch_moves_when_the_payload_is_left() -> anyhow::Result<()> {
        let (_file, mut reader) = open_bytes(camera_imu_stream().bytes())?;
        reader.next_frame(0)?.context("camera frame")?;
        let epoch = reader.payload_epoch();
        reader.skip(1)?;
        ensure!(reader.payload_epoch() == epoch, "reading within a payload keeps the epoch");
        reader.next_frame(0)?;
        ensure!(reader.payload_epoch() != epoch);
        Ok(())
    }

    #[test]
    fn close_forgets_everything() -> anyhow::Result<()> {
        let mut builder = camera_imu_stream();
        builder.index_and_footer();
        let (_file, mut reader) = open_bytes(builder.bytes())?;
        reader.close();

        ensure!(!reader.is_open());
        ensure!(reader.sources().is_empty());
        ensure!(reader.index().is_empty());
        ensure!(reader.header().is_none());
        ensure!(matches!(reader.next_frame(0), Err(StreamError::Usage { .. })));
        Ok(())
    }

    #[test]
    fn options_deserialize_with_defaults() -> anyhow::Result<()> {
        let options: ReaderOptions = serde_json::from_str("{\"max_resync_bytes\": 4096}")?;
        ensure!(options.load_footer_index && options.follow_pipes);
        ensure!(options.max_resync_bytes == Some(4096));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn pipe_stream_waits_for_a_new_writer() -> anyhow::Result<()> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let fifo = crate::pipe::tests::make_fifo(dir.path(), "live.pango")?;

        let mut preamble = StreamBuilder::new(0);
        preamble.add_source("live", 3);
        let preamble = preamble.into_bytes();

        let writer_path = fifo.clone();
        let first_writer = std::thread::spawn(move || -> std::io::Result<()> {
            let mut pipe = std::fs::OpenOptions::new().write(true).open(&writer_path)?;
            pipe.write_all(&preamble)
        });
        let mut reader = PacketStreamReader::open(&fifo)?;
        first_writer.join().expect("writer thread panicked")?;

        ensure!(reader.is_pipe() && !reader.is_seekable());
        ensure!(matches!(reader.seek(0, 0), Err(StreamError::Usage { .. })));
        ensure!(reader.next_frame(0)?.is_none(), "empty pipe must read as exhausted");
        ensure!(reader.index().is_empty());

        let mut capture = StreamBuilder::new(10);
        let src = capture.add_source("live", 3);
        capture.frame(src, 11, b"abc");
        let mut pipe = std::fs::OpenOptions::new().write(true).open(&fifo)?;
        pipe.write_all(capture.bytes())?;
        drop(pipe);

        let frame = reader.next_frame(src)?.context("frame after writer appended")?;
        ensure!(frame.sequence_num == 0 && frame.time_us == 11);
        ensure!(reader.read_payload()? == b"abc");
        ensure!(reader.header().map(|h| h.start_time_us) == Some(10));
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn sequence_numbers_count_up_without_gaps(
            schedule in prop::collection::vec((0usize..3, prop::collection::vec(any::<u8>(), 0..16)), 0..40),
            wanted in 0usize..3,
        ) {
            let mut builder = StreamBuilder::new(0);
            builder.add_source("fixed", 4);
            builder.add_source("var0", 0);
            builder.add_source("var1", 0);
            let mut expected = Vec::new();
            for (i, (source, payload)) in schedule.iter().enumerate() {
                let payload = if *source == 0 { vec![payload.first().copied().unwrap_or(0); 4] } else { payload.clone() };
                builder.frame(*source, i as i64, &payload);
                if *source == wanted {
                    expected.push(payload);
                }
            }
            let file = builder.write_temp().expect("temp file");
            let mut reader = PacketStreamReader::open(file.path()).expect("open");

            let mut seen = 0u64;
            while let Some(frame) = reader.next_frame(wanted).expect("next frame") {
                prop_assert_eq!(frame.source, wanted);
                prop_assert_eq!(frame.sequence_num, seen);
                let payload = reader.read_payload().expect("payload");
                prop_assert_eq!(&payload, &expected[seen as usize]);
                seen += 1;
            }
            prop_assert_eq!(seen as usize, expected.len());
        }
    }
}

//! Thread-safe reader with payload leases
//!
//! [`SharedReader`] serializes access to one [`PacketStreamReader`] across
//! threads. A successful [`SharedReader::next_frame`] hands out a
//! [`PayloadLease`] that keeps the reader locked until the payload has been
//! consumed; other threads block in `next_frame`/`seek` until then. Dropping
//! the lease drains whatever is left and releases the lock.
//!
//! The lock is re-entrant: the thread holding a lease may call `seek` or
//! `next_frame` again. Doing so moves the reader off the leased payload, and
//! the old lease is superseded. Its reads fail with a usage error and
//! dropping it leaves the reader alone.

use crate::reader::{PacketStreamReader, ReaderOptions};
use crate::{FrameHeader, Result, Source, StreamError};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Reader shared between threads.
#[derive(Debug)]
pub struct SharedReader {
    inner: ReentrantMutex<RefCell<PacketStreamReader>>,
}

impl SharedReader {
    pub fn new(reader: PacketStreamReader) -> Self {
        Self { inner: ReentrantMutex::new(RefCell::new(reader)) }
    }

    /// Open a stream and wrap it for shared use.
    pub fn open<P: AsRef<Path>>(path: P, options: ReaderOptions) -> Result<Self> {
        Ok(Self::new(PacketStreamReader::with_options(path, options)?))
    }

    /// Pull the next frame of `source` and lease its payload.
    ///
    /// The reader stays locked against other threads for as long as the
    /// lease lives. A lease still held by this thread is superseded.
    pub fn next_frame(&self, source: usize) -> Result<Option<PayloadLease<'_>>> {
        let guard = self.inner.lock();
        let (header, epoch) = {
            let mut reader = guard.borrow_mut();
            let Some(header) = reader.next_frame(source)? else {
                return Ok(None);
            };
            (header, reader.payload_epoch())
        };
        Ok(Some(PayloadLease { guard, header, epoch }))
    }

    /// Seek `source` to `frame_number`; see [`PacketStreamReader::seek`].
    ///
    /// A lease held by the calling thread is superseded.
    pub fn seek(&self, source: usize, frame_number: u64) -> Result<FrameHeader> {
        self.inner.lock().borrow_mut().seek(source, frame_number)
    }

    pub fn current_sequence_number(&self, source: usize) -> Result<u64> {
        self.inner.lock().borrow().current_sequence_number(source)
    }

    /// Snapshot of the sources declared so far.
    pub fn sources(&self) -> Vec<Source> {
        self.inner.lock().borrow().sources().to_vec()
    }

    pub fn close(&self) {
        self.inner.lock().borrow_mut().close();
    }

    pub fn into_inner(self) -> PacketStreamReader {
        self.inner.into_inner().into_inner()
    }
}

/// Exclusive access to one frame's payload.
///
/// Holds the reader lock; dropping the lease drains the rest of the payload.
#[derive(Debug)]
pub struct PayloadLease<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<PacketStreamReader>>,
    header: FrameHeader,
    epoch: u64,
}

impl PayloadLease<'_> {
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// True once this thread moved the reader to another frame.
    pub fn is_superseded(&self) -> bool {
        self.guard.borrow().payload_epoch() != self.epoch
    }

    /// Bytes of the payload not yet consumed, zero once superseded.
    pub fn remaining(&self) -> u64 {
        let reader = self.guard.borrow();
        if reader.payload_epoch() != self.epoch {
            return 0;
        }
        reader.remaining_payload()
    }

    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.with_reader(|reader| reader.read_raw(buf))
    }

    pub fn skip(&mut self, len: u64) -> Result<u64> {
        self.with_reader(|reader| reader.skip(len))
    }

    /// Read the rest of the payload into a new buffer.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        self.with_reader(PacketStreamReader::read_payload)
    }

    /// Drain the payload and release the reader, reporting any read failure.
    ///
    /// A superseded lease has nothing left to drain.
    pub fn release(self) -> Result<()> {
        let remaining = self.remaining();
        if remaining > 0 {
            self.guard.borrow_mut().skip(remaining)?;
        }
        Ok(())
    }

    fn with_reader<T>(&self, f: impl FnOnce(&mut PacketStreamReader) -> Result<T>) -> Result<T> {
        let mut reader = self.guard.borrow_mut();
        if reader.payload_epoch() != self.epoch {
            return Err(StreamError::usage_error(format!(
                "payload lease on source {} frame {} was superseded by a later next_frame() or seek()",
                self.header.source, self.header.sequence_num
            )));
        }
        f(&mut *reader)
    }
}

impl io::Read for PayloadLease<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || (self.remaining() == 0 && !self.is_superseded()) {
            return Ok(0);
        }
        self.read_raw(buf).map_err(io::Error::other)
    }
}

impl Drop for PayloadLease<'_> {
    fn drop(&mut self) {
        let remaining = self.remaining();
        if remaining == 0 {
            return;
        }
        debug!("Releasing lease on frame {} with {} bytes undrained", self.header.sequence_num, remaining);
        if let Err(e) = self.guard.borrow_mut().skip(remaining) {
            warn!("Failed to drain payload of source {} frame {}: {}", self.header.source, self.header.sequence_num, e);
        }
    }
}

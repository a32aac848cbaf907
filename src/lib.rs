//! Reader for tagged, multiplexed packet stream logs.
//!
//! A packet stream interleaves timestamped frames from several sources
//! (cameras, IMUs, GPS, ...) in one append-only binary file or pipe. This
//! crate reads such streams back: frames of one source at a time, with random
//! access through a packet index, tolerance for corrupt spans and for files
//! that are still being written, and transparent reconnection to live pipes.
//!
//! # Features
//!
//! - **Sequential reading**: [`PacketStreamReader::next_frame`] skips frames of
//!   other sources and numbers frames per source
//! - **Random access**: [`PacketStreamReader::seek`] by (source, frame number),
//!   backed by the footer index or one built while reading
//! - **Live captures**: truncated trailing frames are retried, drained pipes are
//!   re-opened when a new writer appears
//! - **Sharing**: [`SharedReader`] hands out payload leases across threads
//! - **Async**: [`FrameFeed`] replays one source as a `Stream`, optionally paced
//!   by the frames' timestamps
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use packetstream::PacketStreamReader;
//!
//! fn main() -> packetstream::Result<()> {
//!     let mut reader = PacketStreamReader::open("capture.pango")?;
//!     for source in reader.sources() {
//!         println!("source {}: {} ({})", source.id, source.driver, source.uri);
//!     }
//!
//!     let header = reader.seek(0, 10)?;
//!     println!("frame 10 of source 0 starts at offset {}", header.frame_start_offset);
//!     if let Some(frame) = reader.next_frame(0)? {
//!         let payload = reader.read_payload()?;
//!         println!("{} bytes at {}us", payload.len(), frame.time_us);
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
pub mod format;
mod frame;
mod index;
mod record;
mod source;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

// Reading
mod cursor;
pub mod pipe;
pub mod reader;
pub mod shared;

// Async feed
pub mod driver;
pub mod feed;
pub mod provider;
pub mod providers;

pub use error::*;
pub use format::Tag;
pub use frame::{FrameHeader, FramePacket};
pub use index::PacketIndex;
pub use source::{Source, SourceTable};

pub use reader::{PacketStreamReader, ReaderOptions, StreamHeader};
pub use shared::{PayloadLease, SharedReader};

pub use feed::{FeedStream, FrameFeed};
pub use provider::Provider;
pub use providers::{ReplayOptions, ReplayProvider};

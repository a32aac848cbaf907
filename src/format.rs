//! Packet stream wire format constants
//!
//! A stream is a sequence of tag-prefixed records following a fixed magic
//! prefix:
//!
//! 1. **Magic** (`PANGO`, 5 bytes) at offset 0
//! 2. **Header** (`LIN`) - JSON object with the start time `time_us`
//! 3. **Source descriptors** (`SRC`) - JSON objects, may also appear later
//! 4. **Frames** - optional metadata (`JSN`) followed by a payload (`PKT`)
//! 5. **Index** (`STA`) - JSON object with `src_packet_index`
//! 6. **Footer** (`FTR`) - 8-byte little-endian offset of the index record
//!
//! Sync runs (`SYN`) and end markers (`END`) may appear between records.
//! Unsigned integers are LEB128 varints, timestamps are signed 64-bit
//! little-endian microseconds.

use std::fmt;

/// Magic byte prefix at offset 0 of every stream.
pub const MAGIC: &[u8; 5] = b"PANGO";

/// Length of every record tag in bytes.
pub const TAG_LENGTH: usize = 3;

/// Width of the footer's index offset field.
pub const FOOTER_OFFSET_SIZE: usize = 8;

/// Total footer length: tag plus offset field.
pub const FOOTER_SIZE: usize = TAG_LENGTH + FOOTER_OFFSET_SIZE;

/// Longest accepted LEB128 encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

// Header record keys
pub const HDR_TIME_US: &str = "time_us";

// Source descriptor keys
pub const SRC_DRIVER: &str = "driver";
pub const SRC_ID: &str = "id";
pub const SRC_URI: &str = "uri";
pub const SRC_INFO: &str = "info";
pub const SRC_VERSION: &str = "version";
pub const SRC_PACKET: &str = "packet";
pub const PKT_ALIGNMENT_BYTES: &str = "alignment_bytes";
pub const PKT_DEFINITIONS: &str = "definitions";
pub const PKT_SIZE_BYTES: &str = "size_bytes";

// Index record key
pub const IDX_SRC_PACKET_INDEX: &str = "src_packet_index";

/// Record tags recognized by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// First three bytes of a (re-encountered) magic prefix
    Magic,
    /// Stream header record
    Header,
    /// New source declaration
    AddSource,
    /// Per-frame metadata, always followed by a payload of the same source
    Metadata,
    /// Frame payload
    Payload,
    /// Index / statistics record
    Stats,
    /// Trailing footer pointing at the index
    Footer,
    /// Synchronization padding
    Sync,
    /// End of frames
    End,
}

impl Tag {
    pub const ALL: [Tag; 9] = [
        Tag::Magic,
        Tag::Header,
        Tag::AddSource,
        Tag::Metadata,
        Tag::Payload,
        Tag::Stats,
        Tag::Footer,
        Tag::Sync,
        Tag::End,
    ];

    /// The three bytes that encode this tag on the wire.
    pub const fn bytes(self) -> [u8; TAG_LENGTH] {
        match self {
            Tag::Magic => *b"PAN",
            Tag::Header => *b"LIN",
            Tag::AddSource => *b"SRC",
            Tag::Metadata => *b"JSN",
            Tag::Payload => *b"PKT",
            Tag::Stats => *b"STA",
            Tag::Footer => *b"FTR",
            Tag::Sync => *b"SYN",
            Tag::End => *b"END",
        }
    }

    /// Recognize a tag from its wire bytes.
    pub fn from_bytes(bytes: [u8; TAG_LENGTH]) -> Option<Tag> {
        Tag::ALL.into_iter().find(|tag| tag.bytes() == bytes)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&tag_name(self.bytes()))
    }
}

/// Printable form of raw tag bytes, escaping anything that is not ASCII graphic.
pub fn tag_name(bytes: [u8; TAG_LENGTH]) -> String {
    bytes.iter().flat_map(|b| std::ascii::escape_default(*b)).map(char::from).collect()
}

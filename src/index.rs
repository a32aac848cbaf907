//! Sparse packet index: (source, sequence number) to stream offset

use serde_json::Value;
use std::collections::BTreeMap;

/// Insert-only map from `(source, sequence)` to the offset where the frame starts.
///
/// Entries are never removed or corrected. The index is loaded from a
/// stream's footer when one exists and is extended lazily during forward
/// scanning otherwise.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PacketIndex {
    sources: Vec<BTreeMap<u64, u64>>,
}

impl PacketIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the serialized `[source][sequence] -> offset` array.
    ///
    /// Cells that are not unsigned integers (for example `null`) are absent.
    /// A value that is not an array yields an empty index.
    pub fn from_serialized(value: &Value) -> Self {
        let mut index = PacketIndex::new();
        let Some(outer) = value.as_array() else {
            return index;
        };
        for (source, frames) in outer.iter().enumerate() {
            let Some(frames) = frames.as_array() else {
                continue;
            };
            for (sequence, cell) in frames.iter().enumerate() {
                if let Some(offset) = cell.as_u64() {
                    index.add(source, sequence as u64, offset);
                }
            }
        }
        index
    }

    pub fn has(&self, source: usize, sequence: u64) -> bool {
        self.position(source, sequence).is_some()
    }

    pub fn position(&self, source: usize, sequence: u64) -> Option<u64> {
        self.sources.get(source)?.get(&sequence).copied()
    }

    /// Record an offset. Returns false and leaves the entry unchanged if it already exists.
    pub fn add(&mut self, source: usize, sequence: u64, offset: u64) -> bool {
        if self.sources.len() <= source {
            self.sources.resize_with(source + 1, BTreeMap::new);
        }
        match self.sources[source].entry(sequence) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(offset);
                true
            }
        }
    }

    /// Merge entries from another index without overwriting existing ones.
    pub fn merge(&mut self, other: &PacketIndex) {
        for (source, frames) in other.sources.iter().enumerate() {
            for (&sequence, &offset) in frames {
                self.add(source, sequence, offset);
            }
        }
    }

    /// Indexed `(sequence, offset)` pairs of one source in sequence order.
    pub fn frames(&self, source: usize) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.sources.get(source).into_iter().flat_map(|frames| frames.iter().map(|(&s, &o)| (s, o)))
    }

    /// Number of source slots (highest indexed source id + 1).
    pub fn sources(&self) -> usize {
        self.sources.len()
    }

    /// Total number of indexed frames.
    pub fn len(&self) -> usize {
        self.sources.iter().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }
}

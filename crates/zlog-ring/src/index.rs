//! Logical-to-physical slot indexing.
//!
//! Logical indices come off the wire as `u16` and keep increasing (modulo
//! 2^16) for the life of the stream; physical storage reuses the same
//! `slot_count` slots.

use crate::layout::LayoutError;

/// Maps logical slot indices to byte offsets within the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIndexer {
    pub(crate) base: usize,
    pub(crate) slot_count: u16,
    pub(crate) slot_size: u16,
}

impl SlotIndexer {
    /// Create an indexer for a slot array starting at byte `base`.
    ///
    /// A zero `slot_count` means the header is corrupt or was never
    /// initialised and is rejected here so that indexing never divides by
    /// zero.
    pub fn new(base: usize, slot_count: u16, slot_size: u16) -> Result<Self, LayoutError> {
        if slot_count == 0 {
            return Err(LayoutError::InvalidGeometry("slot_count must be > 0"));
        }
        Ok(Self {
            base,
            slot_count,
            slot_size,
        })
    }

    /// Physical slot number for a logical index.
    #[inline]
    pub fn slot_index(&self, logical: u16) -> u16 {
        logical % self.slot_count
    }

    /// Byte offset of the slot holding `logical`.
    #[inline]
    pub fn physical_offset(&self, logical: u16) -> usize {
        self.base + self.slot_index(logical) as usize * self.slot_size as usize
    }

    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    pub fn slot_size(&self) -> u16 {
        self.slot_size
    }
}

//! Ring memory layout.
//!
//! # Memory Layout
//!
//! All fields are little-endian. The slot array starts immediately after the
//! 16-byte header; any bytes after the last slot up to the end of the mapping
//! are unused.
//!
//! ```text
//! +--------+---------+------+------+------------+-----------+----------+---------------+
//! | magic  | version | head | tail | slot_count | slot_size | reserved | ring_mem_size |
//! | u8 @0  | u8 @1   | u16  | u16  | u16 @6     | u16 @8    | u16 @10  | u32 @12       |
//! |        |         | @2   | @4   |            |           |          |               |
//! +--------+---------+------+------+------------+-----------+----------+---------------+
//! | slot[0]: owner u32 | payload [u8; slot_size - 4]                                     |
//! | slot[1]: ...                                                                          |
//! | slot[slot_count - 1]                                                                  |
//! +---------------------------------------------------------------------------------------+
//! ```

use crate::index::SlotIndexer;
use crate::region::Region;

/// Magic byte identifying a zlog ring.
pub const RING_MAGIC: u8 = 0x5A;

/// Ring layout version understood by this crate.
pub const RING_VERSION: u8 = 1;

/// Size of the ring header; also the offset of the slot array.
pub const HEADER_SIZE: usize = 16;

/// Size of the owner tag at the start of every slot.
pub const OWNER_TAG_SIZE: usize = 4;

/// Slot size used by the kernel module (4-byte owner + 252-byte payload).
pub const DEFAULT_SLOT_SIZE: u16 = 256;

/// Payload capacity of a [`DEFAULT_SLOT_SIZE`] slot.
pub const DEFAULT_PAYLOAD_CAPACITY: usize = DEFAULT_SLOT_SIZE as usize - OWNER_TAG_SIZE;

/// Byte offsets of the header fields.
pub mod offsets {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 1;
    pub const HEAD: usize = 2;
    pub const TAIL: usize = 4;
    pub const SLOT_COUNT: usize = 6;
    pub const SLOT_SIZE: usize = 8;
    pub const RESERVED: usize = 10;
    pub const RING_MEM_SIZE: usize = 12;
}

const _: () = assert!(offsets::RING_MEM_SIZE + 4 == HEADER_SIZE);

// =============================================================================
// Header
// =============================================================================

/// Decoded snapshot of the ring header.
///
/// `head` and `tail` are live values owned by the kernel; a snapshot is stale
/// as soon as it is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    pub magic: u8,
    pub version: u8,
    pub head: u16,
    pub tail: u16,
    pub slot_count: u16,
    pub slot_size: u16,
    pub reserved: u16,
    pub ring_mem_size: u32,
}

impl RingHeader {
    /// Build a header for a ring with the given geometry, head/tail at zero.
    pub fn new(slot_count: u16, slot_size: u16, ring_mem_size: u32) -> Self {
        Self {
            magic: RING_MAGIC,
            version: RING_VERSION,
            head: 0,
            tail: 0,
            slot_count,
            slot_size,
            reserved: 0,
            ring_mem_size,
        }
    }

    /// Decode the header from the start of a region.
    pub fn read(region: &Region<'_>) -> Result<Self, LayoutError> {
        if region.len() < HEADER_SIZE {
            return Err(LayoutError::RegionTooSmall {
                required: HEADER_SIZE,
                found: region.len(),
            });
        }
        Ok(Self {
            magic: region.read_u8(offsets::MAGIC),
            version: region.read_u8(offsets::VERSION),
            head: region.read_u16_le(offsets::HEAD),
            tail: region.read_u16_le(offsets::TAIL),
            slot_count: region.read_u16_le(offsets::SLOT_COUNT),
            slot_size: region.read_u16_le(offsets::SLOT_SIZE),
            reserved: region.read_u16_le(offsets::RESERVED),
            ring_mem_size: region.read_u32_le(offsets::RING_MEM_SIZE),
        })
    }

    /// Encode the header into its wire bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[offsets::MAGIC] = self.magic;
        out[offsets::VERSION] = self.version;
        out[offsets::HEAD..offsets::HEAD + 2].copy_from_slice(&self.head.to_le_bytes());
        out[offsets::TAIL..offsets::TAIL + 2].copy_from_slice(&self.tail.to_le_bytes());
        out[offsets::SLOT_COUNT..offsets::SLOT_COUNT + 2]
            .copy_from_slice(&self.slot_count.to_le_bytes());
        out[offsets::SLOT_SIZE..offsets::SLOT_SIZE + 2]
            .copy_from_slice(&self.slot_size.to_le_bytes());
        out[offsets::RESERVED..offsets::RESERVED + 2].copy_from_slice(&self.reserved.to_le_bytes());
        out[offsets::RING_MEM_SIZE..offsets::RING_MEM_SIZE + 4]
            .copy_from_slice(&self.ring_mem_size.to_le_bytes());
        out
    }

    /// Payload bytes per slot (slot size minus the owner tag).
    pub fn payload_capacity(&self) -> usize {
        (self.slot_size as usize).saturating_sub(OWNER_TAG_SIZE)
    }

    /// Bytes needed for header plus slot array.
    pub fn required_size(&self) -> usize {
        HEADER_SIZE + self.slot_count as usize * self.slot_size as usize
    }
}

/// Magic and version a header must carry to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderIdentity {
    pub magic: u8,
    pub version: u8,
}

impl Default for HeaderIdentity {
    fn default() -> Self {
        Self {
            magic: RING_MAGIC,
            version: RING_VERSION,
        }
    }
}

// =============================================================================
// Validated layout
// =============================================================================

/// A validated ring over a mapped region.
///
/// Geometry (`slot_count`, `slot_size`) is fixed at ring creation and cached
/// here; `head` and `tail` are read live from the header on every call.
/// The layout borrows the mapping, like the [`Region`] it wraps.
#[derive(Debug, Clone, Copy)]
pub struct RingLayout<'a> {
    region: Region<'a>,
    slot_count: u16,
    slot_size: u16,
}

impl<'a> RingLayout<'a> {
    /// Validate the header at the start of `region`.
    ///
    /// `region.len()` is the number of bytes the caller actually mapped; the
    /// header's declared `ring_mem_size` must match it exactly.
    pub fn validate(region: Region<'a>, identity: HeaderIdentity) -> Result<Self, LayoutError> {
        let header = RingHeader::read(&region)?;

        if header.magic != identity.magic {
            return Err(LayoutError::InvalidMagic {
                expected: identity.magic,
                found: header.magic,
            });
        }
        if header.version != identity.version {
            return Err(LayoutError::IncompatibleVersion {
                expected: identity.version,
                found: header.version,
            });
        }
        if header.ring_mem_size as usize != region.len() {
            return Err(LayoutError::SizeMismatch {
                mapped: region.len(),
                declared: header.ring_mem_size,
            });
        }
        if header.slot_count == 0 {
            return Err(LayoutError::InvalidGeometry("slot_count must be > 0"));
        }
        if (header.slot_size as usize) <= OWNER_TAG_SIZE {
            return Err(LayoutError::InvalidGeometry(
                "slot_size must leave room for a payload after the owner tag",
            ));
        }
        if header.required_size() > region.len() {
            return Err(LayoutError::SlotArrayOverflow {
                required: header.required_size(),
                mapped: region.len(),
            });
        }

        Ok(Self {
            region,
            slot_count: header.slot_count,
            slot_size: header.slot_size,
        })
    }

    /// Rebuild a layout over a region whose header already passed
    /// [`validate`](Self::validate) with this indexer's geometry.
    pub(crate) fn revalidated(region: Region<'a>, indexer: SlotIndexer) -> Self {
        Self {
            region,
            slot_count: indexer.slot_count,
            slot_size: indexer.slot_size,
        }
    }

    pub fn region(&self) -> Region<'a> {
        self.region
    }

    /// Offset of the first slot.
    pub fn slot_array_offset(&self) -> usize {
        HEADER_SIZE
    }

    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    pub fn slot_size(&self) -> u16 {
        self.slot_size
    }

    pub fn payload_capacity(&self) -> usize {
        self.slot_size as usize - OWNER_TAG_SIZE
    }

    /// Mapped size in bytes.
    pub fn mapped_len(&self) -> usize {
        self.region.len()
    }

    /// Producer's next write index, as currently published.
    pub fn head(&self) -> u16 {
        self.region.read_u16_le(offsets::HEAD)
    }

    /// Consumer tail, as currently published.
    pub fn tail(&self) -> u16 {
        self.region.read_u16_le(offsets::TAIL)
    }

    /// Current header snapshot.
    pub fn header(&self) -> RingHeader {
        // The region was at least HEADER_SIZE bytes at validation time and
        // never shrinks.
        RingHeader {
            magic: self.region.read_u8(offsets::MAGIC),
            version: self.region.read_u8(offsets::VERSION),
            head: self.head(),
            tail: self.tail(),
            slot_count: self.region.read_u16_le(offsets::SLOT_COUNT),
            slot_size: self.region.read_u16_le(offsets::SLOT_SIZE),
            reserved: self.region.read_u16_le(offsets::RESERVED),
            ring_mem_size: self.region.read_u32_le(offsets::RING_MEM_SIZE),
        }
    }

    pub fn indexer(&self) -> SlotIndexer {
        SlotIndexer {
            base: HEADER_SIZE,
            slot_count: self.slot_count,
            slot_size: self.slot_size,
        }
    }

    /// Publish a new physical tail index.
    pub(crate) fn store_tail(&self, physical: u16) {
        self.region.store_u16_le(offsets::TAIL, physical);
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from header validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Mapped region cannot even hold the header.
    RegionTooSmall { required: usize, found: usize },
    /// Unrecognised magic byte.
    InvalidMagic { expected: u8, found: u8 },
    /// Unsupported layout version.
    IncompatibleVersion { expected: u8, found: u8 },
    /// Header's declared ring size differs from what was mapped.
    SizeMismatch { mapped: usize, declared: u32 },
    /// Slot geometry is unusable.
    InvalidGeometry(&'static str),
    /// Slot array extends past the end of the mapping.
    SlotArrayOverflow { required: usize, mapped: usize },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RegionTooSmall { required, found } => {
                write!(
                    f,
                    "mapped region too small: need {} bytes, got {}",
                    required, found
                )
            }
            Self::InvalidMagic { expected, found } => {
                write!(
                    f,
                    "invalid magic: expected {:#04x}, found {:#04x}",
                    expected, found
                )
            }
            Self::IncompatibleVersion { expected, found } => {
                write!(
                    f,
                    "incompatible version: expected {}, found {}",
                    expected, found
                )
            }
            Self::SizeMismatch { mapped, declared } => {
                write!(
                    f,
                    "mismatch ring memory size: mapped={}, declared={}",
                    mapped, declared
                )
            }
            Self::InvalidGeometry(msg) => write!(f, "invalid geometry: {}", msg),
            Self::SlotArrayOverflow { required, mapped } => {
                write!(
                    f,
                    "slot array needs {} bytes but only {} are mapped",
                    required, mapped
                )
            }
        }
    }
}

impl std::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn ring(header: RingHeader, mapped: usize) -> HeapRegion {
        let heap = HeapRegion::new_zeroed(mapped);
        heap.region().write_bytes(0, &header.encode());
        heap
    }

    #[test]
    fn test_header_offsets() {
        let header = RingHeader {
            magic: 0xAA,
            version: 0xBB,
            head: 0x0102,
            tail: 0x0304,
            slot_count: 0x0506,
            slot_size: 0x0708,
            reserved: 0x090A,
            ring_mem_size: 0x0B0C_0D0E,
        };
        assert_eq!(
            header.encode(),
            [
                0xAA, 0xBB, 0x02, 0x01, 0x04, 0x03, 0x06, 0x05, 0x08, 0x07, 0x0A, 0x09, 0x0E,
                0x0D, 0x0C, 0x0B
            ]
        );
    }

    #[test]
    fn test_header_read_matches_encode() {
        let mut header = RingHeader::new(4, 16, 80);
        header.head = 3;
        header.tail = 1;
        let heap = ring(header, 80);
        assert_eq!(RingHeader::read(&heap.region()).unwrap(), header);
    }

    #[test]
    fn test_validate_accepts_exact_fit() {
        let heap = ring(RingHeader::new(4, 16, 80), 80);
        let layout = RingLayout::validate(heap.region(), HeaderIdentity::default()).unwrap();
        assert_eq!(layout.slot_count(), 4);
        assert_eq!(layout.slot_size(), 16);
        assert_eq!(layout.payload_capacity(), 12);
        assert_eq!(layout.slot_array_offset(), HEADER_SIZE);
        assert_eq!(layout.mapped_len(), 80);
    }

    #[test]
    fn test_validate_accepts_trailing_slack() {
        // 4096-byte page, 256-byte slots: 15 slots fit after the header.
        let heap = ring(RingHeader::new(15, DEFAULT_SLOT_SIZE, 4096), 4096);
        let layout = RingLayout::validate(heap.region(), HeaderIdentity::default()).unwrap();
        assert_eq!(layout.payload_capacity(), DEFAULT_PAYLOAD_CAPACITY);
    }

    #[test]
    fn test_validate_rejects_size_mismatch() {
        let heap = ring(RingHeader::new(4, 16, 160), 80);
        assert_eq!(
            RingLayout::validate(heap.region(), HeaderIdentity::default()).unwrap_err(),
            LayoutError::SizeMismatch {
                mapped: 80,
                declared: 160
            }
        );
    }

    #[test]
    fn test_validate_rejects_magic_and_version() {
        let mut header = RingHeader::new(4, 16, 80);
        header.magic = b'X';
        let heap = ring(header, 80);
        assert!(matches!(
            RingLayout::validate(heap.region(), HeaderIdentity::default()),
            Err(LayoutError::InvalidMagic { found: b'X', .. })
        ));

        let mut header = RingHeader::new(4, 16, 80);
        header.version = 9;
        let heap = ring(header, 80);
        assert!(matches!(
            RingLayout::validate(heap.region(), HeaderIdentity::default()),
            Err(LayoutError::IncompatibleVersion { found: 9, .. })
        ));
    }

    #[test]
    fn test_validate_custom_identity() {
        let mut header = RingHeader::new(4, 16, 80);
        header.magic = 0x7E;
        header.version = 3;
        let heap = ring(header, 80);
        let identity = HeaderIdentity {
            magic: 0x7E,
            version: 3,
        };
        assert!(RingLayout::validate(heap.region(), identity).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let heap = ring(RingHeader::new(0, 16, 80), 80);
        assert!(matches!(
            RingLayout::validate(heap.region(), HeaderIdentity::default()),
            Err(LayoutError::InvalidGeometry(_))
        ));

        let heap = ring(RingHeader::new(4, 4, 80), 80);
        assert!(matches!(
            RingLayout::validate(heap.region(), HeaderIdentity::default()),
            Err(LayoutError::InvalidGeometry(_))
        ));

        let heap = ring(RingHeader::new(5, 16, 80), 80);
        assert_eq!(
            RingLayout::validate(heap.region(), HeaderIdentity::default()).unwrap_err(),
            LayoutError::SlotArrayOverflow {
                required: 96,
                mapped: 80
            }
        );
    }

    #[test]
    fn test_validate_rejects_tiny_region() {
        let heap = HeapRegion::new_zeroed(8);
        assert_eq!(
            RingLayout::validate(heap.region(), HeaderIdentity::default()).unwrap_err(),
            LayoutError::RegionTooSmall {
                required: HEADER_SIZE,
                found: 8
            }
        );
    }

    #[test]
    fn test_store_tail_only_touches_tail() {
        let mut header = RingHeader::new(4, 16, 80);
        header.head = 2;
        let heap = ring(header, 80);
        let layout = RingLayout::validate(heap.region(), HeaderIdentity::default()).unwrap();

        layout.store_tail(3);

        let after = layout.header();
        assert_eq!(after.tail, 3);
        assert_eq!(after.head, 2);
        assert_eq!(after.slot_count, 4);
        assert_eq!(after.ring_mem_size, 80);
    }
}

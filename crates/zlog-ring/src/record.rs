//! Slot decoding.
//!
//! A slot is a 4-byte little-endian owner tag followed by a fixed-capacity
//! payload holding a NUL-terminated message. There is no length prefix.

use crate::layout::OWNER_TAG_SIZE;
use crate::region::Region;

/// What to do with a payload that has no NUL byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminatorPolicy {
    /// Take the whole payload as the message and mark the record
    /// unterminated.
    #[default]
    Lossy,
    /// Fail the decode with [`DecodeError::MissingTerminator`].
    Strict,
}

/// A decoded log record, copied out of shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Producer tag.
    pub owner: u32,
    /// Message text; invalid UTF-8 sequences are replaced.
    pub message: String,
    /// Whether a NUL terminator was found inside the payload.
    pub terminated: bool,
}

/// Decode a slot's bytes.
///
/// `slot` is the whole slot: owner tag plus payload.
pub fn decode_slot(slot: &[u8], policy: TerminatorPolicy) -> Result<Record, DecodeError> {
    if slot.len() <= OWNER_TAG_SIZE {
        return Err(DecodeError::SlotTooShort { len: slot.len() });
    }
    let (tag, payload) = slot.split_at(OWNER_TAG_SIZE);
    let owner = u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]);

    let (len, terminated) = match payload.iter().position(|&b| b == 0) {
        Some(nul) => (nul, true),
        None if policy == TerminatorPolicy::Strict => {
            return Err(DecodeError::MissingTerminator {
                capacity: payload.len(),
            });
        }
        None => (payload.len(), false),
    };

    Ok(Record {
        owner,
        message: String::from_utf8_lossy(&payload[..len]).into_owned(),
        terminated,
    })
}

/// Copy the slot at `offset` out of the region and decode it.
pub(crate) fn read_slot(
    region: &Region<'_>,
    offset: usize,
    slot_size: usize,
    policy: TerminatorPolicy,
) -> Result<Record, DecodeError> {
    let mut slot = vec![0u8; slot_size];
    region.copy_to(offset, &mut slot);
    decode_slot(&slot, policy)
}

/// Write a record into a slot buffer, the way the kernel producer does.
///
/// The message is truncated to the payload capacity; the remainder of the
/// payload is zero-filled.
pub(crate) fn encode_slot(owner: u32, message: &[u8], slot: &mut [u8]) {
    slot.fill(0);
    slot[..OWNER_TAG_SIZE].copy_from_slice(&owner.to_le_bytes());
    let payload = &mut slot[OWNER_TAG_SIZE..];
    let n = message.len().min(payload.len());
    payload[..n].copy_from_slice(&message[..n]);
}

/// Errors from slot decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Slot is too small to hold an owner tag and any payload.
    SlotTooShort { len: usize },
    /// No NUL byte inside the payload (strict policy only).
    MissingTerminator { capacity: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlotTooShort { len } => write!(f, "slot of {} bytes has no payload", len),
            Self::MissingTerminator { capacity } => {
                write!(f, "no terminator within {} byte payload", capacity)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

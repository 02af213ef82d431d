//! Claim/acknowledge handshake.
//!
//! A claim is one synchronous request/response on the device's byte-stream
//! interface: the consumer fills an 8-byte record with a fresh owner id and
//! issues it as a `read`; the kernel overwrites `start` and `count` (and may
//! reassign `owner`) and the same bytes come back.
//!
//! Acknowledgement has no round-trip. It is a store of the new physical tail
//! into the mapped header, the only header field the consumer ever writes.

use std::io;
use std::sync::atomic::{Ordering, fence};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::layout::RingLayout;

/// Size of the claim request/response record.
pub const CLAIM_WIRE_SIZE: usize = 8;

/// Owner ids are drawn uniformly from `0..OWNER_ID_RANGE`.
pub const OWNER_ID_RANGE: u32 = 1024;

/// A window of slots granted by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimWindow {
    /// Owner id echoed or assigned by the kernel.
    pub owner: u32,
    /// First logical index in the window.
    pub start: u16,
    /// Number of slots granted. Zero means nothing new.
    pub count: u16,
}

impl ClaimWindow {
    /// The request half of the exchange: only `owner` is meaningful.
    pub fn request(owner: u32) -> Self {
        Self {
            owner,
            start: 0,
            count: 0,
        }
    }

    /// Wire form: `owner:u32 | start:u16 | count:u16`, little-endian.
    pub fn encode(&self) -> [u8; CLAIM_WIRE_SIZE] {
        let mut out = [0u8; CLAIM_WIRE_SIZE];
        out[0..4].copy_from_slice(&self.owner.to_le_bytes());
        out[4..6].copy_from_slice(&self.start.to_le_bytes());
        out[6..8].copy_from_slice(&self.count.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; CLAIM_WIRE_SIZE]) -> Self {
        Self {
            owner: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            start: u16::from_le_bytes([bytes[4], bytes[5]]),
            count: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Logical index one past the window; the tail to acknowledge once the
    /// whole window has been consumed.
    #[inline]
    pub fn end(&self) -> u16 {
        self.start.wrapping_add(self.count)
    }

    /// Logical indices in the window, oldest first.
    pub fn indices(&self) -> impl Iterator<Item = u16> + use<> {
        let start = self.start;
        (0..self.count).map(move |i| start.wrapping_add(i))
    }
}

/// The request/response half of a ring device.
pub trait ControlChannel {
    /// Issue `buf` as a claim request and let the kernel fill it in place.
    ///
    /// Returns how many bytes the kernel produced.
    fn exchange(&mut self, buf: &mut [u8; CLAIM_WIRE_SIZE]) -> io::Result<usize>;
}

/// Result of an acknowledge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The tail was published.
    Committed { logical: u16, physical: u16 },
    /// Same value as the previous acknowledge; nothing was written.
    Unchanged,
}

/// Consumer side of the claim protocol for one session.
///
/// Owns the session's random source, so owner ids are reproducible when a
/// seed is supplied.
pub struct ClaimProtocol {
    rng: StdRng,
    requested_owner: Option<u32>,
    window: Option<ClaimWindow>,
    committed: Option<u16>,
}

impl ClaimProtocol {
    /// Create a protocol instance; `None` seeds from OS entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            requested_owner: None,
            window: None,
            committed: None,
        }
    }

    /// Draw the next owner id.
    pub fn next_owner(&mut self) -> u32 {
        self.rng.gen_range(0..OWNER_ID_RANGE)
    }

    /// Request a window from the kernel.
    ///
    /// The exchange is all-or-nothing: a failed or short response is an error
    /// and is never retried here, since a retry could double-claim.
    pub fn claim<C: ControlChannel + ?Sized>(
        &mut self,
        channel: &mut C,
    ) -> Result<ClaimWindow, ClaimError> {
        let owner = self.next_owner();
        let mut buf = ClaimWindow::request(owner).encode();

        let got = channel.exchange(&mut buf).map_err(ClaimError::Io)?;
        if got < CLAIM_WIRE_SIZE {
            return Err(ClaimError::ShortResponse {
                expected: CLAIM_WIRE_SIZE,
                got,
            });
        }
        // Slots in the window were written before the kernel answered.
        fence(Ordering::Acquire);

        let window = ClaimWindow::decode(&buf);
        if window.owner != owner {
            tracing::debug!(
                requested = owner,
                granted = window.owner,
                "kernel reassigned claim owner"
            );
        }
        tracing::trace!(
            owner = window.owner,
            start = window.start,
            count = window.count,
            "claimed window"
        );

        self.requested_owner = Some(owner);
        self.window = Some(window);
        Ok(window)
    }

    /// Publish `new_tail` as the consumer's committed position.
    ///
    /// Repeating the previous value is a no-op. The tail never moves
    /// backward, and never past the end of the most recently granted window.
    ///
    /// The no-op check compares logical values only, whichever window the
    /// previous commit belonged to. That is enough because equal logical
    /// values always map to the same physical tail, so the skipped store
    /// would publish the tail already committed.
    pub fn acknowledge(&mut self, layout: &RingLayout<'_>, new_tail: u16) -> Result<Ack, AckError> {
        if self.committed == Some(new_tail) {
            return Ok(Ack::Unchanged);
        }

        match self.window {
            Some(window) => {
                let offset = new_tail.wrapping_sub(window.start);
                if offset > window.count {
                    return Err(if offset >= HALF_RANGE {
                        AckError::Regression {
                            committed: self.committed.unwrap_or(window.start),
                            requested: new_tail,
                        }
                    } else {
                        AckError::Overrun {
                            granted_end: window.end(),
                            requested: new_tail,
                        }
                    });
                }
                if let Some(committed) = self.committed {
                    let committed_offset = committed.wrapping_sub(window.start);
                    if committed_offset <= window.count && offset < committed_offset {
                        return Err(AckError::Regression {
                            committed,
                            requested: new_tail,
                        });
                    }
                }
            }
            None => {
                if let Some(committed) = self.committed
                    && precedes(new_tail, committed)
                {
                    return Err(AckError::Regression {
                        committed,
                        requested: new_tail,
                    });
                }
            }
        }

        let physical = layout.indexer().slot_index(new_tail);
        layout.store_tail(physical);
        self.committed = Some(new_tail);
        tracing::trace!(logical = new_tail, physical, "committed tail");

        Ok(Ack::Committed {
            logical: new_tail,
            physical,
        })
    }

    /// Owner id sent with the most recent claim.
    pub fn requested_owner(&self) -> Option<u32> {
        self.requested_owner
    }

    /// Most recently granted window.
    pub fn window(&self) -> Option<ClaimWindow> {
        self.window
    }

    /// Last acknowledged logical tail.
    pub fn committed(&self) -> Option<u16> {
        self.committed
    }
}

const HALF_RANGE: u16 = 1 << 15;

/// Serial-number comparison: `a` comes strictly before `b`.
#[inline]
fn precedes(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < HALF_RANGE
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from the claim exchange.
#[derive(Debug)]
pub enum ClaimError {
    /// The control-channel read failed.
    Io(io::Error),
    /// The kernel returned fewer bytes than a full claim record.
    ShortResponse { expected: usize, got: usize },
}

impl std::fmt::Display for ClaimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "claim read failed: {}", e),
            Self::ShortResponse { expected, got } => {
                write!(
                    f,
                    "short claim response: expected {} bytes, got {}",
                    expected, got
                )
            }
        }
    }
}

impl std::error::Error for ClaimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckError {
    /// The requested tail lies behind what was already committed.
    Regression { committed: u16, requested: u16 },
    /// The requested tail lies past the end of the granted window.
    Overrun { granted_end: u16, requested: u16 },
}

impl std::fmt::Display for AckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regression {
                committed,
                requested,
            } => write!(
                f,
                "tail may not move backward: committed {}, requested {}",
                committed, requested
            ),
            Self::Overrun {
                granted_end,
                requested,
            } => write!(
                f,
                "tail {} is past the granted window end {}",
                requested, granted_end
            ),
        }
    }
}

impl std::error::Error for AckError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{HeaderIdentity, RingHeader};
    use crate::region::HeapRegion;

    /// Control channel answering from a fixed response.
    struct Canned {
        response: io::Result<(ClaimWindow, usize)>,
        seen: Vec<u32>,
    }

    impl Canned {
        fn window(owner: Option<u32>, start: u16, count: u16) -> Self {
            Self {
                response: Ok((
                    ClaimWindow {
                        owner: owner.unwrap_or(u32::MAX),
                        start,
                        count,
                    },
                    CLAIM_WIRE_SIZE,
                )),
                seen: Vec::new(),
            }
        }
    }

    impl ControlChannel for Canned {
        fn exchange(&mut self, buf: &mut [u8; CLAIM_WIRE_SIZE]) -> io::Result<usize> {
            let request = ClaimWindow::decode(buf);
            self.seen.push(request.owner);
            match &self.response {
                Ok((window, n)) => {
                    let mut reply = *window;
                    if reply.owner == u32::MAX {
                        reply.owner = request.owner;
                    }
                    *buf = reply.encode();
                    Ok(*n)
                }
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            }
        }
    }

    fn ring(slot_count: u16, slot_size: u16) -> HeapRegion {
        let len = 16 + slot_count as usize * slot_size as usize;
        let heap = HeapRegion::new_zeroed(len);
        heap.region()
            .write_bytes(0, &RingHeader::new(slot_count, slot_size, len as u32).encode());
        heap
    }

    fn validated(heap: &HeapRegion) -> RingLayout<'_> {
        RingLayout::validate(heap.region(), HeaderIdentity::default()).unwrap()
    }

    #[test]
    fn test_wire_layout() {
        let window = ClaimWindow {
            owner: 0x0403_0201,
            start: 0x0605,
            count: 0x0807,
        };
        assert_eq!(window.encode(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ClaimWindow::decode(&[1, 2, 3, 4, 5, 6, 7, 8]), window);
    }

    #[test]
    fn test_window_indices_wrap_u16() {
        let window = ClaimWindow {
            owner: 0,
            start: u16::MAX - 1,
            count: 3,
        };
        assert_eq!(window.indices().collect::<Vec<_>>(), vec![65534, 65535, 0]);
        assert_eq!(window.end(), 1);
    }

    #[test]
    fn test_owner_ids_are_seeded_and_bounded() {
        let mut a = ClaimProtocol::new(Some(42));
        let mut b = ClaimProtocol::new(Some(42));
        for _ in 0..256 {
            let owner = a.next_owner();
            assert_eq!(owner, b.next_owner());
            assert!(owner < OWNER_ID_RANGE);
        }
    }

    #[test]
    fn test_claim_sends_owner_and_decodes_window() {
        let mut protocol = ClaimProtocol::new(Some(7));
        let mut channel = Canned::window(None, 2, 3);

        let window = protocol.claim(&mut channel).unwrap();

        assert_eq!(channel.seen.len(), 1);
        assert_eq!(window.owner, channel.seen[0]);
        assert_eq!(protocol.requested_owner(), Some(window.owner));
        assert_eq!((window.start, window.count), (2, 3));
        assert_eq!(protocol.window(), Some(window));
    }

    #[test]
    fn test_claim_reports_reassigned_owner() {
        let mut protocol = ClaimProtocol::new(Some(7));
        let mut channel = Canned::window(Some(5000), 0, 1);
        let window = protocol.claim(&mut channel).unwrap();
        assert_eq!(window.owner, 5000);
        assert_ne!(protocol.requested_owner(), Some(5000));
    }

    #[test]
    fn test_empty_window_is_not_an_error() {
        let mut protocol = ClaimProtocol::new(Some(1));
        let window = protocol.claim(&mut Canned::window(None, 9, 0)).unwrap();
        assert!(window.is_empty());
        assert_eq!(window.indices().count(), 0);
    }

    #[test]
    fn test_short_response_is_an_error() {
        let mut protocol = ClaimProtocol::new(Some(1));
        let mut channel = Canned {
            response: Ok((ClaimWindow::request(0), 5)),
            seen: Vec::new(),
        };
        assert!(matches!(
            protocol.claim(&mut channel),
            Err(ClaimError::ShortResponse {
                expected: 8,
                got: 5
            })
        ));
        assert_eq!(protocol.window(), None);
    }

    #[test]
    fn test_io_failure_is_an_error() {
        let mut protocol = ClaimProtocol::new(Some(1));
        let mut channel = Canned {
            response: Err(io::Error::from(io::ErrorKind::BrokenPipe)),
            seen: Vec::new(),
        };
        let err = protocol.claim(&mut channel).unwrap_err();
        assert!(matches!(err, ClaimError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_acknowledge_wraps_to_physical_tail() {
        let heap = ring(4, 16);
        let layout = validated(&heap);
        let mut protocol = ClaimProtocol::new(Some(3));
        protocol.claim(&mut Canned::window(None, 2, 3)).unwrap();

        assert_eq!(
            protocol.acknowledge(&layout, 5),
            Ok(Ack::Committed {
                logical: 5,
                physical: 1
            })
        );
        assert_eq!(layout.tail(), 1);
        assert_eq!(protocol.committed(), Some(5));
    }

    #[test]
    fn test_acknowledge_is_idempotent() {
        let heap = ring(4, 16);
        let layout = validated(&heap);
        let mut protocol = ClaimProtocol::new(Some(3));
        protocol.claim(&mut Canned::window(None, 2, 3)).unwrap();

        protocol.acknowledge(&layout, 5).unwrap();
        // Scribble over the tail: an Unchanged ack must not touch it.
        layout.store_tail(3);
        assert_eq!(protocol.acknowledge(&layout, 5), Ok(Ack::Unchanged));
        assert_eq!(layout.tail(), 3);
    }

    #[test]
    fn test_repeat_commit_across_windows_is_unchanged() {
        let heap = ring(4, 16);
        let layout = validated(&heap);
        let mut protocol = ClaimProtocol::new(Some(3));
        protocol.claim(&mut Canned::window(None, 2, 3)).unwrap();
        protocol.acknowledge(&layout, 5).unwrap();
        assert_eq!(layout.tail(), 1);

        // A later, empty window starting at the committed position.
        protocol.claim(&mut Canned::window(None, 5, 0)).unwrap();
        assert_eq!(protocol.acknowledge(&layout, 5), Ok(Ack::Unchanged));
        assert_eq!(layout.tail(), layout.indexer().slot_index(5));
    }

    #[test]
    fn test_acknowledge_partial_then_rest() {
        let heap = ring(4, 16);
        let layout = validated(&heap);
        let mut protocol = ClaimProtocol::new(Some(3));
        protocol.claim(&mut Canned::window(None, 2, 3)).unwrap();

        assert!(protocol.acknowledge(&layout, 3).is_ok());
        assert_eq!(layout.tail(), 3);
        assert!(protocol.acknowledge(&layout, 5).is_ok());
        assert_eq!(layout.tail(), 1);
    }

    #[test]
    fn test_acknowledge_rejects_regression() {
        let heap = ring(4, 16);
        let layout = validated(&heap);
        let mut protocol = ClaimProtocol::new(Some(3));
        protocol.claim(&mut Canned::window(None, 2, 3)).unwrap();
        protocol.acknowledge(&layout, 4).unwrap();

        assert_eq!(
            protocol.acknowledge(&layout, 3),
            Err(AckError::Regression {
                committed: 4,
                requested: 3
            })
        );
        assert_eq!(
            protocol.acknowledge(&layout, 1),
            Err(AckError::Regression {
                committed: 4,
                requested: 1
            })
        );
        assert_eq!(layout.tail(), 0);
    }

    #[test]
    fn test_acknowledge_rejects_overrun() {
        let heap = ring(4, 16);
        let layout = validated(&heap);
        let mut protocol = ClaimProtocol::new(Some(3));
        protocol.claim(&mut Canned::window(None, 2, 3)).unwrap();

        assert_eq!(
            protocol.acknowledge(&layout, 6),
            Err(AckError::Overrun {
                granted_end: 5,
                requested: 6
            })
        );
        assert_eq!(layout.tail(), 0);
    }

    #[test]
    fn test_next_window_may_restart_at_physical_index() {
        let heap = ring(4, 16);
        let layout = validated(&heap);
        let mut protocol = ClaimProtocol::new(Some(3));
        protocol.claim(&mut Canned::window(None, 2, 3)).unwrap();
        protocol.acknowledge(&layout, 5).unwrap();

        // Kernel reports starts as physical slot numbers.
        protocol.claim(&mut Canned::window(None, 1, 2)).unwrap();
        assert!(protocol.acknowledge(&layout, 3).is_ok());
        assert_eq!(layout.tail(), 3);
    }

    #[test]
    fn test_serial_comparison() {
        assert!(precedes(1, 2));
        assert!(precedes(65535, 0));
        assert!(!precedes(2, 1));
        assert!(!precedes(5, 5));
    }
}

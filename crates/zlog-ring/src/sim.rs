//! In-process model of the kernel side of a zlog ring.
//!
//! `SimulatedRing` owns a heap buffer laid out exactly like the device
//! mapping and answers claim requests the way the kernel module does:
//! every claim grants all slots written since the previous grant, reported
//! as a physical start index plus a count. Consumer progress is observed by
//! watching the header tail, just as the kernel does.
//!
//! One slot is always kept free so that a tail that advanced by a full lap
//! cannot be mistaken for one that did not move.
//!
//! Clones share the same ring: hand one to a [`RingSession`](crate::RingSession)
//! and keep another to produce records and inspect state.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::claim::{CLAIM_WIRE_SIZE, ClaimWindow, ControlChannel};
use crate::device::RingDevice;
use crate::layout::{HEADER_SIZE, RingHeader, offsets};
use crate::record::encode_slot;
use crate::region::{HeapRegion, Region};

/// A simulated ring device.
#[derive(Clone)]
pub struct SimulatedRing {
    shared: Arc<Shared>,
}

struct Shared {
    memory: HeapRegion,
    slot_count: u16,
    slot_size: u16,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    /// Next logical index the producer writes.
    head: u64,
    /// Next logical index to hand out in a claim.
    granted: u64,
    /// Consumer progress as last observed through the header tail.
    tail: u64,
    last_tail: u16,
    script: VecDeque<Scripted>,
    claims: Vec<u32>,
    owner_override: Option<u32>,
}

enum Scripted {
    Window { start: u16, count: u16 },
    Fail(io::ErrorKind),
    Short(usize),
}

impl SimulatedRing {
    /// A ring whose mapping is exactly header plus slot array.
    pub fn new(slot_count: u16, slot_size: u16) -> Self {
        let len = HEADER_SIZE + slot_count as usize * slot_size as usize;
        Self::with_mapped_len(slot_count, slot_size, len)
    }

    /// A ring mapped at `mapped_len` bytes (e.g. a whole number of pages),
    /// with the header declaring that size.
    pub fn with_mapped_len(slot_count: u16, slot_size: u16, mapped_len: usize) -> Self {
        let header = RingHeader::new(slot_count, slot_size, mapped_len as u32);
        Self::with_header(header, mapped_len)
    }

    /// A ring with an arbitrary header, valid or not.
    pub fn with_header(header: RingHeader, mapped_len: usize) -> Self {
        let memory = HeapRegion::new_zeroed(mapped_len);
        let encoded = header.encode();
        let n = encoded.len().min(mapped_len);
        memory.region().write_bytes(0, &encoded[..n]);

        Self {
            shared: Arc::new(Shared {
                memory,
                slot_count: header.slot_count,
                slot_size: header.slot_size,
                state: Mutex::new(SimState {
                    last_tail: header.tail,
                    ..SimState::default()
                }),
            }),
        }
    }

    fn region_ref(&self) -> Region<'_> {
        self.shared.memory.region()
    }

    fn slot_offset(&self, physical: u16) -> usize {
        HEADER_SIZE + physical as usize * self.shared.slot_size as usize
    }

    fn observe_tail(&self, state: &mut SimState) {
        let n = self.shared.slot_count;
        if n == 0 {
            return;
        }
        let tail = self.region_ref().read_u16_le(offsets::TAIL) % n;
        let moved = (tail as u64 + n as u64 - (state.last_tail % n) as u64) % n as u64;
        let outstanding = state.granted - state.tail;
        state.tail += moved.min(outstanding);
        state.last_tail = tail;
    }

    /// Append a record as the producer, returning the physical slot used.
    pub fn push(&self, owner: u32, message: &str) -> Result<u16, SimError> {
        let n = self.shared.slot_count;
        let mut state = self.shared.state.lock();
        self.observe_tail(&mut state);

        if n < 2 || state.head - state.tail >= (n - 1) as u64 {
            return Err(SimError::Full);
        }

        let physical = (state.head % n as u64) as u16;
        self.write_slot(physical, owner, message.as_bytes());
        state.head += 1;
        self.region_ref()
            .store_u16_le(offsets::HEAD, (state.head % n as u64) as u16);
        Ok(physical)
    }

    /// Overwrite a slot directly, bypassing the producer bookkeeping.
    ///
    /// `payload` is truncated to the slot's capacity and not terminated, so
    /// a full-capacity payload produces an unterminated record.
    pub fn write_slot(&self, physical: u16, owner: u32, payload: &[u8]) {
        let mut slot = vec![0u8; self.shared.slot_size as usize];
        encode_slot(owner, payload, &mut slot);
        self.region_ref()
            .write_bytes(self.slot_offset(physical), &slot);
    }

    /// Answer the next claim with exactly this window.
    pub fn script_window(&self, start: u16, count: u16) {
        self.shared
            .state
            .lock()
            .script
            .push_back(Scripted::Window { start, count });
    }

    /// Fail the next claim with an I/O error.
    pub fn fail_next_claim(&self, kind: io::ErrorKind) {
        self.shared
            .state
            .lock()
            .script
            .push_back(Scripted::Fail(kind));
    }

    /// Answer the next claim with only `bytes` bytes.
    pub fn short_next_claim(&self, bytes: usize) {
        self.shared
            .state
            .lock()
            .script
            .push_back(Scripted::Short(bytes));
    }

    /// Reply to claims with this owner instead of echoing the request.
    pub fn assign_owner(&self, owner: Option<u32>) {
        self.shared.state.lock().owner_override = owner;
    }

    /// Owner ids seen in claim requests, in order.
    pub fn claims(&self) -> Vec<u32> {
        self.shared.state.lock().claims.clone()
    }

    /// Header tail as currently published.
    pub fn tail(&self) -> u16 {
        self.region_ref().read_u16_le(offsets::TAIL)
    }

    /// Header head as currently published.
    pub fn head(&self) -> u16 {
        self.region_ref().read_u16_le(offsets::HEAD)
    }

    /// Records written but not yet granted to any claim.
    pub fn pending(&self) -> u64 {
        let state = self.shared.state.lock();
        state.head - state.granted
    }
}

impl ControlChannel for SimulatedRing {
    fn exchange(&mut self, buf: &mut [u8; CLAIM_WIRE_SIZE]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        let request = ClaimWindow::decode(buf);
        state.claims.push(request.owner);
        let owner = state.owner_override.unwrap_or(request.owner);

        let reply = match state.script.pop_front() {
            Some(Scripted::Fail(kind)) => return Err(io::Error::from(kind)),
            Some(Scripted::Short(bytes)) => return Ok(bytes.min(CLAIM_WIRE_SIZE)),
            Some(Scripted::Window { start, count }) => ClaimWindow {
                owner,
                start,
                count,
            },
            None => {
                self.observe_tail(&mut state);
                let n = self.shared.slot_count.max(1) as u64;
                let start = (state.granted % n) as u16;
                let count = (state.head - state.granted) as u16;
                state.granted = state.head;
                ClaimWindow {
                    owner,
                    start,
                    count,
                }
            }
        };

        *buf = reply.encode();
        Ok(CLAIM_WIRE_SIZE)
    }
}

impl RingDevice for SimulatedRing {
    fn region(&self) -> Region<'_> {
        self.region_ref()
    }
}

/// Errors from the simulated producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// Every usable slot holds an unacknowledged record.
    Full,
}

impl std::fmt::Display for SimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "ring is full"),
        }
    }
}

impl std::error::Error for SimError {}

//! Ring session: mapping lifetime plus claim → read → acknowledge.
//!
//! ```text
//! Unopened --open--> Mapped --claim--> Reading --acknowledge--> Mapped
//!                       \                  \
//!                        +------close-------+--> Closed (terminal)
//! ```
//!
//! A session is single-threaded: claim, read, and acknowledge for one session
//! must run strictly in sequence. Separate sessions on the same ring get no
//! mutual exclusion from this crate beyond the kernel's window allocation.

use std::path::Path;

use crate::claim::{Ack, ClaimProtocol, ClaimWindow};
use crate::config::RingConfig;
use crate::device::{DeviceMapping, RingDevice};
use crate::error::SessionError;
use crate::index::SlotIndexer;
use crate::layout::{RingHeader, RingLayout};
use crate::record::{DecodeError, Record, TerminatorPolicy, read_slot};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Mapped and validated; no window outstanding.
    Mapped,
    /// A non-empty window has been claimed but not fully acknowledged.
    Reading(ClaimWindow),
    /// Released. Every operation now fails with [`SessionError::Closed`].
    Closed,
}

struct Open<D> {
    device: D,
    indexer: SlotIndexer,
    protocol: ClaimProtocol,
    outstanding: Option<ClaimWindow>,
}

/// A consumer session on a mapped ring.
///
/// Dropping the session releases the mapping; [`close`](Self::close) does the
/// same eagerly and may be called any number of times.
pub struct RingSession<D: RingDevice = DeviceMapping> {
    inner: Option<Open<D>>,
    terminator: TerminatorPolicy,
}

impl RingSession<DeviceMapping> {
    /// Open `path` and map `page_size * mem_order` bytes of it.
    pub fn open(path: impl AsRef<Path>, mem_order: usize) -> Result<Self, SessionError> {
        Self::open_with(&RingConfig {
            path: path.as_ref().to_path_buf(),
            mem_order,
            ..RingConfig::default()
        })
    }

    /// Open the device described by `config`.
    pub fn open_with(config: &RingConfig) -> Result<Self, SessionError> {
        let device = DeviceMapping::open(&config.path, config.mem_order)?;
        Self::attach(device, config)
    }
}

impl<D: RingDevice> Open<D> {
    fn layout(&self) -> RingLayout<'_> {
        RingLayout::revalidated(self.device.region(), self.indexer)
    }
}

impl<D: RingDevice> RingSession<D> {
    /// Validate the ring behind an already-mapped device and take ownership
    /// of it.
    ///
    /// On error the device is dropped, so a failed attach never leaks the
    /// mapping.
    pub fn attach(device: D, config: &RingConfig) -> Result<Self, SessionError> {
        let indexer = {
            let layout = RingLayout::validate(device.region(), config.identity())?;
            tracing::debug!(
                slot_count = layout.slot_count(),
                slot_size = layout.slot_size(),
                mapped_len = layout.mapped_len(),
                "ring session attached"
            );
            layout.indexer()
        };

        Ok(Self {
            inner: Some(Open {
                device,
                indexer,
                protocol: ClaimProtocol::new(config.seed),
                outstanding: None,
            }),
            terminator: config.terminator,
        })
    }

    fn open_ref(&self) -> Result<&Open<D>, SessionError> {
        self.inner.as_ref().ok_or(SessionError::Closed)
    }

    fn open_mut(&mut self) -> Result<&mut Open<D>, SessionError> {
        self.inner.as_mut().ok_or(SessionError::Closed)
    }

    pub fn state(&self) -> SessionState {
        match &self.inner {
            None => SessionState::Closed,
            Some(open) => match open.outstanding {
                Some(window) => SessionState::Reading(window),
                None => SessionState::Mapped,
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Ask the kernel for a window of unread slots.
    ///
    /// An empty window is a normal result meaning nothing new is available.
    pub fn claim(&mut self) -> Result<ClaimWindow, SessionError> {
        let open = self.open_mut()?;
        if let Some(previous) = open.outstanding {
            tracing::debug!(
                start = previous.start,
                count = previous.count,
                "claiming over an unacknowledged window"
            );
        }
        let window = open.protocol.claim(&mut open.device)?;
        open.outstanding = (!window.is_empty()).then_some(window);
        Ok(window)
    }

    /// Lazily decode the records of `window`, oldest first.
    pub fn records(&self, window: &ClaimWindow) -> Result<Records<'_>, SessionError> {
        let open = self.open_ref()?;
        Ok(Records {
            layout: open.layout(),
            indexer: open.indexer,
            next: 0,
            window: *window,
            terminator: self.terminator,
        })
    }

    /// Decode every record in `window`, oldest first.
    pub fn read_window(&self, window: &ClaimWindow) -> Result<Vec<Record>, SessionError> {
        self.records(window)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(SessionError::from)
    }

    /// Claim a window and decode all of it.
    pub fn claim_and_read(&mut self) -> Result<(ClaimWindow, Vec<Record>), SessionError> {
        let window = self.claim()?;
        let records = self.read_window(&window)?;
        Ok((window, records))
    }

    /// Decode the slot holding logical index `logical`.
    pub fn record(&self, logical: u16) -> Result<Record, SessionError> {
        let open = self.open_ref()?;
        let offset = open.indexer.physical_offset(logical);
        Ok(read_slot(
            &open.device.region(),
            offset,
            open.indexer.slot_size() as usize,
            self.terminator,
        )?)
    }

    /// Report `window` as fully consumed.
    ///
    /// Must only be called after every record in the window has been read;
    /// the kernel may reuse the slots as soon as the tail moves.
    pub fn acknowledge(&mut self, window: &ClaimWindow) -> Result<Ack, SessionError> {
        if window.is_empty() {
            self.open_ref()?;
            return Ok(Ack::Unchanged);
        }
        self.acknowledge_through(window.end())
    }

    /// Publish `new_tail` as the committed logical position.
    pub fn acknowledge_through(&mut self, new_tail: u16) -> Result<Ack, SessionError> {
        let open = self.open_mut()?;
        let layout = RingLayout::revalidated(open.device.region(), open.indexer);
        let ack = open.protocol.acknowledge(&layout, new_tail)?;
        if open.outstanding.is_some_and(|w| w.end() == new_tail) {
            open.outstanding = None;
        }
        Ok(ack)
    }

    /// Current header snapshot.
    pub fn header(&self) -> Result<RingHeader, SessionError> {
        Ok(self.open_ref()?.layout().header())
    }

    /// Owner id sent with the most recent claim.
    pub fn requested_owner(&self) -> Result<Option<u32>, SessionError> {
        Ok(self.open_ref()?.protocol.requested_owner())
    }

    /// Borrow the underlying device.
    pub fn device(&self) -> Result<&D, SessionError> {
        Ok(&self.open_ref()?.device)
    }

    /// Release the mapping and the device handle. Idempotent.
    pub fn close(&mut self) {
        if let Some(open) = self.inner.take() {
            drop(open);
            tracing::debug!("ring session closed");
        }
    }
}

/// Iterator over the records of a claimed window.
pub struct Records<'a> {
    layout: RingLayout<'a>,
    indexer: SlotIndexer,
    next: u16,
    window: ClaimWindow,
    terminator: TerminatorPolicy,
}

impl Iterator for Records<'_> {
    type Item = Result<Record, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.window.count {
            return None;
        }
        let logical = self.window.start.wrapping_add(self.next);
        self.next += 1;
        let offset = self.indexer.physical_offset(logical);
        Some(read_slot(
            &self.layout.region(),
            offset,
            self.indexer.slot_size() as usize,
            self.terminator,
        ))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.window.count - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Records<'_> {}

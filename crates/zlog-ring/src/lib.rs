//! Consumer for kernel-resident zlog ring buffers.
//!
//! The kernel module exposes a ring of fixed-size log slots through a device
//! node. A consumer maps the node, claims a window of unread slots over the
//! node's read interface, decodes the records in place, and acknowledges the
//! window by publishing a new tail in the mapped header.
//!
//! ```no_run
//! use zlog_ring::RingSession;
//!
//! let mut session = RingSession::open("/proc/zlog", 16)?;
//! let (window, records) = session.claim_and_read()?;
//! for (i, record) in records.iter().enumerate() {
//!     println!("zlog[{i}]: owner:{}, {}", record.owner, record.message);
//! }
//! session.acknowledge(&window)?;
//! # Ok::<(), zlog_ring::SessionError>(())
//! ```
//!
//! # Modules
//!
//! - [`layout`]: header format and validation
//! - [`index`]: logical-to-physical slot mapping
//! - [`claim`]: the claim/acknowledge handshake
//! - [`record`]: slot decoding
//! - [`session`]: the façade tying them together
//! - [`sim`]: an in-process kernel model for tests and demos

pub mod claim;
pub mod config;
pub mod device;
pub mod error;
pub mod index;
pub mod layout;
pub mod record;
pub mod region;
pub mod session;
pub mod sim;

pub use claim::{Ack, AckError, ClaimError, ClaimProtocol, ClaimWindow, ControlChannel};
pub use config::{ConfigError, RingConfig};
pub use device::{DeviceMapping, RingDevice, page_size};
pub use error::SessionError;
pub use index::SlotIndexer;
pub use layout::{HeaderIdentity, LayoutError, RingHeader, RingLayout};
pub use record::{DecodeError, Record, TerminatorPolicy, decode_slot};
pub use region::{HeapRegion, Region};
pub use session::{Records, RingSession, SessionState};
pub use sim::{SimError, SimulatedRing};

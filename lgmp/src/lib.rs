//! LGMP: the Looking Glass Message Passing transport.
//!
//! A session- and queue-oriented shared-memory ring protocol: [`acquire`]
//! maps the region (or negotiates DMA-buf handles from a kvmfr character
//! device), [`session`] validates the header and tracks host liveness, and
//! [`queue`] carries zero-copy messages across the two fixed SPSC queues
//! (`FRAME`, `POINTER`). [`wire`] holds the bit-exact byte layouts the other
//! three modules parse and build.
//!
//! This crate spawns no threads and makes no logging-policy decisions; it is
//! meant to be embedded by a driver (see the `lg-client` crate in this
//! workspace) that owns the polling loop and error surfacing.

pub mod acquire;
pub mod queue;
pub mod session;
#[cfg(feature = "testutil")]
pub mod testutil;
pub mod wire;

pub use acquire::{AcquireError, ShmRegion};
pub use queue::{BorrowedMessage, Queue, QueueError, QueueKind};
pub use session::{SessionError, Transport};

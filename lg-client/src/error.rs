//! Top-level error type, composed from each subsystem's own `thiserror`
//! enum — the same per-domain-enum-plus-composition shape this workspace's
//! `shared::errors` module uses, just collapsed into one `#[from]`-wired
//! type instead of a re-exporting `mod.rs` since there is only one consumer
//! (the driver's public API).

use thiserror::Error;

use lgmp::{AcquireError, QueueError, SessionError};

use crate::cursor::CursorError;
use crate::frame::FrameError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    /// Allocation failure, unknown frame type, or a catastrophically failed
    /// DMA setup — the only kind that propagates to the top level and halts
    /// the driver rather than triggering a session restart.
    #[error("fatal: {0}")]
    Fatal(String),
}

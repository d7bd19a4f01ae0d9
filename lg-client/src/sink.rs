//! External collaborator interfaces (component F).
//!
//! These are the only contracts the core consumes from the outside: a
//! renderer, a display-server integration, and (implicitly, via
//! `CursorPipeline::set_cursor_pos`) an input source. The core never reaches
//! past these traits into GPU, windowing, or SPICE APIs itself.

use std::os::fd::BorrowedFd;

use lgmp::wire::{CursorType, DamageRect, FrameRotation, FrameType};

/// Capability a renderer is asked about once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cap {
    Dmabuf,
}

/// Format description delivered ahead of the frames it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub format_ver: u32,
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub pitch: u32,
    pub rotation: FrameRotation,
}

/// Pixel delivery: either a borrowed byte view (copy before `message_done`)
/// or a DMA-buf file descriptor the renderer may import directly.
pub enum FramePayload<'a> {
    Bytes(&'a [u8]),
    DmaBuf(BorrowedFd<'a>),
}

/// Consumes decoded frame data. Owned and driven by exactly one task (the
/// frame task) for its whole lifetime, including across session restarts.
pub trait FrameSink: Send {
    fn on_format(&mut self, format: FrameFormat);
    fn on_frame(&mut self, payload: FramePayload<'_>, damage_rects: &[DamageRect]);
    /// Invalidates any GPU state tied to the previous session.
    fn on_restart(&mut self);
    fn supports(&self, cap: Cap) -> bool;
}

/// Consumes decoded cursor state. Owned by the cursor task for its whole
/// lifetime, same as [`FrameSink`].
pub trait CursorSink: Send {
    fn on_cursor_shape(&mut self, cursor_type: CursorType, width: u32, height: u32, pitch: u32, bytes: &[u8]);
    fn on_cursor_state(&mut self, visible: bool, x: i16, y: i16, hx: i8, hy: i8);
}

/// Display-server integration. Called from both the frame task
/// (activation/idle-inhibit) and the cursor task (pointer sync), so the
/// implementor is responsible for its own internal synchronization; the
/// core only ever issues one call at a time per method, never overlapping
/// calls to the *same* method from two tasks.
pub trait DisplaySink: Send + Sync {
    fn request_activation(&self);
    fn inhibit_idle(&self, inhibit: bool);
    fn guest_pointer_updated(&self, guest_x: i16, guest_y: i16, local_x: i16, local_y: i16);
}

//! Cursor pipeline (component E): flag-decoded shape/position/visibility
//! updates and the `SetCursorPos` request/response round trip.
//!
//! The "send and poll a returned serial" pattern is implemented directly
//! against [`lgmp::Queue`] rather than through a callback, matching this
//! spec's preference for a request/response shape that fits a
//! single-threaded consumer task (§9 design notes).

use thiserror::Error;

use lgmp::wire::{CursorDescriptor, CursorFlags, CursorType, SetCursorPos, CURSOR_DESCRIPTOR_WIRE_SIZE, FEATURE_SET_CURSOR_POS};
use lgmp::{Queue, QueueError};

use crate::metrics as m;
use crate::sink::{CursorSink, DisplaySink};

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("malformed cursor descriptor (shape size or type invalid)")]
    Malformed,
    #[error("host does not advertise the SetCursorPos feature")]
    Unsupported,
    #[error("failed to send SetCursorPos: {0}")]
    SendFailed(#[source] QueueError),
}

pub struct CursorPipeline {
    shape: Vec<u8>,
    shape_len: usize,
    cursor_type: Option<CursorType>,
    dims: (u32, u32, u32),
    pos: Option<(i16, i16)>,
    hx: i8,
    hy: i8,
    visible: bool,
    local_pos: (i16, i16),
}

impl Default for CursorPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorPipeline {
    pub fn new() -> Self {
        Self {
            shape: Vec::new(),
            shape_len: 0,
            cursor_type: None,
            dims: (0, 0, 0),
            pos: None,
            hx: 0,
            hy: 0,
            visible: false,
            local_pos: (0, 0),
        }
    }

    /// Records the host-OS pointer position the display-server collaborator
    /// last reported, used to fill in `guest_pointer_updated`'s `local_x/y`
    /// on the first valid guest position. The core does not track this on
    /// its own; it has no visibility into the host's local pointer.
    pub fn note_local_pointer(&mut self, x: i16, y: i16) {
        self.local_pos = (x, y);
    }

    pub fn process(
        &mut self,
        payload: &[u8],
        tag: u32,
        sink: &mut dyn CursorSink,
        display: &dyn DisplaySink,
    ) -> Result<(), CursorError> {
        let desc = CursorDescriptor::decode(payload).ok_or(CursorError::Malformed)?;
        let flags = CursorFlags(tag);

        if flags.shape() {
            let required = desc.required_shape_len() as usize;
            let shape_bytes = payload.get(CURSOR_DESCRIPTOR_WIRE_SIZE..).unwrap_or(&[]);
            if shape_bytes.len() < required {
                // Malformed: shape size exceeds what's actually present.
                // Last valid cursor is retained, caller just logs this.
                return Err(CursorError::Malformed);
            }
            let cursor_type = CursorType::from_wire(desc.cursor_type_raw).ok_or(CursorError::Malformed)?;

            if self.shape.len() < required {
                self.shape.resize(required, 0);
            }
            self.shape[..required].copy_from_slice(&shape_bytes[..required]);
            self.shape_len = required;
            self.cursor_type = Some(cursor_type);
            self.dims = (desc.width, desc.height, desc.pitch);

            sink.on_cursor_shape(cursor_type, desc.width, desc.height, desc.pitch, &self.shape[..required]);
            metrics::counter!(m::CURSOR_SHAPE_UPDATES).increment(1);
        }

        if flags.position() {
            let became_valid = self.pos.is_none();
            self.pos = Some((desc.x, desc.y));
            self.hx = desc.hx;
            self.hy = desc.hy;
            metrics::counter!(m::CURSOR_POSITION_UPDATES).increment(1);
            if became_valid {
                let (lx, ly) = self.local_pos;
                display.guest_pointer_updated(desc.x, desc.y, lx, ly);
            }
        }

        // VISIBLE is carried as a sticky assertion, not a per-message delta:
        // the bit is set whenever the host currently wants the cursor shown,
        // and left unset on messages that don't speak to visibility at all
        // (e.g. a bare POSITION update mid-drag). So we only ever raise the
        // cached flag here, never lower it from its absence.
        let was_visible = self.visible;
        if flags.visible() {
            self.visible = true;
        }
        let reemit_only = !flags.shape() && !flags.position();

        if reemit_only {
            if self.visible != was_visible {
                if let (Some((x, y)), Some(cursor_type)) = (self.pos, self.cursor_type) {
                    sink.on_cursor_shape(
                        cursor_type,
                        self.dims.0,
                        self.dims.1,
                        self.dims.2,
                        &self.shape[..self.shape_len],
                    );
                    sink.on_cursor_state(self.visible, x, y, self.hx, self.hy);
                }
            }
        } else if let Some((x, y)) = self.pos {
            sink.on_cursor_state(self.visible, x, y, self.hx, self.hy);
        }

        Ok(())
    }
}

/// `set_cursor_pos(x, y)`: valid only when the host advertises
/// `SET_CURSOR_POS`. Returns the serial a caller should poll
/// [`lgmp::Queue::serial`] for, with a bounded wait — beyond the bound the
/// move is considered lost and the cached position resyncs on the next
/// message (the caller just stops waiting; no special handling is needed
/// here since the next `POSITION` update overwrites the stale guess).
pub fn set_cursor_pos(queue: &mut Queue<'_>, host_features: u32, x: i32, y: i32) -> Result<u32, CursorError> {
    if host_features & FEATURE_SET_CURSOR_POS == 0 {
        return Err(CursorError::Unsupported);
    }
    let msg = SetCursorPos { x, y };
    queue.send(&msg.encode()).map_err(CursorError::SendFailed)
}

//! Synthetic-host region builder, gated behind the `testutil` feature.
//!
//! Everything this crate's own host-side test fixtures assemble by hand
//! (see `queue::tests::build_region`) lives here as a reusable type so
//! `lg-client`'s integration tests can drive the full three-task driver
//! against an in-process region without a real hypervisor. This writes the
//! exact byte layout [`crate::session::Transport`] and [`crate::queue`]
//! expect; it is test support, not a second implementation of the wire
//! format, so it reaches into the crate's own layout constants rather than
//! re-deriving them.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::queue::{self, offsets};
use crate::session::SESSION_FIXED_SIZE;
use crate::wire::{self, HEADER_FIXED_SIZE, HOSTVER_LEN, MAGIC};

/// Total backing file size. Large enough to hold a handful of full-HD/1440p
/// BGRA or RGBA10 frame payloads back to back without the test harness
/// having to model slot reuse.
pub const REGION_SIZE: usize = 48 * 1024 * 1024;

const SESSION_OFF: usize = HEADER_FIXED_SIZE;
const QUEUE_TABLE_OFF: usize = SESSION_OFF + SESSION_FIXED_SIZE;
const Q_FRAME_OFF: usize = QUEUE_TABLE_OFF;
const Q_POINTER_OFF: usize = QUEUE_TABLE_OFF + queue::QUEUE_HEADER_WIRE_SIZE;
const FRAME_SLOT_TABLE_OFF: usize = Q_POINTER_OFF + queue::QUEUE_HEADER_WIRE_SIZE;
const FRAME_SLOT_TABLE_LEN: usize = wire::LGMP_Q_FRAME_LEN as usize * queue::SLOT_WIRE_SIZE;
const POINTER_SLOT_TABLE_OFF: usize = FRAME_SLOT_TABLE_OFF + FRAME_SLOT_TABLE_LEN;
const POINTER_SLOT_TABLE_LEN: usize = wire::LGMP_Q_POINTER_LEN as usize * queue::SLOT_WIRE_SIZE;
const FRAME_OUT_TABLE_OFF: usize = POINTER_SLOT_TABLE_OFF + POINTER_SLOT_TABLE_LEN;
const OUT_TABLE_LEN: usize = queue::OUT_NUM_SLOTS as usize * queue::OUT_SLOT_SIZE;
const POINTER_OUT_TABLE_OFF: usize = FRAME_OUT_TABLE_OFF + OUT_TABLE_LEN;
const PAYLOAD_AREA_OFF: usize = POINTER_OUT_TABLE_OFF + OUT_TABLE_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ring {
    Frame,
    Pointer,
}

/// A host-side writer for a synthetic LGMP region backed by a real file, so
/// [`crate::acquire::ShmRegion::open`] can map it exactly as it would a
/// `/dev/shm` region. All writes go through positioned file writes rather
/// than a second mmap; both observe the same page cache on Linux.
pub struct SyntheticHost {
    file: File,
    path: PathBuf,
    frame_write_index: u32,
    frame_serial: u32,
    pointer_write_index: u32,
    pointer_serial: u32,
    next_payload_off: usize,
}

impl SyntheticHost {
    /// Creates a zero-filled, [`REGION_SIZE`]-byte backing file at `path`.
    /// The region starts out looking like "no host running" (zeroed magic).
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(REGION_SIZE as u64)?;

        Ok(Self {
            file,
            path,
            frame_write_index: 0,
            frame_serial: 0,
            pointer_write_index: 0,
            pointer_serial: 0,
            next_payload_off: PAYLOAD_AREA_OFF,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) {
        while !buf.is_empty() {
            let n = self.file.write_at(buf, offset).expect("synthetic host write failed");
            buf = &buf[n..];
            offset += n as u64;
        }
    }

    fn w32(&self, offset: usize, value: u32) {
        self.write_all_at(&value.to_le_bytes(), offset as u64);
    }

    fn read_all_at(&self, buf: &mut [u8], mut offset: u64) {
        let mut read = 0;
        while read < buf.len() {
            let n = self.file.read_at(&mut buf[read..], offset).expect("synthetic host read failed");
            assert!(n > 0, "unexpected EOF reading synthetic host region");
            read += n;
            offset += n as u64;
        }
    }

    fn r32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.read_all_at(&mut buf, offset as u64);
        u32::from_le_bytes(buf)
    }

    fn r_i32(&self, offset: usize) -> i32 {
        let mut buf = [0u8; 4];
        self.read_all_at(&mut buf, offset as u64);
        i32::from_le_bytes(buf)
    }

    /// Writes the fixed header: magic, version, hostver, features. Does not
    /// touch the session fields; call [`Self::open_session`] to publish a
    /// live session on top of it.
    pub fn write_header(&self, version: u32, hostver: &str, features: u32) {
        self.write_all_at(MAGIC, 0);
        self.w32(8, version);

        let mut hv = [0u8; HOSTVER_LEN];
        let bytes = hostver.as_bytes();
        let n = bytes.len().min(HOSTVER_LEN - 1);
        hv[..n].copy_from_slice(&bytes[..n]);
        self.write_all_at(&hv, 12);

        self.w32(12 + HOSTVER_LEN, features);
    }

    /// Flips the magic to something else entirely, simulating a host
    /// speaking an unrelated protocol.
    pub fn corrupt_magic(&self) {
        self.write_all_at(b"XXXXXXXX", 0);
    }

    /// Publishes a live session: heartbeat, session id, empty udata, and
    /// both queue headers pointing at freshly zeroed slot/out tables.
    /// Resets this harness's own write cursors to match a freshly
    /// (re)started host.
    pub fn open_session(&mut self, session_id: u32, heartbeat: u32) {
        let s = SESSION_OFF;
        self.w32(s, heartbeat);
        self.w32(s + 4, session_id);
        self.w32(s + 8, 0); // udata_len
        self.w32(s + 12, QUEUE_TABLE_OFF as u32);

        self.write_queue_header(
            Q_FRAME_OFF,
            wire::LGMP_Q_FRAME,
            wire::LGMP_Q_FRAME_LEN,
            FRAME_SLOT_TABLE_OFF,
            FRAME_OUT_TABLE_OFF,
        );
        self.write_queue_header(
            Q_POINTER_OFF,
            wire::LGMP_Q_POINTER,
            wire::LGMP_Q_POINTER_LEN,
            POINTER_SLOT_TABLE_OFF,
            POINTER_OUT_TABLE_OFF,
        );

        self.frame_write_index = 0;
        self.frame_serial = 0;
        self.pointer_write_index = 0;
        self.pointer_serial = 0;
        self.next_payload_off = PAYLOAD_AREA_OFF;
    }

    fn write_queue_header(&self, base: usize, id: u32, num_slots: u32, slot_table_off: usize, out_table_off: usize) {
        self.w32(base + offsets::ID, id);
        self.w32(base + offsets::NUM_SLOTS, num_slots);
        self.w32(base + offsets::IN_WRITE_INDEX, 0);
        self.w32(base + offsets::IN_WRITE_SERIAL, 0);
        self.w32(base + offsets::IN_READ_INDEX, 0);
        self.w32(base + offsets::OUT_WRITE_INDEX, 0);
        self.w32(base + offsets::OUT_READ_INDEX, 0);
        self.w32(base + offsets::SLOT_TABLE_OFFSET, slot_table_off as u32);
        self.w32(base + offsets::OUT_TABLE_OFFSET, out_table_off as u32);
    }

    /// Advances the heartbeat counter the session watchdog polls.
    pub fn bump_heartbeat(&self, value: u32) {
        self.w32(SESSION_OFF, value);
    }

    /// Simulates a host crash: zeroes the magic and the session id, so both
    /// a live [`crate::session::Transport::session_valid`] poll and a fresh
    /// `Transport::try_init` observe "no session".
    pub fn kill(&self) {
        self.write_all_at(&[0u8; 8], 0);
        self.w32(SESSION_OFF + 4, 0);
    }

    fn publish(&mut self, ring: Ring, payload: &[u8], tag: u32) {
        let (q_base, slot_table_off, len) = match ring {
            Ring::Frame => (Q_FRAME_OFF, FRAME_SLOT_TABLE_OFF, wire::LGMP_Q_FRAME_LEN),
            Ring::Pointer => (Q_POINTER_OFF, POINTER_SLOT_TABLE_OFF, wire::LGMP_Q_POINTER_LEN),
        };
        let write_index = match ring {
            Ring::Frame => self.frame_write_index,
            Ring::Pointer => self.pointer_write_index,
        };
        let serial = match ring {
            Ring::Frame => self.frame_serial,
            Ring::Pointer => self.pointer_serial,
        };

        let payload_off = self.next_payload_off;
        self.next_payload_off += payload.len();
        assert!(self.next_payload_off <= REGION_SIZE, "synthetic host payload area exhausted");
        self.write_all_at(payload, payload_off as u64);

        let slot_pos = (write_index % len) as usize;
        let slot_off = slot_table_off + slot_pos * queue::SLOT_WIRE_SIZE;
        self.w32(slot_off, payload_off as u32);
        self.w32(slot_off + 4, payload.len() as u32);
        self.w32(slot_off + 8, tag);

        let new_write_index = write_index.wrapping_add(1);
        let new_serial = serial.wrapping_add(1);
        self.w32(q_base + offsets::IN_WRITE_INDEX, new_write_index);
        self.w32(q_base + offsets::IN_WRITE_SERIAL, new_serial);

        match ring {
            Ring::Frame => {
                self.frame_write_index = new_write_index;
                self.frame_serial = new_serial;
            }
            Ring::Pointer => {
                self.pointer_write_index = new_write_index;
                self.pointer_serial = new_serial;
            }
        }
    }

    /// Publishes one FRAME message. `payload` should already be a complete,
    /// bounds-correct `FrameDescriptor` plus pixel bytes.
    pub fn publish_frame(&mut self, payload: &[u8]) {
        self.publish(Ring::Frame, payload, 0);
    }

    /// Publishes one POINTER message with the given cursor flag bits.
    pub fn publish_cursor(&mut self, payload: &[u8], tag: u32) {
        self.publish(Ring::Pointer, payload, tag);
    }

    /// Reads back one slot of the pointer queue's outbound ring (the
    /// client->host direction), as `(message_type, x, y)`. Lets a test
    /// confirm a `SetCursorPos` the driver sent actually landed in the
    /// region without the harness having to play host on that ring too.
    pub fn read_pointer_out_slot(&self, index: u32) -> (u32, i32, i32) {
        let slot_off = POINTER_OUT_TABLE_OFF + (index as usize % queue::OUT_NUM_SLOTS as usize) * queue::OUT_SLOT_SIZE;
        (self.r32(slot_off), self.r_i32(slot_off + 4), self.r_i32(slot_off + 8))
    }
}

//! LGMP queue (component C): per-queue subscribe, process, acknowledge, and
//! the client->host send path used by `SetCursorPos`.
//!
//! The ring discipline mirrors this workspace's existing
//! `communications::memory_ring` module: a host-owned write index published
//! with `Release` and read with `Acquire`, a client-owned read index
//! published back the same way, both living at fixed offsets inside the
//! shared region rather than behind a language-level lock — this is memory
//! visible to a process in another address space, so atomics at known
//! offsets are the only synchronization primitive available. The queue
//! reuses that same producer/consumer shape a second time, in the opposite
//! direction, for the pointer queue's outbound `SetCursorPos` ring.

use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::session::Transport;
use crate::wire::{LGMP_Q_FRAME, LGMP_Q_FRAME_LEN, LGMP_Q_POINTER, LGMP_Q_POINTER_LEN};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue not yet published by host")]
    NoSuchQueue,
    #[error("queue empty")]
    Empty,
    #[error("session invalid (malformed ring state or serial went backward)")]
    InvalidSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Frame,
    Pointer,
}

impl QueueKind {
    fn id(self) -> u32 {
        match self {
            QueueKind::Frame => LGMP_Q_FRAME,
            QueueKind::Pointer => LGMP_Q_POINTER,
        }
    }

    fn len(self) -> u32 {
        match self {
            QueueKind::Frame => LGMP_Q_FRAME_LEN,
            QueueKind::Pointer => LGMP_Q_POINTER_LEN,
        }
    }
}

/// Number of reserved slots in the fixed queue table; one per [`QueueKind`].
const MAX_QUEUES: usize = 2;

/// Inbound (host -> client) slot descriptor: `{offset, size, tag}`.
pub(crate) const SLOT_WIRE_SIZE: usize = 4 + 4 + 4;

/// Fixed-size outbound ring slot, sized for the only client->host message
/// this protocol carries (`SetCursorPos`, 12 bytes) with room to spare.
pub(crate) const OUT_SLOT_SIZE: usize = 16;
pub(crate) const OUT_NUM_SLOTS: u32 = 8;

/// Per-queue header fields, laid out at `queue_table_offset + index *
/// QUEUE_HEADER_WIRE_SIZE`.
pub(crate) mod offsets {
    pub const ID: usize = 0;
    pub const NUM_SLOTS: usize = 4;
    pub const IN_WRITE_INDEX: usize = 8;
    pub const IN_WRITE_SERIAL: usize = 12;
    pub const IN_READ_INDEX: usize = 16;
    pub const OUT_WRITE_INDEX: usize = 20;
    pub const OUT_READ_INDEX: usize = 24;
    pub const SLOT_TABLE_OFFSET: usize = 28;
    pub const OUT_TABLE_OFFSET: usize = 32;
    pub const SIZE: usize = 36;
}

pub(crate) const QUEUE_HEADER_WIRE_SIZE: usize = offsets::SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Unsubscribed,
    Active,
    Borrowed,
    Dropped,
}

/// A subscribed queue handle, borrowing the transport's region for as long
/// as it lives. Exactly one subscriber per queue is expected; nothing
/// enforces that at the type level beyond the caller holding a single
/// `&mut Queue` at a time.
pub struct Queue<'a> {
    transport: &'a Transport,
    kind: QueueKind,
    header_offset: usize,
    state: QueueState,
    last_serial: u32,
}

/// A message borrowed from the ring between a successful [`Queue::process`]
/// and the matching [`Queue::message_done`]. The payload lifetime is tied to
/// the transport's region, not to the `&mut Queue` borrow that produced it,
/// so callers can hand it to a renderer without pinning the queue mutably.
pub struct BorrowedMessage<'a> {
    pub payload: &'a [u8],
    pub tag: u32,
    slot_index: u32,
}

impl Transport {
    /// Scan the fixed queue table for `kind`, returning [`QueueError::NoSuchQueue`]
    /// while the host has not yet published it. Callers retry with a short
    /// delay per §4.C.
    pub fn subscribe(&self, kind: QueueKind) -> Result<Queue<'_>, QueueError> {
        let table_base = self.queue_table_offset();
        let region_size = self.region().size();

        for i in 0..MAX_QUEUES {
            let header_offset = table_base + i * QUEUE_HEADER_WIRE_SIZE;
            if header_offset + QUEUE_HEADER_WIRE_SIZE > region_size {
                continue;
            }
            let bytes = self.region().as_bytes();
            let id = LittleEndian::read_u32(
                &bytes[header_offset + offsets::ID..header_offset + offsets::ID + 4],
            );
            if id != kind.id() {
                continue;
            }
            let num_slots = LittleEndian::read_u32(
                &bytes[header_offset + offsets::NUM_SLOTS..header_offset + offsets::NUM_SLOTS + 4],
            );
            if num_slots != kind.len() {
                return Err(QueueError::InvalidSession);
            }

            let last_serial = LittleEndian::read_u32(
                &bytes[header_offset + offsets::IN_WRITE_SERIAL
                    ..header_offset + offsets::IN_WRITE_SERIAL + 4],
            );

            return Ok(Queue {
                transport: self,
                kind,
                header_offset,
                state: QueueState::Active,
                last_serial,
            });
        }

        Err(QueueError::NoSuchQueue)
    }
}

impl<'a> Queue<'a> {
    fn region_bytes(&self) -> &'a [u8] {
        self.transport.region().as_bytes()
    }

    fn field_ptr(&self, field_offset: usize) -> *mut u32 {
        // SAFETY: all `offsets::*` constants are 4-byte aligned by
        // construction and `header_offset` was bounds-checked at subscribe
        // time against the region length.
        unsafe {
            self.region_bytes()
                .as_ptr()
                .add(self.header_offset + field_offset) as *mut u32
        }
    }

    fn atomic(&self, field_offset: usize) -> &'a AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.field_ptr(field_offset)) }
    }

    fn in_write_index(&self) -> &'a AtomicU32 {
        self.atomic(offsets::IN_WRITE_INDEX)
    }
    fn in_write_serial(&self) -> &'a AtomicU32 {
        self.atomic(offsets::IN_WRITE_SERIAL)
    }
    fn in_read_index(&self) -> &'a AtomicU32 {
        self.atomic(offsets::IN_READ_INDEX)
    }
    fn out_write_index(&self) -> &'a AtomicU32 {
        self.atomic(offsets::OUT_WRITE_INDEX)
    }

    fn slot_table_offset(&self) -> usize {
        let bytes = self.region_bytes();
        let o = self.header_offset + offsets::SLOT_TABLE_OFFSET;
        LittleEndian::read_u32(&bytes[o..o + 4]) as usize
    }

    fn out_table_offset(&self) -> usize {
        let bytes = self.region_bytes();
        let o = self.header_offset + offsets::OUT_TABLE_OFFSET;
        LittleEndian::read_u32(&bytes[o..o + 4]) as usize
    }

    /// The highest serial the host has advertised on this queue: progress of
    /// host-originated messages, and — by convention documented alongside
    /// [`Queue::send`] — the rendezvous counter a client send waits on.
    pub fn serial(&self) -> u32 {
        self.in_write_serial().load(Ordering::Acquire)
    }

    /// Non-blocking poll for the next message. Returns `Ok(None)` on an
    /// empty queue, transitions `Active -> Borrowed` on a delivered message,
    /// and `Active|Borrowed -> Dropped` plus `Err(InvalidSession)` on any
    /// bounds or serial violation.
    pub fn process(&mut self) -> Result<Option<BorrowedMessage<'a>>, QueueError> {
        if self.state == QueueState::Dropped {
            return Err(QueueError::InvalidSession);
        }

        let write_index = self.in_write_index().load(Ordering::Acquire);
        let read_index = self.in_read_index().load(Ordering::Acquire);

        if write_index == read_index {
            return Ok(None);
        }

        let serial = self.in_write_serial().load(Ordering::Acquire);
        if serial < self.last_serial {
            self.state = QueueState::Dropped;
            return Err(QueueError::InvalidSession);
        }
        self.last_serial = serial;

        let slot_pos = (read_index % self.kind.len()) as usize;
        let table_offset = self.slot_table_offset();
        let slot_offset = table_offset + slot_pos * SLOT_WIRE_SIZE;

        let region_size = self.transport.region().size();
        if slot_offset + SLOT_WIRE_SIZE > region_size {
            self.state = QueueState::Dropped;
            return Err(QueueError::InvalidSession);
        }

        let bytes = self.region_bytes();
        let payload_offset = LittleEndian::read_u32(&bytes[slot_offset..slot_offset + 4]) as u64;
        let payload_size = LittleEndian::read_u32(&bytes[slot_offset + 4..slot_offset + 8]) as u64;
        let tag = LittleEndian::read_u32(&bytes[slot_offset + 8..slot_offset + 12]);

        let end = match payload_offset.checked_add(payload_size) {
            Some(end) if end <= region_size as u64 => end as usize,
            _ => {
                self.state = QueueState::Dropped;
                return Err(QueueError::InvalidSession);
            }
        };

        let payload = &bytes[payload_offset as usize..end];
        self.state = QueueState::Borrowed;

        Ok(Some(BorrowedMessage {
            payload,
            tag,
            slot_index: read_index,
        }))
    }

    /// Release the borrowed slot back to the host. The host may reuse it
    /// only after this publishes with `Release`.
    pub fn message_done(&mut self, msg: BorrowedMessage<'a>) {
        debug_assert_eq!(self.state, QueueState::Borrowed);
        self.in_read_index()
            .store(msg.slot_index.wrapping_add(1), Ordering::Release);
        self.state = QueueState::Active;
    }

    /// Client -> host send, used only by `SetCursorPos` on the pointer
    /// queue. Returns the serial a caller should poll [`Queue::serial`] for
    /// to treat the message as applied; the host is not required to set
    /// that exact value, only to reach or pass it once the message has been
    /// drained, so this is a lower bound rather than an exact echo.
    pub fn send(&mut self, bytes_in: &[u8]) -> Result<u32, QueueError> {
        if self.state == QueueState::Dropped {
            return Err(QueueError::InvalidSession);
        }
        if bytes_in.len() > OUT_SLOT_SIZE {
            return Err(QueueError::InvalidSession);
        }

        let out_index = self.out_write_index().load(Ordering::Acquire);
        let slot_pos = (out_index % OUT_NUM_SLOTS) as usize;
        let out_table = self.out_table_offset();
        let slot_offset = out_table + slot_pos * OUT_SLOT_SIZE;

        let region_size = self.transport.region().size();
        if slot_offset + OUT_SLOT_SIZE > region_size {
            self.state = QueueState::Dropped;
            return Err(QueueError::InvalidSession);
        }

        // SAFETY: bounds-checked above; the outbound ring is exclusively
        // written by the client, so no concurrent writer aliases this range.
        unsafe {
            let dst = self.region_bytes().as_ptr().add(slot_offset) as *mut u8;
            std::ptr::copy_nonoverlapping(bytes_in.as_ptr(), dst, bytes_in.len());
            if bytes_in.len() < OUT_SLOT_SIZE {
                std::ptr::write_bytes(dst.add(bytes_in.len()), 0, OUT_SLOT_SIZE - bytes_in.len());
            }
        }

        self.out_write_index()
            .store(out_index.wrapping_add(1), Ordering::Release);

        let target = self.serial().wrapping_add(1);
        Ok(target)
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::ShmRegion;
    use crate::session::Transport;
    use crate::wire::{HEADER_FIXED_SIZE, HOSTVER_LEN, MAGIC, VERSION};
    use std::io::Write;

    const SESSION_FIXED_SIZE: usize = 16;

    /// Lays out a complete synthetic region: fixed header, session fixed
    /// fields, an empty udata area, a queue table with one FRAME queue, its
    /// inbound slot table (2 slots), and its outbound ring — enough for
    /// `subscribe`/`process`/`send` to exercise the full offset chain.
    fn build_region() -> (Vec<u8>, usize, usize) {
        let mut buf = vec![0u8; 8192];
        buf[0..8].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut buf[8..12], VERSION);
        let _ = HOSTVER_LEN;

        let session_off = HEADER_FIXED_SIZE;
        let queue_table_off = session_off + SESSION_FIXED_SIZE;

        LittleEndian::write_u32(&mut buf[session_off..session_off + 4], 1); // heartbeat
        LittleEndian::write_u32(&mut buf[session_off + 4..session_off + 8], 1); // session_id
        LittleEndian::write_u32(&mut buf[session_off + 8..session_off + 12], 0); // udata_len
        LittleEndian::write_u32(
            &mut buf[session_off + 12..session_off + 16],
            queue_table_off as u32,
        );

        let q0 = queue_table_off;
        let slot_table_off = q0 + QUEUE_HEADER_WIRE_SIZE * MAX_QUEUES;
        let out_table_off = slot_table_off + SLOT_WIRE_SIZE * LGMP_Q_FRAME_LEN as usize;
        let payload_off = out_table_off + OUT_SLOT_SIZE * OUT_NUM_SLOTS as usize;

        LittleEndian::write_u32(&mut buf[q0 + offsets::ID..q0 + offsets::ID + 4], LGMP_Q_FRAME);
        LittleEndian::write_u32(
            &mut buf[q0 + offsets::NUM_SLOTS..q0 + offsets::NUM_SLOTS + 4],
            LGMP_Q_FRAME_LEN,
        );
        LittleEndian::write_u32(
            &mut buf[q0 + offsets::SLOT_TABLE_OFFSET..q0 + offsets::SLOT_TABLE_OFFSET + 4],
            slot_table_off as u32,
        );
        LittleEndian::write_u32(
            &mut buf[q0 + offsets::OUT_TABLE_OFFSET..q0 + offsets::OUT_TABLE_OFFSET + 4],
            out_table_off as u32,
        );

        (buf, q0, payload_off)
    }

    fn publish_message(buf: &mut [u8], q0: usize, payload_off: usize, payload: &[u8], tag: u32) {
        let slot_table_off = LittleEndian::read_u32(
            &buf[q0 + offsets::SLOT_TABLE_OFFSET..q0 + offsets::SLOT_TABLE_OFFSET + 4],
        ) as usize;
        buf[payload_off..payload_off + payload.len()].copy_from_slice(payload);

        LittleEndian::write_u32(&mut buf[slot_table_off..slot_table_off + 4], payload_off as u32);
        LittleEndian::write_u32(
            &mut buf[slot_table_off + 4..slot_table_off + 8],
            payload.len() as u32,
        );
        LittleEndian::write_u32(&mut buf[slot_table_off + 8..slot_table_off + 12], tag);

        LittleEndian::write_u32(&mut buf[q0 + offsets::IN_WRITE_INDEX..q0 + offsets::IN_WRITE_INDEX + 4], 1);
        LittleEndian::write_u32(
            &mut buf[q0 + offsets::IN_WRITE_SERIAL..q0 + offsets::IN_WRITE_SERIAL + 4],
            1,
        );
    }

    fn open(buf: &[u8]) -> ShmRegion {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(buf).unwrap();
        f.flush().unwrap();
        ShmRegion::open(f.path()).unwrap()
    }

    #[test]
    fn subscribe_unpublished_queue_fails() {
        let (buf, _, _) = build_region();
        let region = open(&buf);
        let transport = Transport::try_init(region).unwrap();
        let err = transport.subscribe(QueueKind::Pointer).unwrap_err();
        assert!(matches!(err, QueueError::NoSuchQueue));
    }

    #[test]
    fn process_empty_queue_returns_none() {
        let (buf, _, _) = build_region();
        let region = open(&buf);
        let transport = Transport::try_init(region).unwrap();
        let mut queue = transport.subscribe(QueueKind::Frame).unwrap();
        assert!(queue.process().unwrap().is_none());
    }

    #[test]
    fn process_then_message_done_advances_read_index() {
        let (mut buf, q0, payload_off) = build_region();
        publish_message(&mut buf, q0, payload_off, &[1, 2, 3, 4], 0xAB);
        let region = open(&buf);
        let transport = Transport::try_init(region).unwrap();
        let mut queue = transport.subscribe(QueueKind::Frame).unwrap();

        let msg = queue.process().unwrap().expect("has a message");
        assert_eq!(msg.payload, &[1, 2, 3, 4]);
        assert_eq!(msg.tag, 0xAB);
        queue.message_done(msg);

        assert!(queue.process().unwrap().is_none());
    }

    #[test]
    fn out_of_range_slot_is_invalid_session() {
        let (mut buf, q0, _payload_off) = build_region();
        let slot_table_off = LittleEndian::read_u32(
            &buf[q0 + offsets::SLOT_TABLE_OFFSET..q0 + offsets::SLOT_TABLE_OFFSET + 4],
        ) as usize;
        // Declare a payload hanging off the end of the region entirely.
        LittleEndian::write_u32(&mut buf[slot_table_off..slot_table_off + 4], 1_000_000);
        LittleEndian::write_u32(&mut buf[slot_table_off + 4..slot_table_off + 8], 16);
        LittleEndian::write_u32(&mut buf[q0 + offsets::IN_WRITE_INDEX..q0 + offsets::IN_WRITE_INDEX + 4], 1);
        LittleEndian::write_u32(
            &mut buf[q0 + offsets::IN_WRITE_SERIAL..q0 + offsets::IN_WRITE_SERIAL + 4],
            1,
        );

        let region = open(&buf);
        let transport = Transport::try_init(region).unwrap();
        let mut queue = transport.subscribe(QueueKind::Frame).unwrap();
        let err = queue.process().unwrap_err();
        assert!(matches!(err, QueueError::InvalidSession));
    }

    #[test]
    fn send_writes_outbound_slot_and_returns_serial() {
        let (buf, q0, _) = build_region();
        let _ = q0;
        let region = open(&buf);
        let transport = Transport::try_init(region).unwrap();
        let mut queue = transport.subscribe(QueueKind::Frame).unwrap();
        let serial = queue.send(&[9, 9, 9, 9]).unwrap();
        // send() doesn't move the host's serial itself; it hands back the
        // value a caller should wait for once the host drains the message.
        assert_eq!(serial, queue.serial() + 1);
    }
}

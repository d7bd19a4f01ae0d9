//! LGMP header & session (component B).
//!
//! Owns the mapped region, the parsed fixed header, and the liveness check
//! against the host's heartbeat. Per the workspace's existing split between
//! a stateless wire-format module and a stateful session/ring layer built on
//! top of it, this module holds no threads and makes no logging-policy
//! decisions — it only classifies state for its caller to act on.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::acquire::ShmRegion;
use crate::wire::{self, HeaderFixed, Record, HEADER_FIXED_SIZE, MAGIC, VERSION};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("header magic does not match (host not running this protocol)")]
    NoSuchMagic,
    #[error("header version mismatch: host speaks {host}, we speak {ours}")]
    InvalidVersion { host: u32, ours: u32 },
    #[error("no session published yet")]
    NoSession,
}

/// Fixed fields immediately following [`HeaderFixed`]: heartbeat, session id,
/// and a pointer to the TLV/queue-table areas. Not part of `wire` proper
/// since it is this component's own state, not a shared wire primitive.
pub(crate) const SESSION_FIXED_SIZE: usize = 4 + 4 + 4 + 4;

struct SessionFixed {
    heartbeat: u32,
    session_id: u32,
    udata_len: u32,
    queue_table_offset: u32,
}

impl SessionFixed {
    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SESSION_FIXED_SIZE {
            return None;
        }
        Some(Self {
            heartbeat: LittleEndian::read_u32(&buf[0..4]),
            session_id: LittleEndian::read_u32(&buf[4..8]),
            udata_len: LittleEndian::read_u32(&buf[8..12]),
            queue_table_offset: LittleEndian::read_u32(&buf[12..16]),
        })
    }
}

/// Grace window after first observing a live header before we'll call a
/// stalled heartbeat a dead session — the host may not have ticked yet.
const STARTUP_GRACE: Duration = Duration::from_millis(200);

/// How long the heartbeat may sit unchanged before we declare the session
/// dead. The spec leaves this unspecified beyond "bounded window, sampled at
/// least every 100ms"; we pick 10 missed watchdog polls worth of slack.
const HEARTBEAT_STALL_TIMEOUT: Duration = Duration::from_millis(1_000);

struct HeartbeatTracker {
    last_value: u32,
    last_change: Instant,
    started_at: Instant,
}

/// A validated LGMP session: mapped region plus the fixed header and
/// TLV records observed at init time. Owned by the top-level driver and
/// handed to tasks by shared reference; queues are carved out of it.
pub struct Transport {
    region: ShmRegion,
    header: HeaderFixed,
    records: Vec<Record>,
    session_id: u32,
    queue_table_offset: usize,
    heartbeat: Mutex<HeartbeatTracker>,
}

impl Transport {
    /// Single non-blocking attempt to validate the region and observe a live
    /// session. Callers poll this on `NoSession`/`InvalidVersion`/
    /// `NoSuchMagic` per §4.B; this function itself never sleeps.
    pub fn try_init(region: ShmRegion) -> Result<Self, SessionError> {
        let bytes = region.as_bytes();

        if bytes.len() < HEADER_FIXED_SIZE + SESSION_FIXED_SIZE {
            return Err(SessionError::NoSession);
        }

        if bytes[0..8].iter().all(|&b| b == 0) {
            return Err(SessionError::NoSession);
        }

        let header = HeaderFixed::decode(bytes).ok_or(SessionError::NoSession)?;
        if &header.magic != MAGIC {
            return Err(SessionError::NoSuchMagic);
        }
        if header.version != VERSION {
            return Err(SessionError::InvalidVersion {
                host: header.version,
                ours: VERSION,
            });
        }

        let session_fixed = SessionFixed::decode(&bytes[HEADER_FIXED_SIZE..])
            .ok_or(SessionError::NoSession)?;

        if session_fixed.session_id == 0 {
            // Host has written a valid header but has not opened a session yet.
            return Err(SessionError::NoSession);
        }

        let udata_start = HEADER_FIXED_SIZE + SESSION_FIXED_SIZE;
        let udata_end = udata_start.saturating_add(session_fixed.udata_len as usize);
        let records = if udata_end <= bytes.len() {
            wire::decode_records(&bytes[udata_start..udata_end])
        } else {
            // A declared udata length running past the region is a malformed
            // header, not grounds to reject the whole session: we simply
            // have no records to offer.
            Vec::new()
        };

        let now = Instant::now();
        let heartbeat = Mutex::new(HeartbeatTracker {
            last_value: session_fixed.heartbeat,
            last_change: now,
            started_at: now,
        });

        Ok(Self {
            region,
            header,
            records,
            session_id: session_fixed.session_id,
            queue_table_offset: session_fixed.queue_table_offset as usize,
            heartbeat,
        })
    }

    pub fn hostver(&self) -> &std::ffi::CStr {
        &self.header.hostver
    }

    pub fn features(&self) -> u32 {
        self.header.features
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    pub(crate) fn queue_table_offset(&self) -> usize {
        self.queue_table_offset
    }

    /// Liveness poll, intended to be sampled at least every 100ms by the
    /// top-level driver's session watchdog. Returns `false` on a stalled
    /// heartbeat or on observing a new `session_id` (host restarted under
    /// us) — in both cases the caller should tear down and re-run
    /// [`Transport::try_init`] on a fresh region snapshot.
    pub fn session_valid(&self) -> bool {
        let bytes = self.region.as_bytes();
        if bytes.len() < HEADER_FIXED_SIZE + SESSION_FIXED_SIZE {
            return false;
        }

        let live = unsafe {
            let ptr = bytes.as_ptr().add(HEADER_FIXED_SIZE + 4) as *mut u32;
            AtomicU32::from_ptr(ptr)
        };
        let live_session_id = live.load(Ordering::Acquire);
        if live_session_id != self.session_id {
            return false;
        }

        let beat = unsafe {
            let ptr = bytes.as_ptr().add(HEADER_FIXED_SIZE) as *mut u32;
            AtomicU32::from_ptr(ptr)
        };
        let current = beat.load(Ordering::Acquire);

        let mut tracker = self.heartbeat.lock().unwrap();
        let now = Instant::now();

        if current != tracker.last_value {
            tracker.last_value = current;
            tracker.last_change = now;
            return true;
        }

        if now.duration_since(tracker.started_at) < STARTUP_GRACE {
            return true;
        }

        now.duration_since(tracker.last_change) < HEARTBEAT_STALL_TIMEOUT
    }
}

//! Top-level driver: the frame task, the cursor task, and the session
//! watchdog, run as three scoped threads inside a fresh `thread::scope` per
//! session so they can safely borrow the session's `Transport` without it
//! needing to be `'static`. This mirrors `user-agent::main`'s
//! `spawn_ring_listener` / `spawn_db_listener` shape, generalized to the
//! scoped-borrow pattern this crate's queues require (see DESIGN.md's note
//! on the ownership tradeoff).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};

use lgmp::wire::Record;
use lgmp::{AcquireError, Queue, QueueError, QueueKind, SessionError, ShmRegion, Transport};

use crate::config::PollingConfig;
use crate::cursor::{self, CursorError, CursorPipeline};
use crate::error::CoreError;
use crate::frame::FramePipeline;
use crate::metrics as m;
use crate::sink::{CursorSink, DisplaySink, FrameSink};
use crate::state::{SessionPhase, SharedState};

/// A pending `set_cursor_pos` request bridged from the caller's thread into
/// the cursor task, which is the only thread allowed to touch the pointer
/// queue's outbound ring.
struct CursorPosRequest {
    x: i32,
    y: i32,
    reply: Sender<Result<u32, CursorError>>,
}

/// Handles shared between the driver loop and its caller: a shutdown flag
/// the caller flips to stop the driver, a channel the caller's
/// `request_set_cursor_pos` calls route through to whichever cursor task is
/// currently alive (there is a new one per session), and the host's last
/// known local pointer position, fed in by an input collaborator via
/// `report_local_pointer` and read by the cursor task on every iteration.
pub struct DriverHandles {
    shutdown: Arc<AtomicBool>,
    cursor_requests: Arc<Mutex<Option<Sender<CursorPosRequest>>>>,
    local_pointer: Arc<Mutex<(i16, i16)>>,
    state: SharedState,
}

impl DriverHandles {
    pub fn new(state: SharedState) -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            cursor_requests: Arc::new(Mutex::new(None)),
            local_pointer: Arc::new(Mutex::new((0, 0))),
            state,
        }
    }

    /// Signals every task to stop at its next poll. Does not block; callers
    /// that need to wait for full teardown should join the thread `run` was
    /// called from.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Sends a cursor-warp request to the live cursor task and waits (up to
    /// `timeout`) for the serial it will be assigned. Returns
    /// [`CoreError::Fatal`] if no session is currently running.
    pub fn request_set_cursor_pos(&self, x: i32, y: i32, timeout: Duration) -> Result<u32, CoreError> {
        let tx = {
            let guard = self.cursor_requests.lock().unwrap();
            guard.clone().ok_or_else(|| CoreError::Fatal("no active session".into()))?
        };
        let (reply_tx, reply_rx) = channel::bounded(1);
        tx.send(CursorPosRequest { x, y, reply: reply_tx })
            .map_err(|_| CoreError::Fatal("cursor task is not accepting requests".into()))?;
        match reply_rx.recv_timeout(timeout) {
            Ok(Ok(serial)) => Ok(serial),
            Ok(Err(e)) => Err(CoreError::Cursor(e)),
            Err(_) => Err(CoreError::Fatal("set_cursor_pos timed out waiting for cursor task".into())),
        }
    }

    /// Records where the host's own pointer currently sits, as last reported
    /// by an input collaborator (e.g. the display-server integration). The
    /// cursor task reads this on every iteration and hands it to
    /// [`crate::cursor::CursorPipeline::note_local_pointer`] so the first
    /// valid guest position can report `local_x/local_y` alongside it.
    pub fn report_local_pointer(&self, x: i16, y: i16) {
        *self.local_pointer.lock().unwrap() = (x, y);
    }
}

/// Runs the driver until `handles.request_shutdown()` is called or a
/// [`CoreError::Fatal`] condition is hit. Blocks the calling thread; a
/// caller wanting the process to stay resident should call this from a
/// dedicated thread or the process's main thread, matching
/// `user-agent::main`'s `thread::park()` tail.
pub fn run(
    shm_path: &Path,
    polling: &PollingConfig,
    handles: &DriverHandles,
    frame_sink: &mut dyn FrameSink,
    cursor_sink: &mut dyn CursorSink,
    display: &dyn DisplaySink,
) -> Result<(), CoreError> {
    let mut first_session = true;

    loop {
        if handles.shutdown.load(Ordering::Acquire) {
            set_phase(&handles.state, SessionPhase::ShuttingDown);
            return Ok(());
        }

        let Some(transport) = acquire_and_init_retry(shm_path, polling, &handles.shutdown)? else {
            return Ok(());
        };

        publish_session_identity(&handles.state, &transport);

        if !first_session {
            frame_sink.on_restart();
            metrics::counter!(m::SESSION_RESTARTS).increment(1);
            log::info!("session restarted, resuming delivery");
        }
        first_session = false;

        let Some(frame_queue) = subscribe_retry(&transport, QueueKind::Frame, &handles.shutdown)? else {
            return Ok(());
        };
        let Some(cursor_queue) = subscribe_retry(&transport, QueueKind::Pointer, &handles.shutdown)? else {
            return Ok(());
        };

        handles.state.lock().unwrap().format_valid = false;
        set_phase(&handles.state, SessionPhase::Running);

        let restart = AtomicBool::new(false);
        let (req_tx, req_rx) = channel::unbounded();
        *handles.cursor_requests.lock().unwrap() = Some(req_tx);

        let host_features = transport.features();
        let mut fatal: Option<CoreError> = None;

        // Reborrow the sinks each session: a scoped thread's closure moves
        // whatever it captures, and `frame_sink`/`cursor_sink` must still be
        // usable by the next iteration of this loop after the scope below
        // ends.
        let frame_sink_session: &mut dyn FrameSink = &mut *frame_sink;
        let cursor_sink_session: &mut dyn CursorSink = &mut *cursor_sink;

        thread::scope(|scope| {
            let frame_result = scope.spawn(|| {
                frame_task(
                    &transport,
                    frame_queue,
                    frame_sink_session,
                    display,
                    &handles.state,
                    &handles.shutdown,
                    &restart,
                    polling.queue_empty_sleep_ms,
                )
            });
            let cursor_result = scope.spawn(|| {
                cursor_task(
                    cursor_queue,
                    cursor_sink_session,
                    display,
                    req_rx,
                    host_features,
                    &handles.shutdown,
                    &restart,
                    polling.queue_empty_sleep_ms,
                    &handles.local_pointer,
                )
            });
            let watchdog_handle = scope.spawn(|| {
                watchdog_task(&transport, &handles.shutdown, &restart, polling.heartbeat_check_ms)
            });

            if let Ok(Err(e)) = frame_result.join() {
                fatal.get_or_insert(e);
            }
            if let Ok(Err(e)) = cursor_result.join() {
                fatal.get_or_insert(e);
            }
            let _ = watchdog_handle.join();
        });

        *handles.cursor_requests.lock().unwrap() = None;

        if let Some(e) = fatal {
            return Err(e);
        }
        if handles.shutdown.load(Ordering::Acquire) {
            set_phase(&handles.state, SessionPhase::ShuttingDown);
            return Ok(());
        }
        set_phase(&handles.state, SessionPhase::Restarting);
    }
}

fn set_phase(state: &SharedState, phase: SessionPhase) {
    state.lock().unwrap().phase = phase;
}

fn publish_session_identity(state: &SharedState, transport: &Transport) {
    let mut guard = state.lock().unwrap();
    guard.features = transport.features();
    guard.host_version = transport.hostver().to_str().ok().map(str::to_owned);
    for record in transport.records() {
        match record {
            Record::OsInfo(info) => {
                guard.guest.os_name = info.name.to_str().ok().map(str::to_owned);
            }
            Record::VmInfo(info) => {
                guard.guest.uuid = Some(info.uuid);
                guard.guest.capture_backend = std::str::from_utf8(&info.capture)
                    .ok()
                    .map(|s| s.trim_end_matches('\0').to_owned());
            }
            Record::Unknown { .. } => {}
        }
    }
}

/// Opens the shared-memory region and validates its header, retrying on
/// `NotFound` (the backend hasn't been created yet) and on `NoSession` /
/// `NoSuchMagic` / `InvalidVersion` (the host hasn't published a live
/// session, or speaks a protocol we don't) with `polling.session_retry_ms`
/// between attempts. `Transport::try_init` consumes the region it's given
/// even on failure, so a failed attempt re-opens it from scratch — wasteful
/// but simple, and this path is only hot while waiting for a host to start.
/// `ProtocolMismatch` (bad magic/version) is logged distinctly from
/// `NoSession` per §4.B so a UI layer can tell "upgrade host" from "host not
/// running" apart, but both keep polling rather than erroring out. Returns
/// `Ok(None)` if shutdown was requested mid-poll.
fn acquire_and_init_retry(
    path: &Path,
    polling: &PollingConfig,
    shutdown: &AtomicBool,
) -> Result<Option<Transport>, CoreError> {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(None);
        }

        let region = match ShmRegion::open(path) {
            Ok(region) => region,
            Err(AcquireError::NotFound(_)) => {
                sleep_checking_shutdown(Duration::from_millis(polling.session_retry_ms), shutdown);
                continue;
            }
            Err(e @ AcquireError::PermissionDenied(_)) => return Err(CoreError::Fatal(e.to_string())),
            Err(e) => return Err(CoreError::Acquire(e)),
        };

        match Transport::try_init(region) {
            Ok(transport) => return Ok(Some(transport)),
            Err(SessionError::NoSession) => {}
            Err(e @ SessionError::NoSuchMagic) | Err(e @ SessionError::InvalidVersion { .. }) => {
                log::warn!("{e}");
            }
        }

        sleep_checking_shutdown(Duration::from_millis(polling.session_retry_ms), shutdown);
    }
}

fn subscribe_retry<'a>(
    transport: &'a Transport,
    kind: QueueKind,
    shutdown: &AtomicBool,
) -> Result<Option<Queue<'a>>, CoreError> {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(None);
        }
        match transport.subscribe(kind) {
            Ok(queue) => return Ok(Some(queue)),
            Err(QueueError::NoSuchQueue) => {
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(CoreError::Queue(e)),
        }
    }
}

fn sleep_checking_shutdown(total: Duration, shutdown: &AtomicBool) {
    const STEP: Duration = Duration::from_millis(20);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let step = remaining.min(STEP);
        thread::sleep(step);
        remaining -= step;
    }
}

#[allow(clippy::too_many_arguments)]
fn frame_task(
    transport: &Transport,
    mut queue: Queue<'_>,
    sink: &mut dyn FrameSink,
    display: &dyn DisplaySink,
    state: &SharedState,
    shutdown: &AtomicBool,
    restart: &AtomicBool,
    empty_sleep_ms: u64,
) -> Result<(), CoreError> {
    let mut pipeline = FramePipeline::new();
    let region = transport.region();

    loop {
        if shutdown.load(Ordering::Acquire) || restart.load(Ordering::Acquire) {
            return Ok(());
        }

        match queue.process() {
            Ok(Some(msg)) => {
                let slot_offset = msg.payload.as_ptr() as u64 - region.as_bytes().as_ptr() as u64;
                let result = pipeline.process(region, msg.payload, slot_offset, sink, display);
                queue.message_done(msg);
                match result {
                    Ok(()) => {
                        if pipeline.has_format() {
                            state.lock().unwrap().format_valid = true;
                        }
                    }
                    Err(crate::frame::FrameError::UnknownFormat(t)) => {
                        return Err(CoreError::Fatal(format!("unknown frame type {t}")));
                    }
                    Err(crate::frame::FrameError::Malformed) => {
                        log::warn!("malformed frame descriptor, restarting session");
                        restart.store(true, Ordering::Release);
                        return Ok(());
                    }
                    Err(e) => {
                        log::warn!("frame pipeline error: {e}");
                    }
                }
            }
            Ok(None) => {
                metrics::counter!(m::QUEUE_EMPTY_POLLS).increment(1);
                thread::sleep(Duration::from_millis(empty_sleep_ms));
            }
            Err(QueueError::InvalidSession) => {
                log::info!("frame queue session invalid, restarting");
                restart.store(true, Ordering::Release);
                return Ok(());
            }
            Err(e) => return Err(CoreError::Queue(e)),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cursor_task(
    mut queue: Queue<'_>,
    sink: &mut dyn CursorSink,
    display: &dyn DisplaySink,
    requests: Receiver<CursorPosRequest>,
    host_features: u32,
    shutdown: &AtomicBool,
    restart: &AtomicBool,
    empty_sleep_ms: u64,
    local_pointer: &Mutex<(i16, i16)>,
) -> Result<(), CoreError> {
    let mut pipeline = CursorPipeline::new();

    loop {
        if shutdown.load(Ordering::Acquire) || restart.load(Ordering::Acquire) {
            return Ok(());
        }

        while let Ok(req) = requests.try_recv() {
            let result = cursor::set_cursor_pos(&mut queue, host_features, req.x, req.y);
            let _ = req.reply.send(result);
        }

        let (lx, ly) = *local_pointer.lock().unwrap();
        pipeline.note_local_pointer(lx, ly);

        match queue.process() {
            Ok(Some(msg)) => {
                let tag = msg.tag;
                let result = pipeline.process(msg.payload, tag, sink, display);
                queue.message_done(msg);
                if let Err(e) = result {
                    log::warn!("malformed cursor descriptor, keeping last valid state: {e}");
                }
            }
            Ok(None) => {
                metrics::counter!(m::QUEUE_EMPTY_POLLS).increment(1);
                thread::sleep(Duration::from_millis(empty_sleep_ms));
            }
            Err(QueueError::InvalidSession) => {
                log::info!("pointer queue session invalid, restarting");
                restart.store(true, Ordering::Release);
                return Ok(());
            }
            Err(e) => return Err(CoreError::Queue(e)),
        }
    }
}

fn watchdog_task(transport: &Transport, shutdown: &AtomicBool, restart: &AtomicBool, check_ms: u64) {
    loop {
        if shutdown.load(Ordering::Acquire) || restart.load(Ordering::Acquire) {
            return;
        }
        if !transport.session_valid() {
            log::info!("session watchdog observed a dead heartbeat, restarting");
            restart.store(true, Ordering::Release);
            return;
        }
        sleep_checking_shutdown(Duration::from_millis(check_ms), shutdown);
    }
}
